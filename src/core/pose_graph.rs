//! Plain-data 3D pose graphs and their conversion into a [`Problem`].

use crate::core::{CoreError, CoreResult, problem::Problem};
use crate::factors::RelativePoseResidual;
use crate::manifold::Pose3;
use nalgebra::Matrix6;
use std::collections::BTreeMap;

/// Relative pose measurement between poses `begin` and `end`.
///
/// `measurement` is `T_begin⁻¹ ∘ T_end`; `information` is ordered `[rotation, translation]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseConstraint {
    pub begin: usize,
    pub end: usize,
    pub measurement: Pose3,
    pub information: Matrix6<f64>,
}

/// Poses keyed by id plus relative constraints between them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseGraph {
    pub poses: BTreeMap<usize, Pose3>,
    pub constraints: Vec<PoseConstraint>,
}

impl PoseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pose(&mut self, id: usize, pose: Pose3) -> Option<Pose3> {
        self.poses.insert(id, pose)
    }

    pub fn add_constraint(&mut self, constraint: PoseConstraint) {
        self.constraints.push(constraint);
    }

    /// Build a problem with one pose block per pose (ascending id) and one
    /// [`RelativePoseResidual`] per constraint.
    ///
    /// Returns the problem and the map from pose id to parameter block id. A constraint that
    /// names a missing pose fails with [`CoreError::UnknownBlock`] carrying the pose id.
    pub fn build_problem(&self) -> CoreResult<(Problem, BTreeMap<usize, usize>)> {
        let mut problem = Problem::new();
        let mut block_ids = BTreeMap::new();

        for (&pose_id, pose) in &self.poses {
            block_ids.insert(pose_id, problem.add_pose_block(pose)?);
        }

        for constraint in &self.constraints {
            let lookup = |id: usize| {
                block_ids
                    .get(&id)
                    .copied()
                    .ok_or_else(|| CoreError::UnknownBlock { id }.log())
            };
            let begin = lookup(constraint.begin)?;
            let end = lookup(constraint.end)?;

            problem.add_residual(
                &[begin, end],
                Box::new(RelativePoseResidual::new(
                    constraint.measurement,
                    constraint.information,
                )),
            )?;
        }

        Ok((problem, block_ids))
    }

    /// Copy optimized values back from `problem` into the graph's poses.
    pub fn update_poses(
        &mut self,
        problem: &Problem,
        block_ids: &BTreeMap<usize, usize>,
    ) -> CoreResult<()> {
        for (pose_id, pose) in self.poses.iter_mut() {
            let block_id = block_ids
                .get(pose_id)
                .copied()
                .ok_or_else(|| CoreError::UnknownBlock { id: *pose_id }.log())?;
            let value = problem.parameter_value(block_id)?;
            *pose = Pose3::from_vector(value)
                .map_err(|e| CoreError::InvalidInput(format!("pose {pose_id}: {e}")).log())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn translation(x: f64, y: f64) -> Pose3 {
        Pose3::new(UnitQuaternion::identity(), Vector3::new(x, y, 0.0))
    }

    #[test]
    fn test_build_problem_maps_ids_in_ascending_order() -> TestResult {
        let mut graph = PoseGraph::new();
        graph.add_pose(10, translation(1.0, 0.0));
        graph.add_pose(3, translation(0.0, 0.0));
        graph.add_constraint(PoseConstraint {
            begin: 3,
            end: 10,
            measurement: translation(1.0, 0.0),
            information: Matrix6::identity(),
        });

        let (problem, block_ids) = graph.build_problem()?;
        assert_eq!(block_ids[&3], 0);
        assert_eq!(block_ids[&10], 1);
        assert_eq!(problem.num_residual_blocks(), 1);
        assert!(problem.total_cost()? < 1e-20);
        Ok(())
    }

    #[test]
    fn test_missing_pose_is_unknown_block() {
        let mut graph = PoseGraph::new();
        graph.add_pose(0, Pose3::identity());
        graph.add_constraint(PoseConstraint {
            begin: 0,
            end: 5,
            measurement: Pose3::identity(),
            information: Matrix6::identity(),
        });

        assert!(matches!(
            graph.build_problem(),
            Err(CoreError::UnknownBlock { id: 5 })
        ));
    }

    #[test]
    fn test_update_poses_round_trip() -> TestResult {
        let mut graph = PoseGraph::new();
        graph.add_pose(1, translation(2.0, 3.0));
        let (mut problem, block_ids) = graph.build_problem()?;

        let moved = translation(-1.0, 4.0);
        problem.set_parameter_value(block_ids[&1], &moved.to_vector())?;
        graph.update_poses(&problem, &block_ids)?;

        assert!(graph.poses[&1].is_approx(&moved, 1e-12));
        Ok(())
    }
}
