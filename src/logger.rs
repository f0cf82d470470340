//! Logging setup for the binaries and for applications embedding the solver.
//!
//! The library itself only emits `tracing` events; nothing is printed until a subscriber is
//! installed, for example with [`init_logger`].

use tracing::Level;

/// Install a fmt subscriber with the default level INFO.
///
/// Output format: `[LEVEL YYYY-MM-DD HH:MM:SS target] message`, with `file:line` instead of
/// the target for DEBUG and TRACE events. `RUST_LOG` overrides the level:
///
/// ```bash
/// RUST_LOG=debug cargo run --bin curve_fitting
/// RUST_LOG=lsq_graph::optimizer=debug cargo run --bin optimize_3d_graph -- graph.g2o
/// ```
///
/// # Example
/// ```no_run
/// use lsq_graph::init_logger;
///
/// init_logger();
/// tracing::info!("started");
/// ```
pub fn init_logger() -> bool {
    init_logger_with_level(Level::INFO)
}

/// Same as [`init_logger`] with a different default level.
///
/// Returns `false` and keeps the existing subscriber if a global one is already installed.
pub fn init_logger_with_level(default_level: Level) -> bool {
    match tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter)
        .try_init()
    {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Logger already initialized, keeping existing subscriber: {}", e);
            false
        }
    }
}

struct BracketFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use chrono::Local;

        let metadata = event.metadata();
        let level = *metadata.level();

        let label = match level {
            Level::ERROR => "\x1b[31mERROR\x1b[0m",
            Level::WARN => "\x1b[33mWARN\x1b[0m",
            Level::INFO => "\x1b[32mINFO\x1b[0m",
            Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
            _ => "\x1b[35mTRACE\x1b[0m",
        };
        write!(
            writer,
            "[{} {} ",
            label,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        match (level, metadata.file()) {
            (Level::DEBUG | Level::TRACE, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{}", filename)?;
                if let Some(line) = metadata.line() {
                    write!(writer, ":{}", line)?;
                }
            }
            _ => write!(writer, "{}", metadata.target())?,
        }
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_initialization_keeps_first_subscriber() {
        // Other tests in this binary may have installed it already.
        init_logger_with_level(Level::WARN);
        assert!(!init_logger());
        assert!(!init_logger_with_level(Level::DEBUG));
        tracing::warn!("logger initialized twice");
    }
}
