//! Logging setup for the apex-ddp binary and benches
//!
//! Installs a `tracing-subscriber` with an `EnvFilter` and a compact bracketed
//! formatter. Solver progress tables go through `debug!`, so running with
//! `RUST_LOG=apex_ddp=debug` prints the per-iteration FDDP table.

use tracing::{Level, Metadata};

/// Initialize the global subscriber at INFO level.
///
/// Format: `[LEVEL HH:MM:SS.mmm module] message` for INFO/WARN/ERROR and
/// `[LEVEL HH:MM:SS.mmm file:line] message` for DEBUG/TRACE.
///
/// # Example
/// ```no_run
/// use apex_ddp::init_logger;
///
/// init_logger();
/// tracing::info!("Benchmark started");
/// ```
///
/// # Environment Variables
/// `RUST_LOG` overrides the default level:
/// ```bash
/// RUST_LOG=apex_ddp=debug cargo run --bin fddp_benchmark -- --problem unicycle
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the global subscriber with a custom default level.
///
/// Calling it again once a subscriber is installed leaves the first one in place,
/// so benches and tests may call it unconditionally.
///
/// # Example
/// ```no_run
/// use apex_ddp::init_logger_with_level;
/// use tracing::Level;
///
/// init_logger_with_level(Level::DEBUG);
/// ```
pub fn init_logger_with_level(default_level: Level) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter)
        .try_init();

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
}

/// Colored level tag.
fn level_tag(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31mERROR\x1b[0m",
        Level::WARN => "\x1b[33mWARN\x1b[0m",
        Level::INFO => "\x1b[32mINFO\x1b[0m",
        Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
        Level::TRACE => "\x1b[35mTRACE\x1b[0m",
    }
}

/// Source location for verbose levels, module path otherwise.
fn location(metadata: &Metadata<'_>) -> String {
    let verbose = matches!(*metadata.level(), Level::DEBUG | Level::TRACE);
    match (verbose, metadata.file()) {
        (true, Some(file)) => {
            let filename = file.rsplit('/').next().unwrap_or(file);
            match metadata.line() {
                Some(line) => format!("{}:{}", filename, line),
                None => filename.to_string(),
            }
        }
        _ => metadata
            .target()
            .strip_prefix("apex_ddp::")
            .unwrap_or(metadata.target())
            .to_string(),
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
        let metadata = event.metadata();
        write!(
            writer,
            "[{} {} {}] ",
            level_tag(metadata.level()),
            chrono::Local::now().format("%H:%M:%S%.3f"),
            location(metadata)
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
