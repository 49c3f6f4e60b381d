use std::io::IsTerminal;

use eyre::WrapErr as _;
use tracing::warn;
use tracing_subscriber::{
    Layer,
    filter::{EnvFilter, LevelFilter},
    prelude::*,
};

pub const SYSLOG_IDENTIFIER: &str = "ota-agent";

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

fn try_init_journal() -> eyre::Result<()> {
    let journal = tracing_journald::layer()
        .wrap_err("failed to initialize journald logger")?
        .with_syslog_identifier(SYSLOG_IDENTIFIER.to_owned())
        .with_filter(env_filter());
    tracing_subscriber::registry().with(journal).try_init()?;
    Ok(())
}

fn try_init_stdout_logger() -> eyre::Result<()> {
    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stdout)
        .with_filter(env_filter());
    let stderr_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(stderr_log.and_then(stdout_log))
        .try_init()?;
    Ok(())
}

/// Logs to journald when run as a service, to the terminal otherwise.
///
/// The console reads requests from stdin, so in console mode logs always go to the
/// terminal's stderr to keep them apart from the prompt.
pub fn init(console: bool) {
    let istty = std::io::stdin().is_terminal();
    let mut err = None;
    if !istty && !console {
        err = try_init_journal().err();
    }
    if istty || console || err.is_some() {
        let stdout_err = if console {
            try_init_console_logger().err()
        } else {
            try_init_stdout_logger().err()
        };
        err = stdout_err.or(err);
    }

    if let Some(e) = err {
        warn!("failed to initialize logger: {e:?}");
    }
}

fn try_init_console_logger() -> eyre::Result<()> {
    let stderr_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());
    tracing_subscriber::registry().with(stderr_log).try_init()?;
    Ok(())
}
