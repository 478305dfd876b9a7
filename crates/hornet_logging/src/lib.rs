//! Shared logging setup for the Hornet binary.
//!
//! Builds a `tracing` subscriber from the configured minimum severity,
//! with an optional Slack layer that mirrors operator-relevant records to
//! chat channels. The `HORNET_LOG` environment variable overrides the
//! configured filter with a full `EnvFilter` directive string.

pub mod slack;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target for operator-facing notices (file completions and the like).
/// `tracing` has no NOTICE level between INFO and WARN; events emitted
/// under this target stand in for it and are mirrored to the notices
/// channel when Slack is active.
pub const NOTICE_TARGET: &str = "notice";

const LOG_ENV_VAR: &str = "HORNET_LOG";

/// Map a configured severity name onto a tracing directive.
///
/// Accepts the severities of the historical configuration schema; the two
/// names without a tracing equivalent collapse onto their neighbors
/// (notice -> info, critical -> error).
pub fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "notice" | "info" => "info",
        "warning" | "warn" => "warn",
        "critical" | "error" => "error",
        _ => "info",
    }
}

/// Initialize the global subscriber. `verbose` forces debug regardless of
/// the configured level; `slack_layer` is present when the chat sink is
/// active.
pub fn init_logging(
    level: &str,
    verbose: bool,
    slack_layer: Option<slack::SlackLayer>,
) -> anyhow::Result<()> {
    let directive = if verbose { "debug" } else { level_directive(level) };
    // Notices must survive a filter raised above INFO.
    let default_filter = format!("{directive},{NOTICE_TARGET}=info");
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(slack_layer)
        .try_init()?;
    Ok(())
}
