//! Tracing setup for the runtime. The filter is reloadable so the effective
//! log level follows configuration updates without a restart.

use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle for adjusting the log level at runtime.
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Swap the active filter for one built from `level`.
    pub fn set_level(&self, level: &str) {
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if let Err(err) = self.reload.reload(filter) {
                    warn!(%err, "log filter reload failed");
                }
            }
            Err(err) => warn!(level, %err, "invalid log level ignored"),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Returns `None` when a subscriber is already installed (tests, embedders
/// with their own setup); level updates are then no-ops.
#[must_use]
pub fn init_logging(level: &str) -> Option<LogHandle> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .ok()?;
    Some(LogHandle { reload: handle })
}
