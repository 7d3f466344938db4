use crate::{PaperflowError, PaperflowResult};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. With `json` set, every event is
/// emitted as one JSON object per line; otherwise the human-readable format
/// is used. Fails if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> PaperflowResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| PaperflowError::Config(format!("Failed to install tracing subscriber: {e}")))
}
