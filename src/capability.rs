//! Capability call boundary: timeouts and cancellation for model/tool I/O

use crate::error::OrchestrationError;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_CAPABILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct CapabilityConfig {
    /// Upper bound for a single model or tool call.
    pub timeout: Duration,
}

impl CapabilityConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CAPABILITY_TIMEOUT,
        }
    }
}

/// Run a capability call bounded by `config.timeout` and `cancel`.
///
/// A timeout becomes `OrchestrationError::Capability`; cancellation becomes
/// `OrchestrationError::Cancelled`. In both cases the call future is dropped,
/// which releases its connection.
pub async fn call_with_timeout<T, F>(
    operation: &str,
    config: &CapabilityConfig,
    cancel: &CancellationToken,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestrationError::Cancelled),
        outcome = tokio::time::timeout(config.timeout, call) => match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation = %operation,
                    timeout_ms = config.timeout.as_millis() as u64,
                    "Capability call timed out"
                );
                Err(OrchestrationError::Capability(format!(
                    "{} timed out after {}ms",
                    operation,
                    config.timeout.as_millis()
                )))
            }
        },
    }
}
