// External crates
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Cancellation root for one CLI invocation.
///
/// Every query stream gets a child of `token`, so triggering shutdown stops
/// all decoders at their next line boundary. Shutdown is triggered by Ctrl-C,
/// by the query deadline, or explicitly.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token to hand to query streams.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[instrument(
        name = "lakerunner_shutdown_trigger",
        target = "helpers::shutdown",
        level = "trace",
        skip_all
    )]
    pub fn trigger(&self) {
        tracing::trace!("Shutdown triggered, cancelling query streams");
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown once `deadline` has elapsed.
    pub fn trigger_after(&self, deadline: Duration) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    tracing::debug!(deadline_secs = deadline.as_secs(), "Query deadline reached");
                    token.cancel();
                }
            }
        });
    }

    /// Trigger shutdown on Ctrl-C.
    pub fn trigger_on_ctrl_c(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                        return;
                    }
                    tracing::debug!("Ctrl-C received, stopping query");
                    token.cancel();
                }
            }
        });
    }
}
