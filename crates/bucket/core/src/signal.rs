use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tracing::info;

/// A process-wide cancellation flag shared by the controller, the watch cache
/// and the workers.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    is_terminating: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            is_terminating: Arc::new(tx),
        }
    }
}

impl ShutdownSignal {
    pub fn trap_on_sigint(&self) -> Result<()> {
        let signal = self.clone();
        ::ctrlc::set_handler(move || signal.terminate())
            .map_err(|error| anyhow!("failed to set SIGINT/SIGTERM handler: {error}"))
    }

    pub fn terminate(&self) {
        if !self.is_terminating.send_replace(true) {
            info!("Gracefully shutting down...");
        }
    }

    pub fn is_terminating(&self) -> bool {
        *self.is_terminating.borrow()
    }

    pub async fn wait_to_terminate(&self) {
        let mut rx = self.is_terminating.subscribe();
        // the sender is owned by `self`, so the channel cannot be closed here
        rx.wait_for(|is_terminating| *is_terminating).await.ok();
    }
}
