//! Cooperative abort signal shared by the orchestrator and running containers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Fires once; every clone observes it.
///
/// Checked synchronously through [`AbortSignal::is_triggered`] and awaited
/// through [`AbortSignal::triggered`], which resolves immediately if the
/// signal already fired.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        if self.is_triggered() {
            return;
        }
        // The sender lives as long as `self`, so recv only returns on send.
        let _ = rx.recv().await;
    }
}
