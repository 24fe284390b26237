//! Shutdown flag shared between signal listeners and event loops.
//!
//! Signals are never handled inline: a listener task records the request in a
//! single atomic cell, and loops poll it at safe points (after a blocking wait
//! returns, before each work unit). Async loops can also `wait()` on it inside a
//! `select!`.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Signals that request an orderly shutdown.
const TERMINATION_SIGNALS: [(&str, fn() -> SignalKind); 4] = [
    ("SIGINT", SignalKind::interrupt),
    ("SIGQUIT", SignalKind::quit),
    ("SIGHUP", SignalKind::hangup),
    ("SIGTERM", SignalKind::terminate),
];

#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Create a flag and route termination signals into it.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn install() -> io::Result<Self> {
        let flag = Self::new();
        for (name, kind) in TERMINATION_SIGNALS {
            let mut stream = signal(kind())?;
            let flag = flag.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    tracing::info!(signal = name, "Termination signal received");
                    flag.request();
                }
            });
        }
        tracing::debug!("Installed termination signal listeners");
        Ok(flag)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.tx.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The raw cell, for blocking loops running off the runtime.
    pub fn cell(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.requested)
    }

    /// Resolve once shutdown has been requested. Cancel-safe.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this only ends when the value flips.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}
