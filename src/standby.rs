//! Standby Forwarding
//!
//! State-changing requests accepted by the primary manager are replayed on a
//! hot-standby manager. Forwarding runs on a background task fed through a
//! channel, so the primary operation never waits on the standby and is never
//! rolled back when the standby is unreachable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::network::NetworkClient;
use crate::protocol::{Request, Response};

/// Default pause between standby retries
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Transport to the standby manager
#[async_trait]
pub trait StandbyLink: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl StandbyLink for NetworkClient {
    async fn send(&self, request: Request) -> Result<Response> {
        self.request(request).await
    }
}

/// Retry policy for standby communication errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Handle used by the manager to queue requests for the standby
pub struct StandbyForwarder {
    tx: mpsc::UnboundedSender<Request>,
}

impl StandbyForwarder {
    /// Start the forwarding task. Must be called inside a tokio runtime.
    ///
    /// The task drains the queue and exits once every forwarder handle is
    /// dropped.
    pub fn spawn(link: Arc<dyn StandbyLink>, policy: RetryPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_forwarder(link, rx, policy));
        (Self { tx }, handle)
    }

    /// Queue a request for the standby. Never blocks.
    pub fn forward(&self, request: Request) {
        let name = request.type_name();
        if self.tx.send(request).is_err() {
            tracing::warn!("Standby forwarder stopped, dropping {}", name);
        }
    }
}

async fn run_forwarder(
    link: Arc<dyn StandbyLink>,
    mut rx: mpsc::UnboundedReceiver<Request>,
    policy: RetryPolicy,
) {
    while let Some(request) = rx.recv().await {
        if let Err(e) = forward_with_retry(link.as_ref(), request, policy).await {
            tracing::warn!("Standby forwarding failed: {}", e);
        }
    }
    tracing::debug!("Standby forwarder exiting");
}

/// Send one request, retrying communication errors up to the policy limit
async fn forward_with_retry(link: &dyn StandbyLink, request: Request, policy: RetryPolicy) -> Result<()> {
    let name = request.type_name();
    let mut attempt = 0u32;

    loop {
        match link.send(request.clone()).await {
            Ok(Response::Error { code, message }) => {
                // The standby processed it and said no; resending will not help
                return Err(Error::Standby(format!("{} rejected ({:?}): {}", name, code, message)));
            }
            Ok(_) => {
                tracing::trace!("Forwarded {} to standby", name);
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "Standby communication error on {} (attempt {}/{}): {}",
                    name,
                    attempt,
                    policy.max_retries,
                    e
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
