//! Outbound Send Policy
//!
//! Publication offers are non-blocking and may be refused while the medium is
//! back-pressured or the peer is not yet connected. [`GiveUpSender`] keeps
//! offering until the message is accepted or the give-up duration of its
//! stream kind has passed, at which point the outbound stream fails and its
//! supervisor relaunches it.
//!
//! The outbound queue is created once per association and outlives every
//! pipeline run that drains it.

use crate::error::{Result, TransportError};
use crate::medium::{OfferOutcome, Publication};
use crate::supervisor::StreamKind;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Offers retried with a plain yield before falling back to sleeping
pub const YIELD_ATTEMPTS: u32 = 16;

/// Sleep between offers once yielding did not help
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// How long a message may wait for the medium to accept it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GiveUpPolicy {
    pub give_up_after: Duration,
}

impl GiveUpPolicy {
    pub fn for_kind(kind: &StreamKind) -> Self {
        Self {
            give_up_after: kind.give_up_after(),
        }
    }
}

/// Offers buffers to a publication under a [`GiveUpPolicy`]
#[derive(Clone)]
pub struct GiveUpSender {
    publication: Arc<dyn Publication>,
    stream_id: i32,
    policy: GiveUpPolicy,
    retry_interval: Duration,
}

impl GiveUpSender {
    pub fn new(publication: Arc<dyn Publication>, stream_id: i32, policy: GiveUpPolicy) -> Self {
        Self {
            publication,
            stream_id,
            policy,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval.max(Duration::from_micros(1));
        self
    }

    pub fn policy(&self) -> GiveUpPolicy {
        self.policy
    }

    /// Offer `buffer` until accepted. Fails immediately on a closed
    /// publication and with `GaveUp` once the give-up duration has passed.
    pub async fn send(&self, buffer: &[u8]) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.policy.give_up_after;
        let mut attempts: u32 = 0;

        loop {
            let outcome = self.publication.offer(buffer);
            match outcome {
                OfferOutcome::Accepted => return Ok(()),
                OfferOutcome::Closed => {
                    return Err(TransportError::closed(format!(
                        "publication for stream {} closed",
                        self.stream_id
                    )))
                }
                OfferOutcome::BackPressured | OfferOutcome::NotConnected | OfferOutcome::AdminAction => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    stream_id = self.stream_id,
                    give_up_after_ms = self.policy.give_up_after.as_millis() as u64,
                    attempts,
                    last_outcome = ?outcome,
                    "gave up sending message"
                );
                return Err(TransportError::GaveUp {
                    stream_id: self.stream_id,
                    after: now.duration_since(started),
                });
            }

            attempts = attempts.saturating_add(1);
            if attempts <= YIELD_ATTEMPTS {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.retry_interval.min(deadline - now)).await;
            }
        }
    }

    pub fn close(&self) {
        self.publication.close();
    }
}

/// Receiving side of an outbound queue, shared by successive pipeline runs
pub type OutboundQueue = Arc<Mutex<mpsc::Receiver<Bytes>>>;

/// Bounded outbound queue for one association
pub fn outbound_queue(capacity: usize) -> (mpsc::Sender<Bytes>, OutboundQueue) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (sender, Arc::new(Mutex::new(receiver)))
}

/// Drain `queue` through `sender`. The first failed send completes the run
/// with that error; messages still queued wait for the next run. The
/// publication is closed whichever way the run ends.
pub async fn run_outbound(queue: OutboundQueue, sender: GiveUpSender) -> Result<()> {
    let result = drain(&queue, &sender).await;
    sender.close();
    result
}

async fn drain(queue: &OutboundQueue, sender: &GiveUpSender) -> Result<()> {
    let mut receiver = queue.lock().await;
    let mut sent: u64 = 0;

    while let Some(message) = receiver.recv().await {
        if let Err(e) = sender.send(&message).await {
            debug!(stream_id = sender.stream_id, sent, error = %e, "outbound run failed");
            return Err(e);
        }
        sent += 1;
    }

    debug!(stream_id = sender.stream_id, sent, "outbound queue closed");
    Ok(())
}
