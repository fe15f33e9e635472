//! Inbound Stream Demultiplexer
//!
//! Fans one ordered inbound sequence into N ordered lanes. A single fan-in
//! task reads the upstream in arrival order and routes each envelope to the
//! lane chosen by [`lane_for`]; lanes are FIFO channels, so envelopes sharing
//! a partition key keep their relative order.
//!
//! ```text
//!                          ┌──► lane 0 ──► handler
//! upstream ──► fan-in ─────┼──► lane 1 ──► handler
//!                ▲         └──► lane N-1 ─► handler
//!                │                  │
//!                └── AbortSwitch ◄──┘ first lane failure
//! ```
//!
//! The single-lane case never reaches this module.

use crate::envelope::{InboundEnvelope, InboundHandler};
use crate::error::{Result, TransportError};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const HASH_SEED: i32 = 23;

/// Inputs of the lane assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    /// Uniqueness token of the recipient's path
    pub recipient_uid: i32,
    /// Session token of the originating peer
    pub origin_uid: u64,
}

impl PartitionKey {
    pub fn hash(&self) -> i32 {
        let hash_a = HASH_SEED.wrapping_add(self.recipient_uid);
        HASH_SEED
            .wrapping_mul(hash_a)
            .wrapping_add(fold64(self.origin_uid))
    }
}

/// 64 to 32 bit fold of the origin token
fn fold64(value: u64) -> i32 {
    (value ^ (value >> 32)) as u32 as i32
}

/// Lane for an envelope; envelopes without a known recipient use lane 0
pub fn lane_for(key: Option<PartitionKey>, lanes: usize) -> usize {
    if lanes <= 1 {
        return 0;
    }
    match key {
        None => 0,
        Some(key) => (i64::from(key.hash()) % lanes as i64).unsigned_abs() as usize,
    }
}

struct AbortInner {
    reason: Mutex<Option<TransportError>>,
    notify: Notify,
}

/// Tears a whole fan-out down with the first failure reported to it
#[derive(Clone)]
pub struct AbortSwitch {
    inner: Arc<AbortInner>,
}

impl Default for AbortSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSwitch {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner {
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Abort with `reason`; returns false if already aborted
    pub fn abort(&self, reason: TransportError) -> bool {
        {
            let mut current = self.inner.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    pub fn reason(&self) -> Option<TransportError> {
        self.inner.reason.lock().clone()
    }

    /// Resolves with the abort reason once aborted
    pub async fn aborted(&self) -> TransportError {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

/// One output lane
pub struct Lane {
    index: usize,
    receiver: mpsc::Receiver<InboundEnvelope>,
}

impl Lane {
    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn recv(&mut self) -> Option<InboundEnvelope> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = InboundEnvelope> + Send {
        stream::unfold(self.receiver, |mut receiver| async move {
            receiver.recv().await.map(|envelope| (envelope, receiver))
        })
    }
}

/// Running fan-out
pub struct DemuxLanes {
    pub lanes: Vec<Lane>,
    pub abort: AbortSwitch,
    /// Completes when the upstream ends, fails or the switch aborts
    pub fan_in: JoinHandle<Result<()>>,
}

/// Partitioning fan-out for the multi-lane ordinary stream
#[derive(Debug, Clone, Copy)]
pub struct InboundDemultiplexer {
    lanes: usize,
    lane_buffer: usize,
}

impl InboundDemultiplexer {
    pub fn new(lanes: usize, lane_buffer: usize) -> Self {
        Self {
            lanes: lanes.max(1),
            lane_buffer: lane_buffer.max(1),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes
    }

    /// Start the fan-in over `upstream`; the lane count is fixed from here on
    pub fn run<S>(&self, upstream: S) -> DemuxLanes
    where
        S: Stream<Item = Result<InboundEnvelope>> + Send + 'static,
    {
        let abort = AbortSwitch::new();
        let mut senders = Vec::with_capacity(self.lanes);
        let mut lanes = Vec::with_capacity(self.lanes);

        for index in 0..self.lanes {
            let (sender, receiver) = mpsc::channel(self.lane_buffer);
            senders.push(sender);
            lanes.push(Lane { index, receiver });
        }

        let fan_in = tokio::spawn(fan_in(upstream, senders, abort.clone()));
        debug!(lanes = self.lanes, lane_buffer = self.lane_buffer, "inbound demultiplexer started");

        DemuxLanes {
            lanes,
            abort,
            fan_in,
        }
    }
}

async fn fan_in<S>(
    upstream: S,
    senders: Vec<mpsc::Sender<InboundEnvelope>>,
    abort: AbortSwitch,
) -> Result<()>
where
    S: Stream<Item = Result<InboundEnvelope>> + Send + 'static,
{
    let lane_count = senders.len();
    let mut upstream = Box::pin(upstream);

    loop {
        let item = tokio::select! {
            biased;
            reason = abort.aborted() => return Err(reason),
            item = upstream.next() => item,
        };

        let envelope = match item {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(envelope)) => envelope,
        };

        let lane = lane_for(envelope.partition_key(), lane_count);
        tokio::select! {
            biased;
            reason = abort.aborted() => return Err(reason),
            sent = senders[lane].send(envelope) => {
                if sent.is_err() {
                    return Err(TransportError::closed(format!("lane {lane} closed")));
                }
            }
        }
    }
}

/// Drive every lane through `handler` concurrently. The first lane failure
/// aborts the switch; resolves once all lanes finished.
pub async fn run_lanes(
    lanes: Vec<Lane>,
    handler: Arc<dyn InboundHandler>,
    abort: AbortSwitch,
) -> Result<()> {
    let tasks: Vec<_> = lanes
        .into_iter()
        .map(|lane| {
            let handler = Arc::clone(&handler);
            let abort = abort.clone();
            tokio::spawn(async move {
                let index = lane.index();
                let result = drain_lane(lane, handler.as_ref(), &abort).await;
                if let Err(e) = &result {
                    if abort.abort(TransportError::aborted(format!("lane {index} failed: {e}"))) {
                        warn!(lane = index, error = %e, "inbound lane failed, aborting fan-out");
                    }
                }
                result
            })
        })
        .collect();

    let mut first_error = None;
    for joined in futures::future::join_all(tasks).await {
        let result = joined.unwrap_or_else(|e| Err(TransportError::aborted(format!("lane task failed: {e}"))));
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn drain_lane(mut lane: Lane, handler: &dyn InboundHandler, abort: &AbortSwitch) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            reason = abort.aborted() => return Err(reason),
            next = lane.recv() => next,
        };
        match next {
            Some(envelope) => handler.handle(envelope).await?,
            None => return Ok(()),
        }
    }
}
