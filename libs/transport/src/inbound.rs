//! Inbound source: subscription polling and per-session reassembly
//!
//! A [`SubscriptionAgent`] runs on the agent runner thread, polls a medium
//! subscription, reassembles fragmented messages per remote session in
//! [`SessionBuffers`] and hands complete messages to the async pipeline over a
//! bounded channel. When the channel is full the agent stops polling until it
//! has flushed, so backpressure reaches the medium instead of growing memory.
//!
//! [`SessionBuffers`] is the resource-lifecycle handle of an inbound stream:
//! when the medium reports a session unavailable, its partial buffer is
//! released.

use crate::agent::Agent;
use crate::error::{Result, TransportError};
use crate::medium::{Fragment, Subscription};
use crate::supervisor::ResourceLifecycle;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Fragments handed to the poll handler per duty cycle
pub const DEFAULT_FRAGMENT_LIMIT: usize = 16;

/// Complete message received on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    pub session_id: i32,
    pub buffer: Bytes,
}

#[derive(Debug, Default)]
struct SessionState {
    partial: Option<BytesMut>,
    messages: u64,
}

/// Per-session reassembly buffers
#[derive(Debug)]
pub struct SessionBuffers {
    sessions: Mutex<HashMap<i32, SessionState>>,
    max_message_size: usize,
}

impl SessionBuffers {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_message_size,
        }
    }

    /// Feed one fragment; returns the complete message once its last fragment arrived
    pub fn on_fragment(&self, fragment: Fragment) -> Option<AssembledMessage> {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(fragment.session_id).or_default();

        if fragment.is_begin() && fragment.is_end() {
            state.partial = None;
            state.messages += 1;
            return Some(AssembledMessage {
                session_id: fragment.session_id,
                buffer: fragment.payload,
            });
        }

        if fragment.is_begin() {
            if state.partial.is_some() {
                debug!(session_id = fragment.session_id, "discarding incomplete message");
            }
            state.partial = Some(BytesMut::from(&fragment.payload[..]));
            return None;
        }

        let Some(partial) = state.partial.as_mut() else {
            debug!(session_id = fragment.session_id, "fragment without begin, dropped");
            return None;
        };

        if partial.len() + fragment.payload.len() > self.max_message_size {
            warn!(
                session_id = fragment.session_id,
                max_message_size = self.max_message_size,
                "reassembled message exceeds maximum size, dropped"
            );
            state.partial = None;
            return None;
        }
        partial.extend_from_slice(&fragment.payload);

        if fragment.is_end() {
            let buffer = state.partial.take().map(BytesMut::freeze).unwrap_or_default();
            state.messages += 1;
            return Some(AssembledMessage {
                session_id: fragment.session_id,
                buffer,
            });
        }
        None
    }

    /// Sessions seen and not yet released
    pub fn sessions(&self) -> Vec<i32> {
        let mut ids: Vec<_> = self.sessions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn pending_bytes(&self, session_id: i32) -> usize {
        self.sessions
            .lock()
            .get(&session_id)
            .and_then(|state| state.partial.as_ref())
            .map_or(0, BytesMut::len)
    }
}

impl ResourceLifecycle for SessionBuffers {
    fn on_session_unavailable(&self, session_id: i32) {
        if let Some(state) = self.sessions.lock().remove(&session_id) {
            debug!(
                session_id,
                messages = state.messages,
                pending_bytes = state.partial.as_ref().map_or(0, BytesMut::len),
                "released session buffers"
            );
        }
    }
}

/// Polls one subscription on the agent runner thread
pub struct SubscriptionAgent {
    name: String,
    subscription: Box<dyn Subscription>,
    buffers: Arc<SessionBuffers>,
    output: Option<mpsc::Sender<Result<AssembledMessage>>>,
    pending: VecDeque<Result<AssembledMessage>>,
    fragment_limit: usize,
    /// Close error queued; output is released once it has been handed over
    closing: bool,
}

impl SubscriptionAgent {
    pub fn new(
        name: impl Into<String>,
        subscription: Box<dyn Subscription>,
        buffers: Arc<SessionBuffers>,
        output: mpsc::Sender<Result<AssembledMessage>>,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            buffers,
            output: Some(output),
            pending: VecDeque::new(),
            fragment_limit: DEFAULT_FRAGMENT_LIMIT,
            closing: false,
        }
    }

    /// Returns true while items are still waiting for channel capacity
    fn flush(&mut self) -> bool {
        let Some(output) = &self.output else {
            self.pending.clear();
            return false;
        };

        while let Some(item) = self.pending.pop_front() {
            match output.try_send(item) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(item)) => {
                    self.pending.push_front(item);
                    return true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // pipeline gone, stop delivering
                    self.output = None;
                    self.pending.clear();
                    return false;
                }
            }
        }
        false
    }
}

impl Agent for SubscriptionAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn do_work(&mut self) -> usize {
        if self.output.is_none() {
            return 0;
        }
        if self.flush() {
            return 0;
        }
        if self.closing {
            self.output = None;
            return 0;
        }

        if self.subscription.is_closed() {
            self.pending.push_back(Err(TransportError::closed(format!(
                "subscription {} closed",
                self.name
            ))));
            self.closing = true;
            if !self.flush() {
                self.output = None;
            }
            return 1;
        }

        let buffers = Arc::clone(&self.buffers);
        let pending = &mut self.pending;
        let polled = self.subscription.poll(
            &mut |fragment| {
                if let Some(message) = buffers.on_fragment(fragment) {
                    pending.push_back(Ok(message));
                }
            },
            self.fragment_limit,
        );

        self.flush();
        polled
    }

    fn on_close(&mut self) {
        self.subscription.close();
        debug!(agent = %self.name, "subscription closed");
    }
}

/// Adapt the agent's output channel into a stream for the async pipeline
pub fn assembled_messages(
    receiver: mpsc::Receiver<Result<AssembledMessage>>,
) -> impl Stream<Item = Result<AssembledMessage>> + Send {
    stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    })
}
