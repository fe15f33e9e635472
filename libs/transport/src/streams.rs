//! Stream pipelines over the medium
//!
//! [`MediumStreamLauncher`] materializes a pipeline for each stream
//! descriptor, from scratch on every launch:
//!
//! ```text
//! inbound:  subscription ─► SubscriptionAgent ─► decode ─┬─► handler              (1 lane)
//!                          (agent runner thread)        └─► demux ─► N lanes ─► handler
//!
//! outbound: association queue ─► GiveUpSender ─► publication
//! ```
//!
//! The subscription agent is registered with the lifecycle's agent runner for
//! the lifetime of one run and removed when the run's completion resolves or
//! is dropped.

use crate::agent::{AgentId, AgentRunner};
use crate::demux::{run_lanes, DemuxLanes, InboundDemultiplexer};
use crate::envelope::{EnvelopeDecoder, InboundEnvelope, InboundHandler};
use crate::error::{Result, TransportError};
use crate::inbound::{assembled_messages, SessionBuffers, SubscriptionAgent};
use crate::lifecycle::TransportLifecycle;
use crate::medium::Endpoint;
use crate::send_policy::{run_outbound, GiveUpPolicy, GiveUpSender, OutboundQueue};
use crate::supervisor::{Direction, LaunchedStream, StreamDescriptor, StreamKind, StreamLauncher};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use transport_config::StreamSettings;

/// Largest reassembled message on the control and ordinary streams
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Largest reassembled message on the large-message stream
pub const MAX_LARGE_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// The stream kinds one transport runs, parameterized from settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamKinds {
    pub control: StreamKind,
    pub ordinary: StreamKind,
    pub large: Option<StreamKind>,
}

impl StreamKinds {
    pub fn from_settings(settings: &StreamSettings) -> Self {
        let give_up = settings.give_up_message_after();
        Self {
            control: StreamKind::Control {
                give_up_after: settings.give_up_system_message_after(),
            },
            ordinary: StreamKind::Ordinary {
                lanes: settings.inbound_lanes,
                give_up_after: give_up,
            },
            large: settings
                .large_messages
                .then_some(StreamKind::Large { give_up_after: give_up }),
        }
    }

    pub fn all(&self) -> Vec<StreamKind> {
        let mut kinds = vec![self.control, self.ordinary];
        kinds.extend(self.large);
        kinds
    }
}

/// Removes an agent from the runner when the run it belongs to ends
struct AgentRegistration {
    runner: Arc<AgentRunner>,
    id: AgentId,
}

impl Drop for AgentRegistration {
    fn drop(&mut self) {
        self.runner.remove(self.id);
    }
}

/// Launches the concrete pipelines over the lifecycle's medium connection
pub struct MediumStreamLauncher {
    lifecycle: Arc<TransportLifecycle>,
    local: Endpoint,
    decoder: Arc<dyn EnvelopeDecoder>,
    handler: Arc<dyn InboundHandler>,
    lane_buffer: usize,
    outbound_queues: Mutex<HashMap<String, OutboundQueue>>,
}

impl MediumStreamLauncher {
    pub fn new(
        lifecycle: Arc<TransportLifecycle>,
        decoder: Arc<dyn EnvelopeDecoder>,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let settings = lifecycle.settings();
        let local = Endpoint::new(settings.transport.bind_host.clone(), settings.transport.bind_port);
        let lane_buffer = settings.streams.lane_buffer_size;
        Self {
            lifecycle,
            local,
            decoder,
            handler,
            lane_buffer,
            outbound_queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Attach the queue an outbound descriptor drains; it outlives every run
    pub fn register_outbound(&self, descriptor: &StreamDescriptor, queue: OutboundQueue) {
        self.outbound_queues.lock().insert(descriptor.to_string(), queue);
    }

    pub fn unregister_outbound(&self, descriptor: &StreamDescriptor) {
        self.outbound_queues.lock().remove(&descriptor.to_string());
    }

    fn launch_inbound(&self, descriptor: &StreamDescriptor) -> Result<LaunchedStream> {
        let kind = descriptor.kind;
        let stream_id = kind.stream_id();
        let connection = self.lifecycle.connection()?;
        let subscription = connection.add_subscription(&self.local, stream_id)?;

        let max_message_size = match kind {
            StreamKind::Large { .. } => MAX_LARGE_MESSAGE_SIZE,
            _ => MAX_MESSAGE_SIZE,
        };
        let buffers = Arc::new(SessionBuffers::new(max_message_size));
        let (output, messages) = mpsc::channel(self.lane_buffer.max(1));

        let runner = Arc::clone(self.lifecycle.runner());
        let id = runner.add(Box::new(SubscriptionAgent::new(
            descriptor.to_string(),
            subscription,
            Arc::clone(&buffers),
            output,
        )));
        let registration = AgentRegistration { runner, id };

        let envelopes = decoded(assembled_messages(messages), Arc::clone(&self.decoder), stream_id);
        let handler = Arc::clone(&self.handler);
        let lanes = kind.lanes();

        let pipeline: BoxFuture<'static, Result<()>> = if lanes > 1 {
            let demux = InboundDemultiplexer::new(lanes, self.lane_buffer).run(envelopes);
            run_partitioned(demux, handler).boxed()
        } else {
            run_single_lane(envelopes, handler).boxed()
        };

        debug!(stream = %descriptor, stream_id, lanes, agent_id = %id, "inbound pipeline launched");
        let completion = async move {
            let result = pipeline.await;
            drop(registration);
            result
        };

        Ok(LaunchedStream {
            resources: Some(buffers),
            completion: completion.boxed(),
        })
    }

    fn launch_outbound(&self, descriptor: &StreamDescriptor) -> Result<LaunchedStream> {
        let remote = descriptor.remote.as_ref().ok_or_else(|| {
            TransportError::configuration(format!("outbound stream {descriptor} has no remote"), None)
        })?;
        let queue = self
            .outbound_queues
            .lock()
            .get(&descriptor.to_string())
            .cloned()
            .ok_or_else(|| TransportError::not_running(format!("outbound queue for {descriptor}")))?;

        let stream_id = descriptor.stream_id();
        let publication = self.lifecycle.connection()?.add_publication(remote, stream_id)?;
        let sender = GiveUpSender::new(publication, stream_id, GiveUpPolicy::for_kind(&descriptor.kind));

        debug!(stream = %descriptor, stream_id, "outbound pipeline launched");
        Ok(LaunchedStream {
            resources: None,
            completion: run_outbound(queue, sender).boxed(),
        })
    }
}

impl StreamLauncher for MediumStreamLauncher {
    fn launch(&self, descriptor: &StreamDescriptor) -> Result<LaunchedStream> {
        match descriptor.direction {
            Direction::Inbound => self.launch_inbound(descriptor),
            Direction::Outbound => self.launch_outbound(descriptor),
        }
    }
}

/// Decode reassembled messages; undecodable messages are dropped
fn decoded<S>(
    messages: S,
    decoder: Arc<dyn EnvelopeDecoder>,
    stream_id: i32,
) -> impl Stream<Item = Result<InboundEnvelope>> + Send + 'static
where
    S: Stream<Item = Result<crate::inbound::AssembledMessage>> + Send + 'static,
{
    messages.filter_map(move |item| {
        let decoded = match item {
            Ok(message) => match decoder.decode(message.session_id, stream_id, message.buffer) {
                Ok(envelope) => Some(Ok(envelope)),
                Err(e) => {
                    warn!(stream_id, session_id = message.session_id, error = %e, "dropping undecodable message");
                    None
                }
            },
            Err(e) => Some(Err(e)),
        };
        futures::future::ready(decoded)
    })
}

async fn run_single_lane<S>(envelopes: S, handler: Arc<dyn InboundHandler>) -> Result<()>
where
    S: Stream<Item = Result<InboundEnvelope>> + Send + 'static,
{
    let mut envelopes = Box::pin(envelopes);
    while let Some(envelope) = envelopes.next().await {
        handler.handle(envelope?).await?;
    }
    Ok(())
}

async fn run_partitioned(demux: DemuxLanes, handler: Arc<dyn InboundHandler>) -> Result<()> {
    let DemuxLanes { lanes, abort, fan_in } = demux;

    let lanes_result = run_lanes(lanes, handler, abort.clone()).await;
    let fan_in_result = match fan_in.await {
        Ok(result) => result,
        Err(e) => Err(TransportError::aborted(format!("fan-in task failed: {e}"))),
    };

    // a lane failure is the root cause of the fan-in abort
    lanes_result.and(fan_in_result)
}
