//! Remote transport façade
//!
//! Composes the lifecycle, the stream supervisor and the medium stream
//! launcher. Starting the transport brings the medium session up and puts
//! every inbound stream under supervision; [`RemoteTransport::associate`]
//! opens the outbound streams towards one remote node.

use crate::envelope::{EnvelopeDecoder, InboundHandler};
use crate::error::{Result, TransportError};
use crate::lifecycle::{LifecycleState, RuntimeHandle, ShutdownReport, TransportLifecycle};
use crate::medium::{EmbeddedMediumLauncher, Endpoint, Medium};
use crate::send_policy::outbound_queue;
use crate::streams::{MediumStreamLauncher, StreamKinds};
use crate::supervisor::{StreamDescriptor, StreamKind, StreamSupervisor};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use transport_config::TransportSettings;

/// Time supervised streams get to wind down before their loops are aborted
pub const STREAM_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Outbound side of the connection to one remote node
#[derive(Debug, Clone)]
pub struct Association {
    remote: Endpoint,
    control: mpsc::Sender<Bytes>,
    ordinary: mpsc::Sender<Bytes>,
    large: Option<mpsc::Sender<Bytes>>,
}

impl Association {
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Queue a system message on the control stream
    pub async fn send_control(&self, message: Bytes) -> Result<()> {
        enqueue(&self.control, message, &self.remote).await
    }

    /// Queue an ordinary message
    pub async fn send(&self, message: Bytes) -> Result<()> {
        enqueue(&self.ordinary, message, &self.remote).await
    }

    /// Queue a message on the large-message stream, when enabled
    pub async fn send_large(&self, message: Bytes) -> Result<()> {
        let large = self.large.as_ref().ok_or_else(|| {
            TransportError::configuration("large-message stream disabled", Some("streams.large_messages"))
        })?;
        enqueue(large, message, &self.remote).await
    }
}

async fn enqueue(queue: &mpsc::Sender<Bytes>, message: Bytes, remote: &Endpoint) -> Result<()> {
    queue
        .send(message)
        .await
        .map_err(|_| TransportError::closed(format!("association to {remote} closed")))
}

/// Transport core for one actor system
pub struct RemoteTransport {
    lifecycle: Arc<TransportLifecycle>,
    launcher: Arc<MediumStreamLauncher>,
    supervisor: StreamSupervisor,
    kinds: StreamKinds,
    associations: Mutex<HashMap<Endpoint, Association>>,
}

impl RemoteTransport {
    pub fn new(
        settings: TransportSettings,
        medium: Arc<dyn Medium>,
        embedded_launcher: Option<Arc<dyn EmbeddedMediumLauncher>>,
        runtime: Arc<dyn RuntimeHandle>,
        decoder: Arc<dyn EnvelopeDecoder>,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let kinds = StreamKinds::from_settings(&settings.streams);
        let lifecycle = Arc::new(TransportLifecycle::new(settings, medium, embedded_launcher, runtime));
        let launcher = Arc::new(MediumStreamLauncher::new(Arc::clone(&lifecycle), decoder, handler));
        let supervisor = StreamSupervisor::new(
            launcher.clone(),
            Arc::clone(lifecycle.registry()),
            lifecycle.shutdown_flag(),
        );

        Self {
            lifecycle,
            launcher,
            supervisor,
            kinds,
            associations: Mutex::new(HashMap::new()),
        }
    }

    pub fn lifecycle(&self) -> &Arc<TransportLifecycle> {
        &self.lifecycle
    }

    pub fn supervisor(&self) -> &StreamSupervisor {
        &self.supervisor
    }

    pub fn kinds(&self) -> StreamKinds {
        self.kinds
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        self.launcher.local_endpoint()
    }

    /// Start the medium session and supervise every inbound stream.
    /// Nothing is left running when this fails.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.start().await?;

        for kind in self.kinds.all() {
            if let Err(e) = self.supervisor.supervise(StreamDescriptor::inbound(kind)) {
                self.shutdown().await;
                return Err(TransportError::startup(format!(
                    "inbound {} stream failed to start: {e}",
                    kind.name()
                )));
            }
        }

        info!(
            local = %self.local_endpoint(),
            streams = self.kinds.all().len(),
            "remote transport running"
        );
        Ok(())
    }

    /// Outbound streams towards `remote`, opened on first use
    pub fn associate(&self, remote: Endpoint) -> Result<Association> {
        if self.lifecycle.state() != LifecycleState::Running {
            return Err(TransportError::not_running("associate"));
        }

        let mut associations = self.associations.lock();
        if let Some(existing) = associations.get(&remote) {
            return Ok(existing.clone());
        }

        let control = self.open_outbound(self.kinds.control, &remote)?;
        let ordinary = self.open_outbound(self.kinds.ordinary, &remote)?;
        let large = match self.kinds.large {
            Some(kind) => Some(self.open_outbound(kind, &remote)?),
            None => None,
        };

        let association = Association {
            remote: remote.clone(),
            control,
            ordinary,
            large,
        };
        associations.insert(remote.clone(), association.clone());
        debug!(remote = %remote, "association opened");
        Ok(association)
    }

    fn open_outbound(&self, kind: StreamKind, remote: &Endpoint) -> Result<mpsc::Sender<Bytes>> {
        let descriptor = StreamDescriptor::outbound(kind, remote.clone());
        let queue_size = self.lifecycle.settings().streams.outbound_queue_size;
        let (sender, queue) = outbound_queue(queue_size);

        self.launcher.register_outbound(&descriptor, queue);
        if let Err(e) = self.supervisor.supervise(descriptor.clone()) {
            self.launcher.unregister_outbound(&descriptor);
            return Err(e);
        }
        Ok(sender)
    }

    /// Stop supervision and tear the medium session down
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.lifecycle.shutdown().await;
        // closing the queues lets outbound runs complete instead of being aborted
        self.associations.lock().clear();
        self.supervisor.shutdown(STREAM_SHUTDOWN_GRACE).await;
        report
    }
}
