//! Shared fixtures for transport integration tests
//!
//! `LoopbackMedium` is an in-process medium: publications deliver whole
//! messages to every subscription open on the same channel and stream id.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use remote_transport::diagnostics::{DiagnosticLogReader, FileDiagnosticLog};
use remote_transport::medium::MediumCounter;
use remote_transport::{
    EmbeddedMedium, EmbeddedMediumContext, EmbeddedMediumLauncher, Endpoint, EnvelopeDecoder, Fragment,
    InboundEnvelope, InboundHandler, Medium, MediumConnection, MediumContext, MediumEventHandler,
    OfferOutcome, Publication, RecipientRef, Result, RuntimeHandle, Subscription, TransportError,
    TransportSettings,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Inbox = Arc<Mutex<VecDeque<Fragment>>>;

struct SubscriptionSlot {
    inbox: Inbox,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Bus {
    subscriptions: Mutex<HashMap<(String, i32), Vec<SubscriptionSlot>>>,
    next_session: AtomicI32,
}

impl Bus {
    fn deliver(&self, channel: &str, stream_id: i32, fragment: Fragment) -> OfferOutcome {
        let mut subscriptions = self.subscriptions.lock();
        let Some(slots) = subscriptions.get_mut(&(channel.to_string(), stream_id)) else {
            return OfferOutcome::NotConnected;
        };
        slots.retain(|slot| !slot.closed.load(Ordering::Acquire));
        if slots.is_empty() {
            return OfferOutcome::NotConnected;
        }
        for slot in slots.iter() {
            slot.inbox.lock().push_back(fragment.clone());
        }
        OfferOutcome::Accepted
    }

    /// Close every open subscription on a stream, as the medium does when an image goes away
    fn close_subscriptions(&self, stream_id: i32) -> usize {
        let subscriptions = self.subscriptions.lock();
        let mut closed = 0;
        for ((_, id), slots) in subscriptions.iter() {
            if *id != stream_id {
                continue;
            }
            for slot in slots {
                if !slot.closed.swap(true, Ordering::AcqRel) {
                    closed += 1;
                }
            }
        }
        closed
    }
}

pub struct LoopbackSubscription {
    inbox: Inbox,
    closed: Arc<AtomicBool>,
}

impl Subscription for LoopbackSubscription {
    fn poll(&mut self, handler: &mut dyn FnMut(Fragment), limit: usize) -> usize {
        let mut delivered = 0;
        while delivered < limit {
            let Some(fragment) = self.inbox.lock().pop_front() else {
                break;
            };
            handler(fragment);
            delivered += 1;
        }
        delivered
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) && self.inbox.lock().is_empty()
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct LoopbackPublication {
    bus: Arc<Bus>,
    channel: String,
    stream_id: i32,
    session_id: i32,
    closed: AtomicBool,
}

impl Publication for LoopbackPublication {
    fn offer(&self, buffer: &[u8]) -> OfferOutcome {
        if self.closed.load(Ordering::Acquire) {
            return OfferOutcome::Closed;
        }
        self.bus.deliver(
            &self.channel,
            self.stream_id,
            Fragment::unfragmented(self.session_id, Bytes::copy_from_slice(buffer)),
        )
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub struct LoopbackConnection {
    bus: Arc<Bus>,
    closed: Arc<AtomicBool>,
}

impl MediumConnection for LoopbackConnection {
    fn add_subscription(&self, channel: &Endpoint, stream_id: i32) -> Result<Box<dyn Subscription>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("connection closed"));
        }
        let inbox: Inbox = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        self.bus
            .subscriptions
            .lock()
            .entry((channel.channel(), stream_id))
            .or_default()
            .push(SubscriptionSlot {
                inbox: inbox.clone(),
                closed: closed.clone(),
            });
        Ok(Box::new(LoopbackSubscription { inbox, closed }))
    }

    fn add_publication(&self, channel: &Endpoint, stream_id: i32) -> Result<Arc<dyn Publication>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed("connection closed"));
        }
        Ok(Arc::new(LoopbackPublication {
            bus: self.bus.clone(),
            channel: channel.channel(),
            stream_id,
            session_id: self.bus.next_session.fetch_add(1, Ordering::AcqRel) + 1,
            closed: AtomicBool::new(false),
        }))
    }

    fn counters(&self) -> Vec<MediumCounter> {
        vec![MediumCounter {
            label: "subscriptions".into(),
            value: self.bus.subscriptions.lock().values().map(Vec::len).sum::<usize>() as i64,
        }]
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Default)]
pub struct LoopbackMedium {
    bus: Arc<Bus>,
    handler: Mutex<Option<Arc<dyn MediumEventHandler>>>,
    pub connection_closed: Arc<AtomicBool>,
    pub fail_connect: AtomicBool,
}

impl LoopbackMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The handler registered by the lifecycle on connect
    pub fn handler(&self) -> Arc<dyn MediumEventHandler> {
        self.handler.lock().clone().expect("connected")
    }

    pub fn close_subscriptions(&self, stream_id: i32) -> usize {
        self.bus.close_subscriptions(stream_id)
    }

    /// Hand a raw fragment to every subscription on `channel` and `stream_id`
    pub fn inject(&self, channel: &Endpoint, stream_id: i32, fragment: Fragment) -> OfferOutcome {
        self.bus.deliver(&channel.channel(), stream_id, fragment)
    }
}

impl Medium for LoopbackMedium {
    fn connect(&self, ctx: MediumContext) -> Result<Box<dyn MediumConnection>> {
        if self.fail_connect.load(Ordering::Acquire) {
            return Err(TransportError::startup("medium unreachable"));
        }
        *self.handler.lock() = Some(ctx.handler);
        Ok(Box::new(LoopbackConnection {
            bus: self.bus.clone(),
            closed: self.connection_closed.clone(),
        }))
    }

    fn open_diagnostics(&self, path: &Path) -> Result<Box<dyn DiagnosticLogReader>> {
        Ok(Box::new(FileDiagnosticLog::open(path)))
    }
}

pub struct TempEmbeddedMedium {
    directory: PathBuf,
    closes: Arc<AtomicUsize>,
}

impl EmbeddedMedium for TempEmbeddedMedium {
    fn directory(&self) -> &Path {
        &self.directory
    }

    fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Creates the medium directory and counts closes
#[derive(Default)]
pub struct TempEmbeddedLauncher {
    pub launched: Mutex<Vec<EmbeddedMediumContext>>,
    pub closes: Arc<AtomicUsize>,
}

impl EmbeddedMediumLauncher for TempEmbeddedLauncher {
    fn launch(&self, ctx: EmbeddedMediumContext) -> Result<Box<dyn EmbeddedMedium>> {
        std::fs::create_dir_all(&ctx.directory)
            .map_err(|e| TransportError::io("failed to create medium directory", e))?;
        let directory = ctx.directory.clone();
        self.launched.lock().push(ctx);
        Ok(Box::new(TempEmbeddedMedium {
            directory,
            closes: self.closes.clone(),
        }))
    }
}

#[derive(Default)]
pub struct TestRuntime {
    pub terminations: AtomicUsize,
}

impl RuntimeHandle for TestRuntime {
    fn system_name(&self) -> &str {
        "it-system"
    }

    fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::AcqRel);
    }
}

/// Test wire format: recipient uid (i32), origin uid (u64), body
pub fn encode(recipient_uid: i32, origin_uid: u64, body: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(12 + body.len());
    buffer.put_i32(recipient_uid);
    buffer.put_u64(origin_uid);
    buffer.put_slice(body);
    buffer.freeze()
}

pub struct TestDecoder;

impl EnvelopeDecoder for TestDecoder {
    fn decode(&self, session_id: i32, stream_id: i32, mut buffer: Bytes) -> Result<InboundEnvelope> {
        if buffer.len() < 12 {
            return Err(TransportError::decode(format!("short envelope: {} bytes", buffer.len())));
        }
        let recipient_uid = buffer.get_i32();
        let origin_uid = buffer.get_u64();
        Ok(InboundEnvelope {
            recipient: Some(RecipientRef {
                path: format!("/user/r{recipient_uid}"),
                uid: recipient_uid,
            }),
            origin_uid,
            session_id,
            stream_id,
            payload: buffer,
        })
    }
}

/// Records every envelope it is handed
#[derive(Default)]
pub struct RecordingHandler {
    pub received: Mutex<Vec<InboundEnvelope>>,
}

impl RecordingHandler {
    pub fn bodies_for(&self, recipient_uid: i32) -> Vec<Bytes> {
        self.received
            .lock()
            .iter()
            .filter(|e| e.recipient.as_ref().map(|r| r.uid) == Some(recipient_uid))
            .map(|e| e.payload.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }
}

#[async_trait]
impl InboundHandler for RecordingHandler {
    async fn handle(&self, envelope: InboundEnvelope) -> Result<()> {
        self.received.lock().push(envelope);
        Ok(())
    }
}

pub fn test_settings(dir: &Path) -> TransportSettings {
    let mut settings = TransportSettings::default();
    settings.transport.system_name = "it-system".into();
    settings.transport.bind_host = "127.0.0.1".into();
    settings.medium.directory = Some(dir.join("medium"));
    settings.medium.idle_cpu_level = 1;
    settings.diagnostics.initial_delay_ms = 10;
    settings.diagnostics.interval_ms = 10;
    settings.agent.stop_timeout_ms = 2_000;
    settings
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {what}");
}
