//! Stream Fault Supervisor
//!
//! Every stream pipeline is expected to live as long as the transport, so a
//! pipeline that completes, successfully or not, is relaunched from scratch
//! with the same descriptor unless shutdown has begun. There is no backoff
//! and no restart cap at this layer; a medium that is gone for good surfaces
//! through fatal error escalation instead.
//!
//! The latest resource-lifecycle handle of each inbound stream is kept in the
//! [`ResourceRegistry`] so session-unavailable notifications reach the
//! currently active pipeline.

use crate::error::Result;
use crate::lifecycle::ShutdownFlag;
use crate::medium::Endpoint;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const CONTROL_STREAM_ID: i32 = 1;
pub const ORDINARY_STREAM_ID: i32 = 2;
pub const LARGE_STREAM_ID: i32 = 3;

/// Per-remote-session resources of an inbound pipeline
pub trait ResourceLifecycle: Send + Sync {
    fn on_session_unavailable(&self, session_id: i32);
}

/// The fixed set of stream kinds with their kind-specific parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Control { give_up_after: Duration },
    Ordinary { lanes: usize, give_up_after: Duration },
    Large { give_up_after: Duration },
}

impl StreamKind {
    pub fn stream_id(&self) -> i32 {
        match self {
            StreamKind::Control { .. } => CONTROL_STREAM_ID,
            StreamKind::Ordinary { .. } => ORDINARY_STREAM_ID,
            StreamKind::Large { .. } => LARGE_STREAM_ID,
        }
    }

    pub fn give_up_after(&self) -> Duration {
        match *self {
            StreamKind::Control { give_up_after }
            | StreamKind::Ordinary { give_up_after, .. }
            | StreamKind::Large { give_up_after } => give_up_after,
        }
    }

    /// Inbound lanes, only the ordinary stream runs more than one
    pub fn lanes(&self) -> usize {
        match *self {
            StreamKind::Ordinary { lanes, .. } => lanes.max(1),
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Control { .. } => "control",
            StreamKind::Ordinary { .. } => "ordinary",
            StreamKind::Large { .. } => "large",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Identifies a logical stream, immutable once created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub direction: Direction,
    /// Remote endpoint of outbound streams
    pub remote: Option<Endpoint>,
}

impl StreamDescriptor {
    pub fn inbound(kind: StreamKind) -> Self {
        Self {
            kind,
            direction: Direction::Inbound,
            remote: None,
        }
    }

    pub fn outbound(kind: StreamKind, remote: Endpoint) -> Self {
        Self {
            kind,
            direction: Direction::Outbound,
            remote: Some(remote),
        }
    }

    pub fn stream_id(&self) -> i32 {
        self.kind.stream_id()
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.direction, &self.remote) {
            (Direction::Inbound, _) => write!(f, "inbound-{}", self.kind.name()),
            (Direction::Outbound, Some(remote)) => write!(f, "outbound-{}-{}", self.kind.name(), remote),
            (Direction::Outbound, None) => write!(f, "outbound-{}", self.kind.name()),
        }
    }
}

/// A materialized pipeline
pub struct LaunchedStream {
    pub resources: Option<Arc<dyn ResourceLifecycle>>,
    pub completion: BoxFuture<'static, Result<()>>,
}

/// Builds a pipeline for a descriptor, from scratch on every call
pub trait StreamLauncher: Send + Sync {
    fn launch(&self, descriptor: &StreamDescriptor) -> Result<LaunchedStream>;
}

/// Latest resource-lifecycle handle per inbound stream id
#[derive(Default)]
pub struct ResourceRegistry {
    handles: RwLock<HashMap<i32, Arc<dyn ResourceLifecycle>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream_id: i32, handle: Arc<dyn ResourceLifecycle>) {
        self.handles.write().insert(stream_id, handle);
    }

    pub fn remove(&self, stream_id: i32) {
        self.handles.write().remove(&stream_id);
    }

    pub fn current(&self, stream_id: i32) -> Option<Arc<dyn ResourceLifecycle>> {
        self.handles.read().get(&stream_id).cloned()
    }

    /// Dispatch a session-unavailable notification to every active handle
    pub fn release_session(&self, session_id: i32) {
        let handles: Vec<_> = self.handles.read().values().cloned().collect();
        for handle in handles {
            handle.on_session_unavailable(session_id);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run state of one supervised stream, written only by its restart loop
#[derive(Debug, Default)]
pub struct StreamRunState {
    launches: AtomicU64,
    restarts: AtomicU64,
    failed_launches: AtomicU64,
}

impl StreamRunState {
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Acquire)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Acquire)
    }

    pub fn failed_launches(&self) -> u64 {
        self.failed_launches.load(Ordering::Acquire)
    }
}

/// Restart-on-completion supervisor for stream pipelines
pub struct StreamSupervisor {
    launcher: Arc<dyn StreamLauncher>,
    registry: Arc<ResourceRegistry>,
    shutdown: ShutdownFlag,
    states: Mutex<HashMap<String, Arc<StreamRunState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamSupervisor {
    pub fn new(
        launcher: Arc<dyn StreamLauncher>,
        registry: Arc<ResourceRegistry>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            launcher,
            registry,
            shutdown,
            states: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Launch `descriptor` and keep relaunching it whenever it completes.
    /// A failure of the first launch is returned to the caller.
    pub fn supervise(&self, descriptor: StreamDescriptor) -> Result<()> {
        let first = self.launcher.launch(&descriptor)?;

        let state = Arc::new(StreamRunState::default());
        state.launches.store(1, Ordering::Release);
        self.states
            .lock()
            .insert(descriptor.to_string(), Arc::clone(&state));
        register_resources(&self.registry, &descriptor, &first);

        info!(stream = %descriptor, stream_id = descriptor.stream_id(), "stream started");

        let task = tokio::spawn(restart_loop(
            descriptor,
            first,
            Arc::clone(&self.launcher),
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            state,
        ));
        self.tasks.lock().push(task);
        Ok(())
    }

    pub fn run_state(&self, descriptor: &StreamDescriptor) -> Option<Arc<StreamRunState>> {
        self.states.lock().get(&descriptor.to_string()).cloned()
    }

    /// Successful relaunches of `descriptor`, zero when never supervised
    pub fn restart_count(&self, descriptor: &StreamDescriptor) -> u64 {
        self.run_state(descriptor).map_or(0, |state| state.restarts())
    }

    pub fn launch_count(&self, descriptor: &StreamDescriptor) -> u64 {
        self.run_state(descriptor).map_or(0, |state| state.launches())
    }

    /// Mark shutdown, give the restart loops `grace` to observe their pipelines
    /// completing, then abort the rest
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.set();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(grace, futures::future::join_all(tasks)).await;
        if joined.is_err() {
            debug!(streams = aborts.len(), "aborting supervised streams after grace period");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

fn register_resources(registry: &ResourceRegistry, descriptor: &StreamDescriptor, launched: &LaunchedStream) {
    if descriptor.direction != Direction::Inbound {
        return;
    }
    if let Some(resources) = &launched.resources {
        registry.register(descriptor.stream_id(), Arc::clone(resources));
    }
}

async fn restart_loop(
    descriptor: StreamDescriptor,
    first: LaunchedStream,
    launcher: Arc<dyn StreamLauncher>,
    registry: Arc<ResourceRegistry>,
    shutdown: ShutdownFlag,
    state: Arc<StreamRunState>,
) {
    let mut completion = first.completion;

    'supervise: loop {
        let result = completion.await;

        match &result {
            Ok(()) => debug!(stream = %descriptor, "stream completed"),
            Err(e) if e.is_terminal() => {
                debug!(stream = %descriptor, "stream ended by transport termination");
                break;
            }
            Err(e) if shutdown.is_set() => {
                debug!(stream = %descriptor, error = %e, "stream failed during shutdown");
            }
            Err(e) => warn!(stream = %descriptor, error = %e, "stream failed"),
        }

        loop {
            if shutdown.is_set() {
                break 'supervise;
            }

            match launcher.launch(&descriptor) {
                Ok(launched) => {
                    register_resources(&registry, &descriptor, &launched);
                    state.launches.fetch_add(1, Ordering::AcqRel);
                    let restarts = state.restarts.fetch_add(1, Ordering::AcqRel) + 1;
                    info!(stream = %descriptor, restarts, "stream restarted");
                    completion = launched.completion;
                    continue 'supervise;
                }
                Err(e) => {
                    state.failed_launches.fetch_add(1, Ordering::AcqRel);
                    error!(stream = %descriptor, error = %e, "stream relaunch failed");
                    // keep the executor responsive while the medium refuses
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    if descriptor.direction == Direction::Inbound {
        registry.remove(descriptor.stream_id());
    }
    debug!(stream = %descriptor, "stream supervision ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MediumError, TransportError};
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    struct Generation {
        id: usize,
        released: Mutex<Vec<i32>>,
    }

    impl ResourceLifecycle for Generation {
        fn on_session_unavailable(&self, session_id: i32) {
            self.released.lock().push(session_id);
        }
    }

    #[derive(Default)]
    struct ScriptedLauncher {
        launches: AtomicUsize,
        completions: Mutex<Vec<oneshot::Sender<Result<()>>>>,
        generations: Mutex<Vec<Arc<Generation>>>,
        fail_launches: AtomicUsize,
    }

    impl ScriptedLauncher {
        fn complete_latest(&self, result: Result<()>) {
            let sender = self.completions.lock().pop().expect("a running stream");
            let _ = sender.send(result);
        }
    }

    impl StreamLauncher for ScriptedLauncher {
        fn launch(&self, _descriptor: &StreamDescriptor) -> Result<LaunchedStream> {
            if self.fail_launches.load(Ordering::Acquire) > 0 {
                self.fail_launches.fetch_sub(1, Ordering::AcqRel);
                return Err(TransportError::startup("connection refused"));
            }
            let id = self.launches.fetch_add(1, Ordering::AcqRel) + 1;
            let (tx, rx) = oneshot::channel();
            self.completions.lock().push(tx);
            let generation = Arc::new(Generation {
                id,
                released: Mutex::new(Vec::new()),
            });
            self.generations.lock().push(Arc::clone(&generation));
            Ok(LaunchedStream {
                resources: Some(generation),
                completion: rx
                    .map(|r| r.unwrap_or_else(|_| Err(TransportError::closed("dropped"))))
                    .boxed(),
            })
        }
    }

    fn ordinary() -> StreamDescriptor {
        StreamDescriptor::inbound(StreamKind::Ordinary {
            lanes: 4,
            give_up_after: Duration::from_secs(60),
        })
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    /// Id of the generation that receives a release through the registry
    fn current_generation(launcher: &ScriptedLauncher, registry: &ResourceRegistry) -> usize {
        static PROBE: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(10_000);
        let probe = PROBE.fetch_add(1, Ordering::AcqRel);
        registry.release_session(probe);
        launcher
            .generations
            .lock()
            .iter()
            .find(|generation| generation.released.lock().contains(&probe))
            .map(|generation| generation.id)
            .expect("registered handle")
    }

    fn setup() -> (Arc<ScriptedLauncher>, StreamSupervisor, ShutdownFlag) {
        let launcher = Arc::new(ScriptedLauncher::default());
        let shutdown = ShutdownFlag::new();
        let supervisor = StreamSupervisor::new(
            launcher.clone(),
            Arc::new(ResourceRegistry::new()),
            shutdown.clone(),
        );
        (launcher, supervisor, shutdown)
    }

    #[tokio::test]
    async fn test_restarts_on_success_and_failure() {
        let (launcher, supervisor, _shutdown) = setup();
        supervisor.supervise(ordinary()).unwrap();
        let state = supervisor.run_state(&ordinary()).unwrap();
        assert_eq!(state.launches(), 1);
        assert_eq!(current_generation(&launcher, supervisor.registry()), 1);

        launcher.complete_latest(Ok(()));
        wait_for(|| state.launches() == 2).await;
        assert_eq!(current_generation(&launcher, supervisor.registry()), 2);

        launcher.complete_latest(Err(TransportError::GaveUp {
            stream_id: ORDINARY_STREAM_ID,
            after: Duration::from_millis(5),
        }));
        wait_for(|| state.launches() == 3).await;
        assert_eq!(supervisor.restart_count(&ordinary()), 2);
        assert_eq!(current_generation(&launcher, supervisor.registry()), 3);
    }

    #[tokio::test]
    async fn test_no_restart_after_shutdown_flag() {
        let (launcher, supervisor, shutdown) = setup();
        supervisor.supervise(ordinary()).unwrap();
        let state = supervisor.run_state(&ordinary()).unwrap();

        shutdown.set();
        launcher.complete_latest(Err(TransportError::closed("medium closed")));

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.launches(), 1);
        assert_eq!(launcher.launches.load(Ordering::Acquire), 1);
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_terminated_stream_is_not_restarted() {
        let (launcher, supervisor, _shutdown) = setup();
        supervisor.supervise(ordinary()).unwrap();
        let state = supervisor.run_state(&ordinary()).unwrap();

        launcher.complete_latest(Err(TransportError::terminated(MediumError::DriverTimeout(
            "no heartbeat".into(),
        ))));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.launches(), 1);
    }

    #[tokio::test]
    async fn test_first_launch_failure_is_returned() {
        let (launcher, supervisor, _shutdown) = setup();
        launcher.fail_launches.store(1, Ordering::Release);
        assert!(supervisor.supervise(ordinary()).is_err());
        assert!(supervisor.run_state(&ordinary()).is_none());
    }

    #[tokio::test]
    async fn test_failed_relaunch_is_retried() {
        let (launcher, supervisor, _shutdown) = setup();
        supervisor.supervise(ordinary()).unwrap();
        let state = supervisor.run_state(&ordinary()).unwrap();

        launcher.fail_launches.store(3, Ordering::Release);
        launcher.complete_latest(Ok(()));
        wait_for(|| state.launches() == 2).await;
        assert_eq!(state.failed_launches(), 3);
    }

    #[tokio::test]
    async fn test_release_session_reaches_current_handle() {
        let (launcher, supervisor, _shutdown) = setup();
        supervisor.supervise(ordinary()).unwrap();
        let state = supervisor.run_state(&ordinary()).unwrap();
        launcher.complete_latest(Ok(()));
        wait_for(|| state.launches() == 2).await;

        supervisor.registry().release_session(42);
        let generations = launcher.generations.lock();
        assert!(generations[0].released.lock().is_empty());
        assert_eq!(*generations[1].released.lock(), vec![42]);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_loops() {
        let (_launcher, supervisor, shutdown) = setup();
        supervisor.supervise(ordinary()).unwrap();

        supervisor.shutdown(Duration::from_millis(10)).await;
        assert!(shutdown.is_set());
    }

    #[test]
    fn test_descriptor_names() {
        let control = StreamDescriptor::outbound(
            StreamKind::Control {
                give_up_after: Duration::from_secs(1),
            },
            Endpoint::new("10.0.0.2", 25520),
        );
        assert_eq!(control.to_string(), "outbound-control-udp://10.0.0.2:25520");
        assert_eq!(control.stream_id(), CONTROL_STREAM_ID);
        assert_eq!(ordinary().to_string(), "inbound-ordinary");
        assert_eq!(ordinary().kind.lanes(), 4);
    }
}
