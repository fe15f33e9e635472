//! Transport Lifecycle Manager
//!
//! Owns the medium session: the optional embedded medium, the client
//! connection, the diagnostic log reader with its periodic tasks, and the
//! agent runner. Startup either reaches `Running` or releases everything it
//! created; shutdown runs exactly once and always attempts every step.
//!
//! ```text
//! Created ──start()──► Starting ──ok──► Running ──shutdown()──► Stopping ──► Stopped
//!                         │                                                   ▲
//!                         └──────────────failure (partial state released)─────┘
//! ```
//!
//! Loss of contact with the medium (client liveness or driver timeout) is
//! escalated exactly once through the [`FatalErrorLatch`]: the winning thread
//! stops the agent runner, cancels diagnostics and terminates the actor
//! runtime. Every other thread gets `TransportError::Terminated` back.

use crate::agent::AgentRunner;
use crate::diagnostics::{log_counters, DiagnosticCursor, DiagnosticLogReader};
use crate::error::{ErrorClass, MediumError, Result, TransportError};
use crate::idle::{IdleStrategy, ThreadingMode};
use crate::medium::{
    EmbeddedMedium, EmbeddedMediumContext, EmbeddedMediumLauncher, Image, Medium, MediumConnection,
    MediumContext, MediumEventHandler,
};
use crate::supervisor::ResourceRegistry;
use parking_lot::Mutex;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transport_config::TransportSettings;
use uuid::Uuid;

/// Process-wide shutdown marker shared by the lifecycle and the supervisor
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Set at most once; exactly one caller observes the transition
#[derive(Debug, Default)]
pub struct FatalErrorLatch(AtomicBool);

impl FatalErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the single caller that flipped the latch
    pub fn try_latch(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_latched(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Actor runtime owning this transport
pub trait RuntimeHandle: Send + Sync {
    fn system_name(&self) -> &str;

    /// Initiate termination of the whole runtime, must not block
    fn terminate(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    StopAgentRunner,
    CancelDiagnostics,
    CloseConnection,
    CloseDiagnosticReader,
    CloseEmbeddedMedium,
    DeleteDirectory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// Nothing to release for this step
    Skipped,
    Failed(String),
}

/// Ordered record of every shutdown step attempted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    steps: Vec<(ShutdownStep, StepOutcome)>,
}

impl ShutdownReport {
    fn record(&mut self, step: ShutdownStep, outcome: StepOutcome) {
        if let StepOutcome::Failed(reason) = &outcome {
            warn!(step = ?step, reason = %reason, "shutdown step failed");
        }
        self.steps.push((step, outcome));
    }

    fn record_result(&mut self, step: ShutdownStep, result: Result<()>) {
        let outcome = match result {
            Ok(()) => StepOutcome::Done,
            Err(e) => StepOutcome::Failed(e.to_string()),
        };
        self.record(step, outcome);
    }

    pub fn steps(&self) -> &[(ShutdownStep, StepOutcome)] {
        &self.steps
    }

    pub fn outcome(&self, step: ShutdownStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &(ShutdownStep, StepOutcome)> {
        self.steps
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StepOutcome::Failed(_)))
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

type SharedReader = Arc<Mutex<Box<dyn DiagnosticLogReader>>>;

/// State reachable from the medium's callback threads
struct LifecycleCore {
    system_name: String,
    embedded: bool,
    client_liveness_timeout_ms: u64,
    driver_timeout_ms: u64,
    latch: FatalErrorLatch,
    shutdown: ShutdownFlag,
    runner: Arc<AgentRunner>,
    registry: Arc<ResourceRegistry>,
    runtime: Arc<dyn RuntimeHandle>,
    diagnostic_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleCore {
    fn cancel_diagnostics(&self) -> usize {
        let tasks: Vec<_> = self.diagnostic_tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        tasks.len()
    }

    fn medium_kind(&self) -> &'static str {
        if self.embedded {
            "embedded"
        } else {
            "external"
        }
    }
}

impl MediumEventHandler for LifecycleCore {
    fn on_session_available(&self, image: &Image) {
        debug!(
            session_id = image.session_id,
            stream_id = image.stream_id,
            source = %image.source_identity,
            "session available"
        );
    }

    fn on_session_unavailable(&self, image: &Image) {
        debug!(
            session_id = image.session_id,
            stream_id = image.stream_id,
            source = %image.source_identity,
            "session unavailable"
        );
        self.registry.release_session(image.session_id);
    }

    fn on_error(&self, error: MediumError) -> Result<()> {
        match error.classify() {
            ErrorClass::Transient => {
                error!(system = %self.system_name, error = %error, "medium error");
                Ok(())
            }
            ErrorClass::AlreadyTerminated => Ok(()),
            ErrorClass::Fatal => {
                if !self.latch.try_latch() {
                    return Err(TransportError::terminated(error));
                }
                if self.shutdown.is_set() {
                    debug!(error = %error, "fatal medium error during shutdown, not escalated");
                    return Ok(());
                }

                error!(
                    system = %self.system_name,
                    medium = self.medium_kind(),
                    client_liveness_timeout_ms = self.client_liveness_timeout_ms,
                    driver_timeout_ms = self.driver_timeout_ms,
                    error = %error,
                    "lost contact with the {} medium, terminating the actor system; \
                     if the medium is overloaded or was paused consider raising \
                     client_liveness_timeout_ms and driver_timeout_ms",
                    self.medium_kind()
                );
                // supervised streams must not be relaunched from here on
                self.shutdown.set();
                self.runner.request_stop();
                self.cancel_diagnostics();
                self.runtime.terminate();
                Err(TransportError::terminated(error))
            }
        }
    }
}

/// Manages the medium session for one transport instance
pub struct TransportLifecycle {
    settings: TransportSettings,
    medium: Arc<dyn Medium>,
    embedded_launcher: Option<Arc<dyn EmbeddedMediumLauncher>>,
    core: Arc<LifecycleCore>,
    state: Mutex<LifecycleState>,
    embedded_medium: Mutex<Option<Box<dyn EmbeddedMedium>>>,
    directory: Mutex<Option<PathBuf>>,
    connection: Mutex<Option<Arc<dyn MediumConnection>>>,
    diagnostic_reader: Mutex<Option<SharedReader>>,
    shutdown_report: OnceCell<ShutdownReport>,
}

impl fmt::Debug for TransportLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLifecycle")
            .field("system", &self.core.system_name)
            .field("state", &*self.state.lock())
            .field("directory", &*self.directory.lock())
            .finish_non_exhaustive()
    }
}

impl TransportLifecycle {
    pub fn new(
        settings: TransportSettings,
        medium: Arc<dyn Medium>,
        embedded_launcher: Option<Arc<dyn EmbeddedMediumLauncher>>,
        runtime: Arc<dyn RuntimeHandle>,
    ) -> Self {
        let idle_strategy = IdleStrategy::for_cpu_level(settings.medium.idle_cpu_level);
        let runner = Arc::new(AgentRunner::new(
            format!("{}-transport-agent", runtime.system_name()),
            idle_strategy,
            settings.agent.stop_timeout(),
        ));

        let core = Arc::new(LifecycleCore {
            system_name: runtime.system_name().to_string(),
            embedded: settings.medium.embedded,
            client_liveness_timeout_ms: settings.medium.client_liveness_timeout_ms,
            driver_timeout_ms: settings.medium.driver_timeout_ms,
            latch: FatalErrorLatch::new(),
            shutdown: ShutdownFlag::new(),
            runner,
            registry: Arc::new(ResourceRegistry::new()),
            runtime,
            diagnostic_tasks: Mutex::new(Vec::new()),
        });

        Self {
            settings,
            medium,
            embedded_launcher,
            core,
            state: Mutex::new(LifecycleState::Created),
            embedded_medium: Mutex::new(None),
            directory: Mutex::new(None),
            connection: Mutex::new(None),
            diagnostic_reader: Mutex::new(None),
            shutdown_report: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn runner(&self) -> &Arc<AgentRunner> {
        &self.core.runner
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.core.registry
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.core.shutdown.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.core.latch.is_latched()
    }

    /// Medium directory in use, once started
    pub fn directory(&self) -> Option<PathBuf> {
        self.directory.lock().clone()
    }

    /// The open client connection
    pub fn connection(&self) -> Result<Arc<dyn MediumConnection>> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| TransportError::not_running("medium connection"))
    }

    /// Medium callback entry point, also reachable without a connection
    pub fn on_error(&self, error: MediumError) -> Result<()> {
        self.core.on_error(error)
    }

    pub fn on_session_unavailable(&self, image: &Image) {
        self.core.on_session_unavailable(image);
    }

    /// Bring the medium session up. Only valid from `Created`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Created {
                return Err(TransportError::already_started("transport lifecycle"));
            }
            *state = LifecycleState::Starting;
        }

        match self.try_start() {
            Ok(()) => {
                *self.state.lock() = LifecycleState::Running;
                info!(
                    system = %self.core.system_name,
                    medium = self.core.medium_kind(),
                    directory = ?self.directory(),
                    "transport started"
                );
                Ok(())
            }
            Err(e) => {
                error!(system = %self.core.system_name, error = %e, "transport startup failed");
                self.core.shutdown.set();
                let mut report = ShutdownReport::default();
                self.release_session(&mut report);
                debug!(steps = ?report.steps(), "released partial startup state");
                *self.state.lock() = LifecycleState::Stopped;
                Err(e)
            }
        }
    }

    fn try_start(&self) -> Result<()> {
        let directory = self.prepare_medium()?;
        *self.directory.lock() = Some(directory.clone());

        let handler: Arc<dyn MediumEventHandler> = self.core.clone();
        let connection: Arc<dyn MediumConnection> = Arc::from(self.medium.connect(MediumContext {
            directory: directory.clone(),
            driver_timeout: self.settings.medium.driver_timeout(),
            handler,
        })?);
        *self.connection.lock() = Some(Arc::clone(&connection));

        let log_path = directory.join(&self.settings.diagnostics.log_file);
        let reader: SharedReader = Arc::new(Mutex::new(self.medium.open_diagnostics(&log_path)?));
        *self.diagnostic_reader.lock() = Some(Arc::clone(&reader));

        let drain = self.spawn_diagnostic_drain(reader);
        self.core.diagnostic_tasks.lock().push(drain);
        if self.settings.medium.log_counters {
            let counters = self.spawn_counter_log(connection);
            self.core.diagnostic_tasks.lock().push(counters);
        }

        self.core.runner.start()
    }

    /// Launch the embedded medium if enabled; returns the directory to connect to
    fn prepare_medium(&self) -> Result<PathBuf> {
        let medium = &self.settings.medium;

        if !medium.embedded {
            return medium.directory.clone().ok_or_else(|| {
                TransportError::configuration(
                    "an external medium requires its directory",
                    Some("medium.directory"),
                )
            });
        }

        let launcher = self.embedded_launcher.as_ref().ok_or_else(|| {
            TransportError::configuration(
                "embedded medium enabled but no launcher provided",
                Some("medium.embedded"),
            )
        })?;

        let directory = medium.directory.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("{}-{}", self.core.system_name, Uuid::new_v4()))
        });
        let level = medium.idle_cpu_level;
        let embedded = launcher.launch(EmbeddedMediumContext {
            directory,
            client_liveness_timeout: medium.client_liveness_timeout(),
            image_liveness_timeout: medium.image_liveness_timeout(),
            driver_timeout: medium.driver_timeout(),
            threading_mode: ThreadingMode::for_cpu_level(level),
            idle_strategy: IdleStrategy::for_cpu_level(level),
        })?;

        let directory = embedded.directory().to_path_buf();
        info!(directory = %directory.display(), idle_cpu_level = level, "embedded medium launched");
        *self.embedded_medium.lock() = Some(embedded);
        Ok(directory)
    }

    fn spawn_diagnostic_drain(&self, reader: SharedReader) -> JoinHandle<()> {
        let initial_delay = self.settings.diagnostics.initial_delay();
        let period = self.settings.diagnostics.interval();
        let shutdown = self.core.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = periodic(initial_delay, period);
            let mut cursor = DiagnosticCursor::new();
            loop {
                ticker.tick().await;
                if shutdown.is_set() {
                    continue;
                }
                let mut guard = reader.lock();
                if let Err(e) = cursor.drain(&mut **guard) {
                    debug!(error = %e, "diagnostic log drain failed");
                }
            }
        })
    }

    fn spawn_counter_log(&self, connection: Arc<dyn MediumConnection>) -> JoinHandle<()> {
        let initial_delay = self.settings.diagnostics.initial_delay();
        let period = self.settings.diagnostics.interval();
        let shutdown = self.core.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = periodic(initial_delay, period);
            loop {
                ticker.tick().await;
                if !shutdown.is_set() {
                    log_counters(&connection.counters());
                }
            }
        })
    }

    /// Tear the session down; concurrent and repeated callers share one run
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_report
            .get_or_init(|| self.run_shutdown())
            .await
            .clone()
    }

    async fn run_shutdown(&self) -> ShutdownReport {
        self.core.shutdown.set();
        *self.state.lock() = LifecycleState::Stopping;
        info!(system = %self.core.system_name, "transport shutting down");

        let mut report = ShutdownReport::default();
        let stopped = self.core.runner.stop().await;
        report.record_result(ShutdownStep::StopAgentRunner, stopped);
        self.release_session(&mut report);

        *self.state.lock() = LifecycleState::Stopped;
        info!(
            system = %self.core.system_name,
            clean = report.is_clean(),
            "transport stopped"
        );
        report
    }

    /// Everything after the agent runner, in release order
    fn release_session(&self, report: &mut ShutdownReport) {
        let cancelled = self.core.cancel_diagnostics();
        debug!(tasks = cancelled, "diagnostic tasks cancelled");
        report.record(ShutdownStep::CancelDiagnostics, StepOutcome::Done);

        let connection = self.connection.lock().take();
        match connection {
            Some(connection) => report.record_result(ShutdownStep::CloseConnection, connection.close()),
            None => report.record(ShutdownStep::CloseConnection, StepOutcome::Skipped),
        }

        let reader = self.diagnostic_reader.lock().take();
        match reader {
            Some(reader) => {
                let closed = reader.lock().close();
                report.record_result(ShutdownStep::CloseDiagnosticReader, closed);
            }
            None => report.record(ShutdownStep::CloseDiagnosticReader, StepOutcome::Skipped),
        }

        let embedded = self.embedded_medium.lock().take();
        let launched = embedded.is_some();
        match embedded {
            Some(mut embedded) => report.record_result(ShutdownStep::CloseEmbeddedMedium, embedded.close()),
            None => report.record(ShutdownStep::CloseEmbeddedMedium, StepOutcome::Skipped),
        }

        let outcome = match self.directory.lock().clone() {
            Some(directory) if launched && self.settings.medium.delete_directory_on_shutdown => {
                match std::fs::remove_dir_all(&directory) {
                    Ok(()) => StepOutcome::Done,
                    Err(e) if e.kind() == ErrorKind::NotFound => StepOutcome::Done,
                    Err(e) => StepOutcome::Failed(format!(
                        "failed to delete medium directory {}: {e}",
                        directory.display()
                    )),
                }
            }
            _ => StepOutcome::Skipped,
        };
        report.record(ShutdownStep::DeleteDirectory, outcome);
    }
}

impl Drop for TransportLifecycle {
    fn drop(&mut self) {
        if self.shutdown_report.initialized() {
            return;
        }
        // best effort when dropped without shutdown, never blocks
        self.core.shutdown.set();
        self.core.runner.request_stop();
        self.core.cancel_diagnostics();
        if let Some(connection) = self.connection.lock().take() {
            if let Err(e) = connection.close() {
                warn!(step = ?ShutdownStep::CloseConnection, error = %e, "close on drop failed");
            }
        }
        if let Some(mut embedded) = self.embedded_medium.lock().take() {
            if let Err(e) = embedded.close() {
                warn!(step = ?ShutdownStep::CloseEmbeddedMedium, error = %e, "close on drop failed");
            }
        }
    }
}

fn periodic(initial_delay: Duration, period: Duration) -> tokio::time::Interval {
    let start = tokio::time::Instant::now() + initial_delay;
    let mut ticker = tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}
