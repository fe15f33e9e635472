//! Background Agent Runner
//!
//! Runs registered [`Agent`]s on one dedicated OS thread so medium I/O makes
//! progress independently of the async pipelines. Each duty cycle drains
//! registration commands, invokes every agent once and hands the total work
//! count to the [`IdleState`].
//!
//! ```text
//!   add()/remove() ──► command channel ──┐
//!                                         ▼
//!                        ┌─ duty cycle ─────────────────┐
//!                        │ drain commands               │
//!                        │ work = Σ agent.do_work()     │
//!                        │ idle.idle(work)              │
//!                        └──────────────────────────────┘
//! ```
//!
//! `stop()` is cooperative: it raises the stop flag and waits for the thread's
//! exit signal for at most `stop_timeout`.

use crate::error::{Result, TransportError};
use crate::idle::{IdleState, IdleStrategy};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Unit of polling work driven by the runner thread
pub trait Agent: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Perform one bounded slice of work, returning how much was done
    fn do_work(&mut self) -> usize;

    /// Called on the runner thread when the agent is removed or the runner stops
    fn on_close(&mut self) {}
}

/// Registration handle returned by [`AgentRunner::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId(u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

enum Command {
    Add(AgentId, Box<dyn Agent>),
    Remove(AgentId),
}

/// Dedicated polling thread
pub struct AgentRunner {
    name: String,
    idle_strategy: IdleStrategy,
    stop_timeout: Duration,
    commands: Sender<Command>,
    pending: Mutex<Option<Receiver<Command>>>,
    started: AtomicBool,
    stop_requested: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    exited: Mutex<Option<oneshot::Receiver<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl AgentRunner {
    pub fn new(name: impl Into<String>, idle_strategy: IdleStrategy, stop_timeout: Duration) -> Self {
        let (commands, pending) = unbounded();
        Self {
            name: name.into(),
            idle_strategy,
            stop_timeout,
            commands,
            pending: Mutex::new(Some(pending)),
            started: AtomicBool::new(false),
            stop_requested: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(false)),
            exited: Mutex::new(None),
            thread: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the runner thread, fails if already started
    pub fn start(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::already_started(format!("agent runner {}", self.name)));
        }

        let commands = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| TransportError::already_started(format!("agent runner {}", self.name)))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        let stop_requested = Arc::clone(&self.stop_requested);
        let alive = Arc::clone(&self.alive);
        let idle = IdleState::new(self.idle_strategy);
        let name = self.name.clone();

        alive.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                info!(runner = %name, "agent runner started");
                run_duty_cycles(&name, commands, &stop_requested, idle);
                alive.store(false, Ordering::Release);
                info!(runner = %name, "agent runner exiting");
                let _ = exit_tx.send(());
            })
            .map_err(|e| {
                self.alive.store(false, Ordering::Release);
                TransportError::io(format!("failed to spawn agent runner {}", self.name), e)
            })?;

        *self.exited.lock() = Some(exit_rx);
        *self.thread.lock() = Some(handle);
        debug!(runner = %self.name, strategy = ?self.idle_strategy, "agent runner thread spawned");
        Ok(())
    }

    /// Register an agent; it is picked up on the next duty cycle
    pub fn add(&self, agent: Box<dyn Agent>) -> AgentId {
        let id = AgentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self.commands.send(Command::Add(id, agent)).is_err() {
            warn!(runner = %self.name, agent_id = %id, "agent runner gone, agent dropped");
        }
        id
    }

    /// Unregister an agent; its `on_close` runs on the runner thread
    pub fn remove(&self, id: AgentId) {
        let _ = self.commands.send(Command::Remove(id));
    }

    /// Signal the thread to exit without waiting
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Signal the thread to exit and wait for it, bounded by the stop timeout
    pub async fn stop(&self) -> Result<()> {
        self.request_stop();

        let exited = self.exited.lock().take();
        let Some(mut exited) = exited else {
            return Ok(());
        };

        match tokio::time::timeout(self.stop_timeout, &mut exited).await {
            Ok(Ok(())) => {
                if let Some(handle) = self.thread.lock().take() {
                    let _ = handle.join();
                }
                debug!(runner = %self.name, "agent runner stopped");
                Ok(())
            }
            Ok(Err(_)) => {
                warn!(runner = %self.name, "agent runner thread ended without exit signal");
                self.thread.lock().take();
                Ok(())
            }
            Err(_) => {
                // a later stop waits on the same thread
                *self.exited.lock() = Some(exited);
                warn!(
                    runner = %self.name,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "agent runner did not stop in time"
                );
                Err(TransportError::timeout(
                    format!("agent runner {} stop", self.name),
                    self.stop_timeout,
                ))
            }
        }
    }

    /// Whether the runner thread is currently executing duty cycles
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        // best effort, never join here
        self.request_stop();
    }
}

fn run_duty_cycles(
    name: &str,
    commands: Receiver<Command>,
    stop_requested: &AtomicBool,
    mut idle: IdleState,
) {
    let mut agents: Vec<(AgentId, Box<dyn Agent>)> = Vec::new();

    while !stop_requested.load(Ordering::Acquire) {
        loop {
            match commands.try_recv() {
                Ok(Command::Add(id, agent)) => {
                    debug!(runner = %name, agent_id = %id, agent = agent.name(), "agent added");
                    agents.push((id, agent));
                }
                Ok(Command::Remove(id)) => {
                    if let Some(pos) = agents.iter().position(|(agent_id, _)| *agent_id == id) {
                        let (_, mut agent) = agents.remove(pos);
                        agent.on_close();
                        debug!(runner = %name, agent_id = %id, "agent removed");
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let mut work = 0;
        for (_, agent) in agents.iter_mut() {
            work += agent.do_work();
        }
        idle.idle(work);
    }

    for (_, mut agent) in agents.drain(..) {
        agent.on_close();
    }
}
