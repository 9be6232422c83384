// ===============================
// src/agent.rs
// ===============================
//
// Agent contract + runner.
//
//   Created --start--> Started --spawn_cycle--> Running --stop--> Stopped
//   Stopped --start--> Started (bus subscription is not repeated)
//
// The cycle loop is perceive() -> act() -> sleep(cycle_delay). A failed or
// panicked cycle is logged and the loop carries on. handle_message() runs on
// whichever task delivered the message, concurrently with the cycle.
//
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::bus::{handler, MessageBus};
use crate::message::Message;
use crate::metrics::{AGENT_CYCLES, AGENT_CYCLE_ERRORS};
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState { Created, Started, Running, Stopped }

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot {action} agent in state {from:?}")]
    InvalidTransition { from: AgentState, action: &'static str },
    #[error("wallet row missing")]
    WalletMissing,
    #[error("handler error: {0}")]
    Handler(String),
}

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &str;
    /// Refreshes the agent's local view from the store.
    async fn perceive(&self) -> Result<(), AgentError>;
    /// Reasons on the local view and emits messages.
    async fn act(&self) -> Result<(), AgentError>;
    async fn handle_message(&self, message: Message) -> Result<(), AgentError>;
}

struct CycleTask { running: Arc<AtomicBool>, handle: JoinHandle<()> }

pub struct AgentRunner {
    agent: Arc<dyn Agent>,
    bus: MessageBus,
    cycle_delay: Duration,
    state: watch::Sender<AgentState>,
    subscribed: AtomicBool,
    task: Mutex<Option<CycleTask>>,
}

impl AgentRunner {
    pub fn new(agent: Arc<dyn Agent>, bus: MessageBus, cycle_delay: Duration) -> Self {
        let (state, _) = watch::channel(AgentState::Created);
        Self { agent, bus, cycle_delay, state, subscribed: AtomicBool::new(false), task: Mutex::new(None) }
    }

    pub fn name(&self) -> &str { self.agent.name() }

    pub fn state(&self) -> AgentState { *self.state.borrow() }

    /// Subscribes to the bus (first start only) and starts its dispatcher.
    pub async fn start(&self) -> Result<(), AgentError> {
        let from = self.state();
        if !matches!(from, AgentState::Created | AgentState::Stopped) {
            return Err(AgentError::InvalidTransition { from, action: "start" });
        }
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            let agent = self.agent.clone();
            self.bus
                .subscribe(
                    self.agent.name(),
                    handler(move |msg| {
                        let agent = agent.clone();
                        async move { agent.handle_message(msg).await }
                    }),
                )
                .await;
        }
        self.bus.start().await;
        self.state.send_replace(AgentState::Started);
        info!(agent = self.name(), "agent started");
        Ok(())
    }

    pub async fn spawn_cycle(&self) -> Result<(), AgentError> {
        let from = self.state();
        if from != AgentState::Started {
            return Err(AgentError::InvalidTransition { from, action: "run" });
        }
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let agent = self.agent.clone();
        let delay = self.cycle_delay;
        let span = info_span!("agent", name = %agent.name());
        let handle = tokio::spawn(
            async move {
                while flag.load(Ordering::SeqCst) {
                    run_cycle(agent.as_ref()).await;
                    tokio::time::sleep(delay).await;
                }
                info!("cycle loop exited");
            }
            .instrument(span),
        );
        *self.task.lock().await = Some(CycleTask { running, handle });
        self.state.send_replace(AgentState::Running);
        Ok(())
    }

    /// Clears the running flag; the loop exits at its next check.
    pub async fn stop(&self) {
        if let Some(t) = self.task.lock().await.as_ref() {
            t.running.store(false, Ordering::SeqCst);
        }
        if self.state() != AgentState::Created {
            self.state.send_replace(AgentState::Stopped);
            info!(agent = self.name(), "agent stopped");
        }
    }

    /// Waits for the cycle loop to exit (no-op if it never ran).
    pub async fn join(&self) {
        let task = self.task.lock().await.take();
        if let Some(t) = task {
            if let Err(e) = t.handle.await {
                error!(agent = self.name(), ?e, "cycle task join failed");
            }
        }
    }
}

async fn run_cycle(agent: &dyn Agent) {
    let name = agent.name();
    let outcome = AssertUnwindSafe(async {
        agent.perceive().await?;
        agent.act().await
    })
    .catch_unwind()
    .await;
    AGENT_CYCLES.with_label_values(&[name]).inc();
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            AGENT_CYCLE_ERRORS.with_label_values(&[name]).inc();
            error!(agent = name, error = %e, "cycle failed");
        }
        Err(_) => {
            AGENT_CYCLE_ERRORS.with_label_values(&[name]).inc();
            error!(agent = name, "cycle panicked");
        }
    }
}
