//! Production runner implementation.

use crate::network::{InboundMessage, Transport};
use crate::timers::TimerManager;
use concord_core::{Action, Event, StateMachine};
use concord_node::NodeStateMachine;
use concord_types::{EpochId, PreparedVertex, QuorumCertificate, ValidatorSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, span, trace, Level};

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("node halted: {0}")]
    Halted(String),
}

/// What the runner reports to its host.
#[derive(Debug, Clone)]
pub enum NodeNotification {
    /// Vertices committed by `proof`, in ancestor-to-descendant order.
    Committed {
        vertices: Vec<PreparedVertex>,
        proof: QuorumCertificate,
    },
    EpochChanged {
        epoch: EpochId,
        validators: ValidatorSet,
    },
    /// The node stopped; the runner exits after sending this.
    Halted { reason: String },
}

/// Handle for shutting down a running ProductionRunner.
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Builder for constructing a [`ProductionRunner`].
///
/// Required fields:
/// - `state` - The node state machine, usually from `concord_node::NodeBuilder`
/// - `transport` - Outbound network
/// - `inbound` - Messages from peers
///
/// Optional fields:
/// - `notifications` - Receives commits, epoch changes and halts
/// - `timer_capacity` - Timer event channel capacity (defaults to 1,024)
pub struct ProductionRunnerBuilder {
    state: Option<NodeStateMachine>,
    transport: Option<Arc<dyn Transport>>,
    inbound: Option<mpsc::Receiver<InboundMessage>>,
    notifications: Option<mpsc::UnboundedSender<NodeNotification>>,
    timer_capacity: usize,
}

impl Default for ProductionRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionRunnerBuilder {
    pub fn new() -> Self {
        Self {
            state: None,
            transport: None,
            inbound: None,
            notifications: None,
            timer_capacity: 1_024,
        }
    }

    pub fn state(mut self, state: NodeStateMachine) -> Self {
        self.state = Some(state);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn inbound(mut self, inbound: mpsc::Receiver<InboundMessage>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub fn notifications(mut self, tx: mpsc::UnboundedSender<NodeNotification>) -> Self {
        self.notifications = Some(tx);
        self
    }

    pub fn timer_capacity(mut self, capacity: usize) -> Self {
        self.timer_capacity = capacity;
        self
    }

    /// Build the runner. Timers are spawned on the current tokio runtime
    /// once the runner starts.
    pub fn build(self) -> Result<ProductionRunner, RunnerError> {
        let state = self.state.ok_or(RunnerError::Missing("state"))?;
        let transport = self.transport.ok_or(RunnerError::Missing("transport"))?;
        let inbound_rx = self.inbound.ok_or(RunnerError::Missing("inbound"))?;

        let (timer_tx, timer_rx) = mpsc::channel(self.timer_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        Ok(ProductionRunner {
            state,
            timer_rx,
            timer_manager: TimerManager::new(timer_tx),
            inbound_rx,
            transport,
            internal: VecDeque::new(),
            notifications: self.notifications,
            start_time: Instant::now(),
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

/// Production runner with async I/O.
///
/// A single task owns the state machine and feeds it events from the timer
/// and inbound channels. Internal events the state machine enqueues are
/// processed before the next external event.
pub struct ProductionRunner {
    /// The state machine (owned, not shared).
    state: NodeStateMachine,
    /// Timer events. Dedicated channel so timers are never starved by
    /// network floods.
    timer_rx: mpsc::Receiver<Event>,
    timer_manager: TimerManager,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    transport: Arc<dyn Transport>,
    /// Events from `Action::EnqueueInternal`.
    internal: VecDeque<Event>,
    notifications: Option<mpsc::UnboundedSender<NodeNotification>>,
    /// Start time for calculating elapsed duration.
    start_time: Instant,
    shutdown_rx: oneshot::Receiver<()>,
    /// Shutdown handle sender (stored to return to caller).
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for ProductionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionRunner")
            .field("state", &self.state)
            .field("timers", &self.timer_manager.active_count())
            .field("internal", &self.internal.len())
            .finish()
    }
}

impl ProductionRunner {
    pub fn builder() -> ProductionRunnerBuilder {
        ProductionRunnerBuilder::new()
    }

    pub fn state(&self) -> &NodeStateMachine {
        &self.state
    }

    /// Take the shutdown handle.
    ///
    /// Returns a handle that when dropped triggers graceful shutdown.
    /// Can only be called once; subsequent calls return None.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Run the main event loop until shutdown, the inbound channel closes,
    /// or the node halts.
    ///
    /// Priority order: shutdown, timers, inbound messages.
    pub async fn run(mut self) -> Result<NodeStateMachine, RunnerError> {
        info!(
            validator = %self.state.validator_id(),
            epoch = self.state.epoch().0,
            "Starting production runner"
        );
        self.dispatch(Event::Start)?;

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received");
                    break;
                }

                Some(event) = self.timer_rx.recv() => {
                    self.dispatch(event)?;
                }

                inbound = self.inbound_rx.recv() => match inbound {
                    Some(InboundMessage { sender, message }) => {
                        self.dispatch(Event::MessageReceived { sender, message })?;
                    }
                    None => {
                        info!("Inbound channel closed");
                        break;
                    }
                },
            }
        }

        self.timer_manager.cancel_all();
        info!(stats = ?self.state.stats(), "Production runner stopped");
        Ok(self.state)
    }

    /// Handle one external event and every internal event it causes.
    fn dispatch(&mut self, event: Event) -> Result<(), RunnerError> {
        self.internal.push_back(event);
        while let Some(event) = self.internal.pop_front() {
            let event_span = span!(
                Level::DEBUG,
                "handle_event",
                event.type = event.type_name(),
                validator = %self.state.validator_id(),
            );
            let _guard = event_span.enter();

            self.state.set_time(self.start_time.elapsed());
            let actions = self.state.handle(event);
            for action in actions {
                self.process_action(action)?;
            }
        }
        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(action.type = action.type_name()))]
    fn process_action(&mut self, action: Action) -> Result<(), RunnerError> {
        match action {
            Action::Send { to, message } => {
                let msg_type = message.type_name();
                if let Err(e) = self.transport.send(to, message) {
                    debug!(to = %to, msg_type, error = %e, "Send failed");
                }
            }
            Action::Broadcast { message } => {
                self.transport.broadcast(message);
            }
            Action::SetTimer { id, duration } => {
                self.timer_manager.set_timer(id, duration);
            }
            Action::CancelTimer { id } => {
                self.timer_manager.cancel_timer(id);
            }
            Action::EnqueueInternal { event } => {
                self.internal.push_back(event);
            }
            Action::EmitCommitted { vertices, proof } => {
                trace!(count = vertices.len(), view = proof.view().0, "Committed");
                self.notify(NodeNotification::Committed { vertices, proof });
            }
            Action::EmitEpochChange { epoch, validators } => {
                info!(epoch = epoch.0, validators = validators.len(), "Epoch change");
                self.notify(NodeNotification::EpochChanged { epoch, validators });
            }
            Action::Halt { reason } => {
                error!(reason = %reason, "Node halted, stopping runner");
                self.timer_manager.cancel_all();
                self.notify(NodeNotification::Halted {
                    reason: reason.clone(),
                });
                return Err(RunnerError::Halted(reason));
            }
        }
        Ok(())
    }

    fn notify(&self, notification: NodeNotification) {
        if let Some(tx) = &self.notifications {
            // The host stopped listening; keep running.
            let _ = tx.send(notification);
        }
    }
}
