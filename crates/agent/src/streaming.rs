//! Background runs with a live event feed.
//!
//! [`Agent::run_streaming`] moves the session into one worker task and
//! returns immediately. The caller drains [`StreamingRun::events`] while
//! the run progresses and calls [`RunCompletion::wait`] for the result,
//! which hands the session back.
//!
//! The event queue is bounded. A caller that stops draining it stalls the
//! worker at its next event.

use std::sync::Arc;

use agentrelay_config::StreamingConfig;
use agentrelay_core::event::{AgentEvent, DEFAULT_EVENT_CAPACITY, EventBus, EventObserver};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collaboration::AgentRegistry;
use crate::error::AgentError;
use crate::loop_runner::{Agent, RunOutcome};
use crate::session::Session;

/// Options for a background run.
pub struct StreamOptions {
    /// Capacity of the caller's event queue.
    pub event_capacity: usize,
    pub cancel: CancellationToken,
    /// Peers the run may delegate to.
    pub peers: Option<Arc<AgentRegistry>>,
    bus: EventBus,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            cancel: CancellationToken::new(),
            peers: None,
            bus: EventBus::new(),
        }
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with the event queue sized by the `[streaming]` section.
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new().with_event_capacity(config.event_capacity)
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_peers(mut self, peers: Arc<AgentRegistry>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Attach an observer fed by its own queue of `capacity` events.
    ///
    /// The observer runs on its own task, so a slow or panicking observer
    /// can hold the run back by at most `capacity` events.
    pub fn observe<O: EventObserver>(&mut self, capacity: usize, observer: O) -> JoinHandle<()> {
        self.bus.observe(capacity, observer)
    }
}

/// What a finished background run hands back.
#[derive(Debug)]
pub struct RunReport {
    /// `None` only if the worker died without reporting.
    pub session: Option<Session>,
    pub result: Result<RunOutcome, AgentError>,
}

/// A background run in progress.
pub struct StreamingRun {
    /// Ordered lifecycle events; closes after the terminal event.
    pub events: mpsc::Receiver<AgentEvent>,
    pub completion: RunCompletion,
}

/// The terminal half of a [`StreamingRun`].
pub struct RunCompletion {
    result: oneshot::Receiver<(Session, RunOutcome)>,
    error: oneshot::Receiver<(Session, AgentError)>,
    cancel: CancellationToken,
}

impl RunCompletion {
    /// Ask the run to stop at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for whichever terminal signal arrives first.
    pub async fn wait(mut self) -> RunReport {
        tokio::select! {
            Ok((session, outcome)) = &mut self.result => RunReport {
                session: Some(session),
                result: Ok(outcome),
            },
            Ok((session, error)) = &mut self.error => RunReport {
                session: Some(session),
                result: Err(error),
            },
            else => RunReport {
                session: None,
                result: Err(AgentError::WorkerLost),
            },
        }
    }
}

impl Agent {
    /// Run one user turn on a background task.
    pub fn run_streaming(
        self: &Arc<Self>,
        session: Session,
        input: impl Into<String>,
        options: StreamOptions,
    ) -> StreamingRun {
        let StreamOptions {
            event_capacity,
            cancel,
            peers,
            mut bus,
        } = options;

        let events = bus.subscribe(event_capacity);
        let (result_tx, result) = oneshot::channel();
        let (error_tx, error) = oneshot::channel();

        let agent = Arc::clone(self);
        let input = input.into();
        let worker_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut session = session;
            let outcome = match peers.as_deref() {
                Some(peers) => {
                    agent
                        .run_with_peers(&mut session, &input, &bus, &worker_cancel, peers)
                        .await
                }
                None => agent.run(&mut session, &input, &bus, &worker_cancel).await,
            };

            // End-of-stream for every subscriber before the terminal signal.
            bus.close();
            debug!(agent = %agent.name(), ok = outcome.is_ok(), "Background run finished");

            match outcome {
                Ok(outcome) => {
                    let _ = result_tx.send((session, outcome));
                }
                Err(e) => {
                    let _ = error_tx.send((session, e));
                }
            }
        });

        StreamingRun {
            events,
            completion: RunCompletion { result, error, cancel },
        }
    }
}
