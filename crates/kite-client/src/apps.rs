//! Application registry and open-request serialization
//!
//! The control channel carries no request ids, so OpenApp requests go out one
//! at a time and responses correlate by order. [`AppRequests`] owns the
//! descriptor cache and the queue of pending batches; it is pure bookkeeping,
//! returning [`Action`]s for the session driver to execute on the wire.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use kite_proto::{AppDescriptor, TransportKind};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{DenyReason, SessionError};
use crate::socket::TunnelSocket;

/// What a completed batch resolves.
pub(crate) enum BatchGoal {
    /// A plain `request_apps` call.
    Apps(oneshot::Sender<Result<(), SessionError>>),
    /// An `open_socket` call that first needs the app's descriptor.
    Socket {
        app: String,
        port: u16,
        kind: TransportKind,
        resp: oneshot::Sender<Result<TunnelSocket, SessionError>>,
    },
}

/// Wire or completion work the driver must perform.
pub(crate) enum Action {
    /// Send OpenApp for this name on the control channel.
    Send(String),
    /// The batch finished; resolve its goal.
    Resolve(BatchGoal, Result<(), SessionError>),
}

struct Batch {
    names: VecDeque<String>,
    goal: BatchGoal,
}

struct Inflight {
    name: String,
    rest: VecDeque<String>,
    deadline: Instant,
    goal: BatchGoal,
}

pub(crate) struct AppRequests {
    descriptors: HashMap<String, AppDescriptor>,
    inflight: Option<Inflight>,
    queue: VecDeque<Batch>,
    timeout: Duration,
}

impl AppRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            descriptors: HashMap::new(),
            inflight: None,
            queue: VecDeque::new(),
            timeout,
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<AppDescriptor> {
        self.descriptors.get(name).copied()
    }

    /// Deadline of the in-flight request, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inflight.as_ref().map(|i| i.deadline)
    }

    pub fn has_inflight(&self) -> bool {
        self.inflight.is_some()
    }

    /// Queue a batch. Duplicate and already-registered names are skipped
    /// without wire traffic; a batch with nothing left to ask resolves
    /// immediately.
    pub fn submit(&mut self, names: Vec<String>, goal: BatchGoal) -> Vec<Action> {
        let mut seen = HashSet::new();
        let missing: VecDeque<String> = names
            .into_iter()
            .filter(|name| seen.insert(name.clone()) && !self.descriptors.contains_key(name))
            .collect();

        if missing.is_empty() {
            return vec![Action::Resolve(goal, Ok(()))];
        }
        self.queue.push_back(Batch {
            names: missing,
            goal,
        });
        if self.inflight.is_none() {
            self.start_next()
        } else {
            Vec::new()
        }
    }

    /// Apply the response to the in-flight request. An error response aborts
    /// the rest of the batch; later batches still run.
    pub fn on_response(&mut self, result: Result<AppDescriptor, u32>) -> Vec<Action> {
        let Some(inflight) = self.inflight.take() else {
            return Vec::new();
        };
        match result {
            Ok(descriptor) => {
                // A descriptor, once bound to a name, is never reassigned.
                self.descriptors
                    .entry(inflight.name)
                    .or_insert(descriptor);
                self.continue_batch(inflight.rest, inflight.goal)
            }
            Err(errno) => {
                let denied = SessionError::ApplicationDenied {
                    name: inflight.name,
                    reason: DenyReason::Error(errno),
                };
                let mut actions = vec![Action::Resolve(inflight.goal, Err(denied))];
                actions.extend(self.start_next());
                actions
            }
        }
    }

    /// The in-flight request's deadline lapsed without a response.
    pub fn on_timeout(&mut self) -> Vec<Action> {
        let Some(inflight) = self.inflight.take() else {
            return Vec::new();
        };
        let denied = SessionError::ApplicationDenied {
            name: inflight.name,
            reason: DenyReason::Timeout,
        };
        let mut actions = vec![Action::Resolve(inflight.goal, Err(denied))];
        actions.extend(self.start_next());
        actions
    }

    /// Invalidate everything pending, yielding the goals so the driver can
    /// fail them.
    pub fn abort_all(&mut self) -> Vec<BatchGoal> {
        let mut goals = Vec::new();
        if let Some(inflight) = self.inflight.take() {
            goals.push(inflight.goal);
        }
        goals.extend(self.queue.drain(..).map(|batch| batch.goal));
        goals
    }

    fn continue_batch(&mut self, mut rest: VecDeque<String>, goal: BatchGoal) -> Vec<Action> {
        while let Some(name) = rest.pop_front() {
            if self.descriptors.contains_key(&name) {
                continue;
            }
            self.inflight = Some(Inflight {
                name: name.clone(),
                rest,
                deadline: Instant::now() + self.timeout,
                goal,
            });
            return vec![Action::Send(name)];
        }
        let mut actions = vec![Action::Resolve(goal, Ok(()))];
        actions.extend(self.start_next());
        actions
    }

    fn start_next(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Some(batch) = self.queue.pop_front() {
            let mut batch_actions = self.continue_batch(batch.names, batch.goal);
            let started = self.inflight.is_some();
            actions.append(&mut batch_actions);
            if started {
                break;
            }
        }
        actions
    }
}
