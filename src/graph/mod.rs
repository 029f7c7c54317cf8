//! A generic, domain-agnostic task graph executor.
//!
//! A [`Graph`] is a set of integer-identified tasks, each with a list of
//! prerequisite ids. [`Graph::solve`] runs every task exactly once on a fixed
//! pool of worker threads, starting a task only after all of its
//! prerequisites completed.
//!
//! ## Coordination
//!
//! All bookkeeping (completed set, in-flight set, first error) belongs to a
//! single coordinating loop running on the calling thread. Workers never touch
//! it; they receive task ids over a bounded work queue and report results
//! over a completion channel:
//!
//! 1. The queue is primed with every ready task, blocking if needed.
//! 2. The coordinator waits for a completion or for the caller's
//!    cancellation signal.
//! 3. On completion the task is marked done and every task that became ready
//!    is pushed to the queue without blocking, stopping at the first full
//!    slot. Remaining ready tasks get their turn on the next completion.
//! 4. The first error (or cancellation) halts dispatch. Work already handed
//!    out runs to completion and is drained before returning.
//!
//! If a feed dispatches nothing while nothing is in flight and tasks remain,
//! the graph can never finish and [`SolveError::Unsolvable`] is returned
//! right away instead of waiting for a completion that will never arrive.

mod cancel;

use std::collections::{BTreeMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use thiserror::Error;
use tracing::{debug, warn};

pub use crate::graph::cancel::CancelToken;

/// Opaque task identifier supplied by the caller.
pub type TaskId = usize;

#[derive(Debug, Error)]
pub enum SolveError {
    /// No task can be started although some are still incomplete, which
    /// means the dependency relation contains a cycle.
    #[error("Unsolvable task graph, tasks {pending:?} can never start")]
    Unsolvable { pending: Vec<TaskId> },

    #[error("Task graph execution was cancelled")]
    Cancelled,

    #[error("Task {id}:\n{source}")]
    Task {
        id: TaskId,
        #[source]
        source: anyhow::Error,
    },
}

/// A set of tasks with declared dependencies and a concurrency bound.
#[derive(Debug, Clone)]
pub struct Graph {
    concurrency: usize,
    nodes: BTreeMap<TaskId, Vec<TaskId>>,
}

impl Graph {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            nodes: BTreeMap::new(),
        }
    }

    /// Adds a task together with the ids it depends on. A dependency id which
    /// never gets added as a task itself is treated as already satisfied.
    pub fn task(&mut self, id: TaskId, dependencies: impl IntoIterator<Item = TaskId>) -> &mut Self {
        self.nodes.insert(id, dependencies.into_iter().collect());
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Runs every task through `process` and returns the first error.
    ///
    /// `process` receives a token which gets cancelled as soon as the run
    /// fails or the caller cancels `cancel`; long running tasks should check
    /// it and give up early.
    pub fn solve<F>(&self, cancel: &CancelToken, process: F) -> Result<(), SolveError>
    where
        F: Fn(&CancelToken, TaskId) -> anyhow::Result<()> + Sync,
    {
        let token = CancelToken::new();

        thread::scope(|s| {
            let (work_tx, work_rx) = bounded::<TaskId>(self.concurrency);
            let (done_tx, done_rx) = unbounded::<Done>();

            for i in 0..self.concurrency {
                let work = work_rx.clone();
                let done = done_tx.clone();
                let token = &token;
                let process = &process;

                s.spawn(move || worker(i, process, token, work, done));
            }

            drop(work_rx);
            drop(done_tx);

            let mut pump = Pump {
                nodes: &self.nodes,
                completed: HashSet::new(),
                in_flight: HashSet::new(),
                err: None,
                work: work_tx,
                token: &token,
            };

            // The pump owns the only work sender, dropping it at the end of
            // this closure lets idle workers exit before the scope joins them.
            pump.run(cancel, &done_rx)
        })
    }
}

struct Done {
    id: TaskId,
    result: anyhow::Result<()>,
}

fn worker<F>(i: usize, process: &F, token: &CancelToken, work: Receiver<TaskId>, done: Sender<Done>)
where
    F: Fn(&CancelToken, TaskId) -> anyhow::Result<()> + Sync,
{
    debug!(worker = i, "starting");

    for id in work.iter() {
        debug!(worker = i, task = id, "starting work");

        let result = match catch_unwind(AssertUnwindSafe(|| process(token, id))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                Err(anyhow::anyhow!(msg))
            }
        };

        if done.send(Done { id, result }).is_err() {
            break;
        }

        debug!(worker = i, task = id, "finished work");
    }

    debug!(worker = i, "stopping");
}

/// Coordinator state, only ever touched by the thread calling `solve`.
struct Pump<'a> {
    nodes: &'a BTreeMap<TaskId, Vec<TaskId>>,
    completed: HashSet<TaskId>,
    in_flight: HashSet<TaskId>,
    err: Option<SolveError>,
    work: Sender<TaskId>,
    token: &'a CancelToken,
}

impl Pump<'_> {
    fn run(&mut self, cancel: &CancelToken, done: &Receiver<Done>) -> Result<(), SolveError> {
        if self.finished() {
            return Ok(());
        }

        if cancel.is_cancelled() {
            self.token.cancel();
            return Err(SolveError::Cancelled);
        }

        // Priming may block on a full queue, the workers drain it without any
        // help from this thread.
        if !self.feed(true) {
            return Err(self.unsolvable());
        }

        // Once the caller's token fired its channel stays disconnected, so it
        // must not be selected on again.
        let mut watch_cancel = true;

        while !self.finished() || self.working() {
            let message = if watch_cancel {
                select! {
                    recv(done) -> message => Some(message),
                    recv(cancel.signal()) -> _ => None,
                }
            } else {
                Some(done.recv())
            };

            let Some(message) = message else {
                debug!("pump: cancelled, waiting for workers to drain");
                watch_cancel = false;
                self.errored(SolveError::Cancelled);
                continue;
            };

            let Ok(Done { id, result }) = message else {
                break;
            };

            debug!(task = id, "pump: work done");
            self.complete(id);

            if let Err(source) = result {
                debug!(task = id, "pump: received error");
                self.errored(SolveError::Task { id, source });
            }

            if !self.finished() {
                let sent = self.feed(false);
                if !sent && !self.working() {
                    return Err(self.unsolvable());
                }
            }
        }

        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Records the run's error. Only the first one is kept, later failures
    /// come from work which was already in flight.
    fn errored(&mut self, err: SolveError) {
        match self.err {
            None => self.err = Some(err),
            Some(_) => warn!("pump: dropping subsequent error: {err}"),
        }
        self.token.cancel();
    }

    fn working(&self) -> bool {
        !self.in_flight.is_empty()
    }

    fn finished(&self) -> bool {
        self.err.is_some() || self.completed.len() >= self.nodes.len()
    }

    fn complete(&mut self, id: TaskId) {
        self.completed.insert(id);
        self.in_flight.remove(&id);
    }

    /// Pushes ready tasks into the work queue. When `block` is false this
    /// returns as soon as the queue is full.
    fn feed(&mut self, block: bool) -> bool {
        let nodes = self.nodes;
        let mut sent = false;

        for (&id, dependencies) in nodes {
            if !self.ready(id, dependencies) {
                continue;
            }

            if block {
                if self.work.send(id).is_err() {
                    return sent;
                }
            } else if self.work.try_send(id).is_err() {
                return sent;
            }

            self.in_flight.insert(id);
            sent = true;
            debug!(task = id, in_flight = self.in_flight.len(), "pump: sent work");
        }

        sent
    }

    fn ready(&self, id: TaskId, dependencies: &[TaskId]) -> bool {
        if self.in_flight.contains(&id) || self.completed.contains(&id) {
            return false;
        }

        dependencies
            .iter()
            .all(|dep| self.completed.contains(dep) || !self.nodes.contains_key(dep))
    }

    fn unsolvable(&self) -> SolveError {
        let pending: Vec<_> = self
            .nodes
            .keys()
            .filter(|id| !self.completed.contains(id))
            .copied()
            .collect();

        warn!(?pending, "pump: no task can be started");
        SolveError::Unsolvable { pending }
    }
}
