//! src/stream/runner.rs
//!
//! Threaded stream front end.
//!
//! Each worker slot gets its own pipeline instance running on a named
//! thread, feeding a bounded channel so threads prefetch ahead of the
//! consumer without unbounded buffering. The consumer side deals samples
//! round-robin across workers.
//!
//! Every in-flight sample carries the producing worker's post-pull state.
//! The loader records a worker's state only when that sample is handed to
//! the caller, so `save_state` always describes exactly the consumed
//! prefix, no matter how far the threads have prefetched. A resumed loader
//! starts that record at the restored positions.

use crate::stream::SavableStream;
use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

enum WorkerMsg<I, S> {
    /// A sample plus the worker's state after pulling it.
    Item { item: I, state: S },
    Failed(anyhow::Error),
    Done,
}

struct WorkerHandle<I, S> {
    /// Dropped before joining so a blocked sender unblocks.
    receiver: Option<Receiver<WorkerMsg<I, S>>>,
    thread: Option<JoinHandle<()>>,
    done: bool,
}

/// ============================================================================
/// Runs one pipeline instance per worker slot and yields their samples
/// round-robin.
///
/// `build` is called once per worker plus once for a consumer-side instance
/// that only merges states and answers metadata queries; every instance
/// must be constructed identically.
pub struct StreamLoader<P: SavableStream> {
    merger: P,
    workers: Vec<WorkerHandle<P::Item, P::State>>,
    shutdown: Arc<AtomicBool>,
    turn: usize,
    last_states: Vec<Option<P::State>>,
    live: usize,
}

impl<P> StreamLoader<P>
where
    P: SavableStream + 'static,
{
    /// Starts a fresh loader prefetching up to `prefetch` samples per
    /// worker.
    pub fn new<B>(build: B, prefetch: usize) -> Result<Self>
    where
        B: Fn() -> Result<P>,
    {
        Self::start(build, prefetch, None)
    }

    /// Starts a loader resuming from a merged checkpoint.
    pub fn resume<B>(build: B, prefetch: usize, state: P::MergedState) -> Result<Self>
    where
        B: Fn() -> Result<P>,
    {
        Self::start(build, prefetch, Some(state))
    }

    fn start<B>(build: B, prefetch: usize, state: Option<P::MergedState>) -> Result<Self>
    where
        B: Fn() -> Result<P>,
    {
        ensure!(prefetch >= 1, "prefetch must be at least 1");
        let merger = build().context("building the state-merging pipeline instance")?;
        let worker_count = merger.worker_config().num_workers();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        let mut last_states = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let mut pipeline = build()
                .with_context(|| format!("building the pipeline instance for worker {worker}"))?;
            // A save before the first consumed sample must reproduce the
            // restored checkpoint, so the consumer's record of each worker
            // starts at the restored position rather than empty.
            let restored = match &state {
                Some(state) => {
                    pipeline
                        .restore_state(Some(state.clone()))
                        .with_context(|| format!("restoring worker {worker}"))?;
                    Some(
                        pipeline
                            .save_state(worker)
                            .with_context(|| format!("reading back worker {worker} after restore"))?,
                    )
                }
                None => None,
            };
            last_states.push(restored);
            let (sender, receiver) = bounded(prefetch);
            let shutdown = Arc::clone(&shutdown);
            let thread = thread::Builder::new()
                .name(format!("stream-worker-{worker}"))
                .spawn(move || worker_loop(pipeline, worker, sender, shutdown))
                .with_context(|| format!("spawning stream worker {worker}"))?;
            workers.push(WorkerHandle {
                receiver: Some(receiver),
                thread: Some(thread),
                done: false,
            });
        }
        Ok(Self {
            merger,
            workers,
            shutdown,
            turn: 0,
            last_states,
            live: worker_count,
        })
    }

    /// Merged checkpoint covering exactly the samples yielded so far.
    pub fn save_state(&self) -> Result<P::MergedState> {
        self.merger.merge_states(self.last_states.clone())
    }

    /// Samples per plain pass, as reported by the pipeline.
    pub fn len(&self) -> u64 {
        self.merger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> serde_json::Value {
        self.merger.config()
    }

    fn mark_done(&mut self, slot: usize) {
        if !self.workers[slot].done {
            self.workers[slot].done = true;
            self.live -= 1;
        }
    }
}

fn worker_loop<P: SavableStream>(
    mut pipeline: P,
    worker: usize,
    sender: Sender<WorkerMsg<P::Item, P::State>>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match pipeline.next_sample(worker) {
            None => {
                let _ = sender.send(WorkerMsg::Done);
                return;
            }
            Some(Ok(item)) => {
                let msg = match pipeline.save_state(worker) {
                    Ok(state) => WorkerMsg::Item { item, state },
                    Err(err) => {
                        WorkerMsg::Failed(err.context(format!("saving worker {worker} state")))
                    }
                };
                let failed = matches!(msg, WorkerMsg::Failed(_));
                // A send error means the consumer is gone; just stop.
                if sender.send(msg).is_err() || failed {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = sender.send(WorkerMsg::Failed(err));
                return;
            }
        }
    }
}

impl<P> Iterator for StreamLoader<P>
where
    P: SavableStream + 'static,
{
    type Item = Result<P::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.live > 0 {
            let slot = self.turn;
            self.turn = (self.turn + 1) % self.workers.len();
            if self.workers[slot].done {
                continue;
            }
            let Some(receiver) = self.workers[slot].receiver.as_ref() else {
                self.mark_done(slot);
                continue;
            };
            match receiver.recv() {
                Ok(WorkerMsg::Item { item, state }) => {
                    self.last_states[slot] = Some(state);
                    return Some(Ok(item));
                }
                Ok(WorkerMsg::Failed(err)) => {
                    self.mark_done(slot);
                    return Some(Err(err.context(format!("stream worker {slot} failed"))));
                }
                Ok(WorkerMsg::Done) => {
                    debug!(worker = slot, "stream worker exhausted");
                    self.mark_done(slot);
                }
                Err(_) => {
                    self.mark_done(slot);
                    return Some(Err(anyhow!(
                        "stream worker {slot} disconnected without reporting completion"
                    )));
                }
            }
        }
        None
    }
}

impl<P: SavableStream> Drop for StreamLoader<P> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Receivers go first so senders blocked on a full channel wake up.
        for worker in &mut self.workers {
            worker.receiver = None;
        }
        for (slot, worker) in self.workers.iter_mut().enumerate() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!(worker = slot, "stream worker panicked during shutdown");
                }
            }
        }
    }
}
