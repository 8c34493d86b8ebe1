//! Single-threaded execution context for one subscription shard.
//!
//! The scheduler's queue state (limiter FIFOs, throttler queues, loop
//! batches) is confined to one logical thread. Completions arriving on
//! arbitrary runtime threads never mutate that state directly: they post
//! thunks into the context's channel, and a single drain task owned by
//! [`EventExecutor`] runs them one at a time. `Context` is the cloneable
//! posting handle.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Thunk = Box<dyn FnOnce() + Send + 'static>;

tokio::task_local! {
    /// ID of the context whose drain task is currently executing.
    static ACTIVE_CONTEXT: u64;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Owns the drain task of one shard's execution context.
///
/// Work posted through [`Context`] handles runs on a single spawned task, in
/// posting order. Stopping the executor drains work already queued, then
/// exits; dropping it without [`EventExecutor::stop`] signals the drain task
/// to finish its queue and stop on its own.
pub struct EventExecutor {
    context: Context,
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl EventExecutor {
    /// Spawns a new execution context onto the current tokio runtime.
    pub fn start() -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Thunk>();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(ACTIVE_CONTEXT.scope(id, async move {
            debug!(context_id = id, "execution context started");
            loop {
                tokio::select! {
                    received = receiver.recv() => match received {
                        Some(thunk) => thunk(),
                        None => break,
                    },
                    () = token.cancelled() => {
                        // Run whatever was posted before the stop signal.
                        while let Ok(thunk) = receiver.try_recv() {
                            thunk();
                        }
                        break;
                    }
                }
            }
            debug!(context_id = id, "execution context stopped");
        }));

        Self { context: Context { id, sender }, handle, shutdown }
    }

    /// Returns a posting handle for this context.
    pub fn context(&self) -> Context {
        self.context.clone()
    }

    /// Stops the context after draining already-posted work.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for EventExecutor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Cloneable handle that posts work onto its execution context.
#[derive(Clone)]
pub struct Context {
    id: u64,
    sender: mpsc::UnboundedSender<Thunk>,
}

impl Context {
    /// True when the caller is currently executing on this context.
    pub fn is_in_context(&self) -> bool {
        ACTIVE_CONTEXT.try_with(|active| *active == self.id).unwrap_or(false)
    }

    /// Posts `f` to run on the context.
    ///
    /// Work posted after the executor stopped is dropped; completions racing
    /// a shutdown have nothing left to schedule against.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(f)).is_err() {
            debug!("execution context is stopped, dropping posted work");
        }
    }

    /// Runs `f` inline when already on the context, otherwise posts it.
    pub fn run_on_context(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_context() {
            f();
        } else {
            self.execute(f);
        }
    }

    /// Posts `f` and resolves with its return value.
    ///
    /// The receiver errors if the executor stops before `f` runs.
    pub fn execute_on_context<T, F>(&self, f: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.execute(move || {
            let _ = sender.send(f());
        });
        receiver
    }
}
