// ABOUTME: The enqueue contract this crate consumes from the server's task/timer scheduler
// ABOUTME: TokioDispatcher is a minimal, real implementation so the crate is runnable standalone

use std::time::Duration;

/// One unit of work posted to a [`Dispatcher`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The enqueue contract a `Connection`/`ConnectionManager` needs from the
/// rest of the server: a serial task queue, and a way to post a task after a
/// delay. This crate only ever *calls* these two methods -- fairness,
/// priority, and cross-thread affinity are the embedder's concern.
pub trait Dispatcher: Send + Sync {
    /// Enqueue `task` for execution on the dispatcher's serial queue. Tasks
    /// run in the order they were enqueued.
    fn add_task(&self, task: Job);

    /// Enqueue `task` to run on the dispatcher's serial queue no sooner than
    /// `delay` from now.
    fn add_event(&self, delay: Duration, task: Job);
}

/// A `Dispatcher` backed by a single background task draining an unbounded
/// channel, so posted jobs run one at a time and in order -- the same
/// serial-queue guarantee the specification requires, without pulling in an
/// external scheduler crate. Must be constructed from within a running Tokio
/// runtime.
pub struct TokioDispatcher {
    sender: tokio::sync::mpsc::UnboundedSender<Job>,
}

impl TokioDispatcher {
    pub fn new() -> Self {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job();
            }
        });
        TokioDispatcher { sender }
    }
}

impl Default for TokioDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for TokioDispatcher {
    fn add_task(&self, task: Job) {
        // The only way `send` fails is if the drain task has already exited,
        // which only happens if every sender (including this one) has been
        // dropped -- i.e. there is no one left to observe the lost task.
        let _ = self.sender.send(task);
    }

    fn add_event(&self, delay: Duration, task: Job) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(task);
        });
    }
}
