use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::sync_ext::MutexExt;

/// Called with `true` if the job ran to completion.
pub type JobDone = Box<dyn FnOnce(bool) + Send>;

struct Job {
    name: String,
    future: BoxFuture<'static, ()>,
    done: Option<JobDone>,
}

impl Job {
    fn finish(self, completed: bool) {
        if let Some(done) = self.done {
            done(completed);
        }
    }
}

/// Runs submitted jobs one at a time on a dedicated task.
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run(receiver, token.clone()));
        JobQueue {
            sender,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues a job.
    ///
    /// Returns `false` if the queue has been stopped.  `done` is called with
    /// `false` in that case.
    pub fn submit<F>(&self, name: &str, future: F, done: Option<JobDone>) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job = Job {
            name: name.to_string(),
            future: future.boxed(),
            done,
        };
        if self.token.is_cancelled() {
            tracing::warn!(job = name, "Queue stopped, discard");
            job.finish(false);
            return false;
        }
        match self.sender.send(job) {
            Ok(_) => {
                tracing::debug!(job = name, "Submitted");
                true
            }
            Err(mpsc::error::SendError(job)) => {
                tracing::warn!(job = name, "Queue stopped, discard");
                job.finish(false);
                false
            }
        }
    }

    /// Stops the queue and waits for the worker task.
    ///
    /// The running job is cancelled and queued jobs are discarded.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.locked().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn run(mut receiver: mpsc::UnboundedReceiver<Job>, token: CancellationToken) {
        loop {
            let mut job = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                job = receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            tracing::info!(job = %job.name, "Performing...");
            let start = Instant::now();
            let future = std::mem::replace(&mut job.future, async {}.boxed());
            let completed = tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = future => true,
            };
            let elapsed = start.elapsed();
            if completed {
                tracing::info!(job = %job.name, elapsed = %humantime::format_duration(elapsed), "Done");
            } else {
                tracing::warn!(job = %job.name, elapsed = %humantime::format_duration(elapsed), "Cancelled");
            }
            job.finish(completed);
        }

        receiver.close();
        while let Some(job) = receiver.recv().await {
            tracing::debug!(job = %job.name, "Discarded");
            job.finish(false);
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
