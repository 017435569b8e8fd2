//! Fixed-size worker pool
//!
//! Bounds how many sessions run concurrently and decouples the accept loop
//! from long-lived session work. Tasks flow through an unbounded dispatch
//! channel into a shared task channel consumed by persistent workers; every
//! executed task produces exactly one result on the result channel, carrying
//! either the task's value or a formatted failure trace. A failing task never
//! removes a worker from service.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ForwardError;
use crate::logger::log;

type Job<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A unit of work: an id plus a future with its arguments already captured.
/// Immutable once created; submitted at most once.
pub struct Task<T> {
    pub id: String,
    job: Job<T>,
}

impl<T> Task<T> {
    fn new<F>(id: String, job: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            id,
            job: Box::pin(job),
        }
    }
}

/// Outcome of one executed task
///
/// `value` and `trace` are mutually exclusive: a task that returned an error
/// or panicked carries the formatted failure in `trace` and no value.
#[derive(Debug)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub value: Option<T>,
    pub trace: Option<String>,
}

impl<T> TaskResult<T> {
    pub fn is_failure(&self) -> bool {
        self.trace.is_some()
    }
}

/// Fixed set of persistent workers consuming a shared task channel
pub struct Pool<T> {
    size: usize,
    dispatch_tx: mpsc::UnboundedSender<Task<T>>,
    dispatch_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Task<T>>>>,
    result_tx: mpsc::UnboundedSender<TaskResult<T>>,
    result_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TaskResult<T>>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    busy_flags: std::sync::Mutex<Vec<Arc<AtomicBool>>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool that will run `size` workers once started
    pub fn new(size: usize) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            size,
            dispatch_tx,
            dispatch_rx: std::sync::Mutex::new(Some(dispatch_rx)),
            result_tx,
            result_rx: std::sync::Mutex::new(Some(result_rx)),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            busy_flags: std::sync::Mutex::new(Vec::new()),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the dispatcher and the fixed set of workers
    ///
    /// Not safe to call twice; the second call returns a pool error.
    pub fn start(&self) -> crate::error::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ForwardError::Pool("pool is already started".to_string()));
        }

        let dispatch_rx = self
            .dispatch_rx
            .lock()
            .expect("pool state mutex poisoned")
            .take()
            .expect("dispatch receiver consumed before start");

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let task_rx = Arc::new(Mutex::new(task_rx));

        let mut handles = self.handles.lock().expect("pool state mutex poisoned");
        handles.push(tokio::spawn(dispatcher_loop(
            dispatch_rx,
            task_tx,
            self.cancel.clone(),
        )));

        let mut busy_flags = self.busy_flags.lock().expect("pool state mutex poisoned");
        for worker_id in 0..self.size {
            let busy = Arc::new(AtomicBool::new(false));
            busy_flags.push(Arc::clone(&busy));
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&task_rx),
                self.result_tx.clone(),
                busy,
                self.cancel.clone(),
            )));
        }

        log::debug!(size = self.size, "Worker pool started");
        Ok(())
    }

    /// Enqueue a task under a fresh id; returns the id immediately
    pub fn execute<F>(&self, job: F) -> crate::error::Result<String>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.execute_with_id(Uuid::new_v4().simple().to_string(), job)
    }

    /// Enqueue a task under a caller-chosen id; returns the id immediately
    pub fn execute_with_id<F>(
        &self,
        id: impl Into<String>,
        job: F,
    ) -> crate::error::Result<String>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let id = id.into();
        let task = Task::new(id.clone(), job);
        self.dispatch_tx
            .send(task)
            .map_err(|_| ForwardError::Pool("pool is stopped".to_string()))?;
        Ok(id)
    }

    /// Signal the dispatcher and all workers to exit, then wait for them
    ///
    /// Cooperative: work already pulled from the queue finishes; tasks still
    /// queued are not executed.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("pool state mutex poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        log::debug!("Worker pool stopped");
    }

    /// Best-effort, race-prone diagnostic: is any worker executing right now?
    pub fn all_is_idle(&self) -> bool {
        let busy_flags = self.busy_flags.lock().expect("pool state mutex poisoned");
        !busy_flags.iter().any(|flag| flag.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Hand out the result channel receiver; yields `None` after first use
    pub fn take_results(&self) -> Option<mpsc::UnboundedReceiver<TaskResult<T>>> {
        self.result_rx
            .lock()
            .expect("pool state mutex poisoned")
            .take()
    }
}

/// Forward tasks from the dispatch channel into the shared task channel
async fn dispatcher_loop<T: Send + 'static>(
    mut dispatch_rx: mpsc::UnboundedReceiver<Task<T>>,
    task_tx: mpsc::UnboundedSender<Task<T>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = dispatch_rx.recv() => match task {
                Some(task) => {
                    if task_tx.send(task).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// One persistent worker: pull a task, run it, record the result, repeat
///
/// The cancellation branch is checked first so that stop() is observed
/// between tasks without draining what is still queued.
async fn worker_loop<T: Send + 'static>(
    worker_id: usize,
    task_rx: Arc<Mutex<mpsc::UnboundedReceiver<Task<T>>>>,
    result_tx: mpsc::UnboundedSender<TaskResult<T>>,
    busy: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = task_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            }
        };

        busy.store(true, Ordering::Release);
        let task_id = task.id;

        // Supervise the job on its own task so a panic is captured into the
        // result trace instead of taking the worker down.
        let result = match tokio::spawn(task.job).await {
            Ok(Ok(value)) => TaskResult {
                task_id,
                value: Some(value),
                trace: None,
            },
            Ok(Err(err)) => TaskResult {
                task_id,
                value: None,
                trace: Some(format!("{err:?}")),
            },
            Err(join_err) => TaskResult {
                task_id,
                value: None,
                trace: Some(join_error_trace(join_err)),
            },
        };

        if let Some(trace) = &result.trace {
            log::debug!(worker = worker_id, trace = %trace, "Task failed");
        }
        // Results are kept even when nobody is draining them yet; a closed
        // receiver must not stop the worker.
        let _ = result_tx.send(result);
        busy.store(false, Ordering::Release);
    }
}

fn join_error_trace(err: tokio::task::JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        format!("task panicked: {message}")
    } else {
        "task was cancelled".to_string()
    }
}
