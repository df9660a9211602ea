//! Context-aware task execution.
//!
//! [`ContextAwareExecutor`] decorates any task-submission API so that every
//! task runs under the context of the thread that submitted it. The snapshot
//! is captured at submission time, per task, never at decorator construction,
//! so two tasks submitted from different threads each carry their own
//! submitter's context.
//!
//! On the executing side each task runs as: reactivate, delegate, close,
//! then clear every manager's state on the worker thread. The final clear is
//! pool hygiene: a reused worker starts the next task with no inherited
//! context, even when the previous task leaked.

use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::error;

use crate::registry::ManagerRegistry;
use crate::snapshot::ContextSnapshot;

/// A unit of work as the executor sees it.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Submission contract of the wrapped executor.
///
/// Implement this for a worker pool, a queue sender, or anything else that
/// can run a boxed task somewhere.
pub trait TaskExecutor {
    fn execute(&self, task: Task);
}

/// Runs each task on a freshly spawned thread.
pub struct SpawnExecutor;

impl TaskExecutor for SpawnExecutor {
    fn execute(&self, task: Task) {
        let spawned = std::thread::Builder::new().name("tasuki-task".into()).spawn(task);
        if let Err(cause) = spawned {
            error!(%cause, "failed to spawn task thread, task dropped");
        }
    }
}

/// Errors surfaced through a [`TaskHandle`].
#[derive(Error, Debug)]
pub enum TaskError {
    /// The task panicked. The payload message is preserved; the worker
    /// thread is not.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was dropped before it produced a result, for example because
    /// the executor shut down.
    #[error("task dropped before completion")]
    Lost,
}

/// Executor decorator that propagates the submitter's context to every task.
pub struct ContextAwareExecutor<E> {
    inner: E,
    registry: Option<Arc<ManagerRegistry>>,
}

impl<E: TaskExecutor> ContextAwareExecutor<E> {
    /// Decorate `inner`, capturing from the process-wide registry.
    pub fn new(inner: E) -> Self {
        Self { inner, registry: None }
    }

    /// Decorate `inner`, capturing from an explicit registry.
    pub fn with_registry(inner: E, registry: Arc<ManagerRegistry>) -> Self {
        Self { inner, registry: Some(registry) }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn into_inner(self) -> E {
        self.inner
    }

    /// Submit a task that produces a value. The result, or the task's panic,
    /// is delivered through the returned handle; a panicking task does not
    /// unwind the worker thread.
    pub fn submit<R, F>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let snapshot = self.capture();
        let registry = self.registry.clone();
        self.inner.execute(Box::new(move || {
            let mut active = snapshot.reactivate();
            let outcome = catch_unwind(AssertUnwindSafe(task));
            active.close();
            clear_worker(&registry);
            let result = outcome.map_err(|payload| TaskError::Panicked(panic_message(payload)));
            let _ = sender.send(result);
        }));
        TaskHandle { receiver }
    }

    fn capture(&self) -> ContextSnapshot {
        match &self.registry {
            Some(registry) => registry.capture_snapshot(),
            None => ContextSnapshot::capture(),
        }
    }
}

impl<E: TaskExecutor> TaskExecutor for ContextAwareExecutor<E> {
    /// Fire-and-forget submission. A panicking task unwinds on the executing
    /// thread, after its contexts are restored and cleared.
    fn execute(&self, task: Task) {
        let snapshot = self.capture();
        let registry = self.registry.clone();
        self.inner.execute(Box::new(move || {
            let mut active = snapshot.reactivate();
            let outcome = catch_unwind(AssertUnwindSafe(task));
            active.close();
            clear_worker(&registry);
            if let Err(payload) = outcome {
                resume_unwind(payload);
            }
        }));
    }
}

/// Pending result of a submitted task.
pub struct TaskHandle<R> {
    receiver: oneshot::Receiver<Result<R, TaskError>>,
}

impl<R> TaskHandle<R> {
    /// Block until the task finishes. Not for use inside an async runtime.
    pub fn join(self) -> Result<R, TaskError> {
        match self.receiver.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(TaskError::Lost),
        }
    }
}

fn clear_worker(registry: &Option<Arc<ManagerRegistry>>) {
    match registry {
        Some(registry) => registry.clear_active_contexts(),
        None => ManagerRegistry::global().clear_active_contexts(),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::manager::RegisteredManager;
    use crate::test_support::{EventLog, RecordingManager, alpha_slot};

    /// Runs tasks synchronously on the submitting thread.
    struct InlineExecutor;

    impl TaskExecutor for InlineExecutor {
        fn execute(&self, task: Task) {
            task();
        }
    }

    /// Single worker thread fed over a channel, so consecutive tasks share
    /// one thread and hygiene between them is observable.
    struct ChannelPool {
        sender: mpsc::Sender<Task>,
    }

    fn channel_pool() -> (ChannelPool, std::thread::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel::<Task>();
        let worker = std::thread::spawn(move || {
            while let Ok(task) = receiver.recv() {
                task();
            }
        });
        (ChannelPool { sender }, worker)
    }

    impl TaskExecutor for ChannelPool {
        fn execute(&self, task: Task) {
            self.sender.send(task).expect("worker alive");
        }
    }

    fn fixture() -> (EventLog, Arc<ManagerRegistry>) {
        let log = EventLog::new();
        let registry = ManagerRegistry::empty();
        registry.register(RegisteredManager::new(RecordingManager::new(
            "alpha",
            alpha_slot(),
            log.clone(),
        )));
        (log, Arc::new(registry))
    }

    #[test]
    fn test_execute_brackets_task_and_clears_worker() {
        let (log, registry) = fixture();
        let _value = alpha_slot().activate("ctx".to_string());

        let executor = ContextAwareExecutor::with_registry(InlineExecutor, registry);
        let task_log = log.clone();
        executor.execute(Box::new(move || task_log.push("task")));

        assert_eq!(
            log.events(),
            vec!["activate:alpha:ctx", "task", "close:alpha", "clear:alpha"]
        );
    }

    #[test]
    fn test_decorator_hands_back_the_wrapped_executor() {
        let (log, registry) = fixture();
        let _value = alpha_slot().activate("ctx".to_string());
        let executor = ContextAwareExecutor::with_registry(InlineExecutor, registry);

        // Submissions through the accessors bypass propagation entirely:
        // no activate, close, or clear events, just the task.
        let direct_log = log.clone();
        executor.inner().execute(Box::new(move || direct_log.push("direct")));
        assert_eq!(log.events(), vec!["direct"]);

        let undecorated = executor.into_inner();
        let raw_log = log.clone();
        undecorated.execute(Box::new(move || raw_log.push("raw")));
        assert_eq!(log.events(), vec!["direct", "raw"]);
    }

    #[test]
    fn test_submit_returns_value_computed_under_context() {
        let (_log, registry) = fixture();
        let slot = alpha_slot();
        let (pool, worker) = channel_pool();
        let executor = ContextAwareExecutor::with_registry(pool, registry);

        let _old = slot.activate("old".to_string());
        let handle = executor.submit(move || slot.current());
        let _new = slot.activate("new".to_string());

        assert_eq!(handle.join().unwrap(), Some("old".to_string()));
        assert_eq!(slot.current(), Some("new".to_string()));

        drop(executor);
        worker.join().unwrap();
    }

    #[test]
    fn test_each_task_carries_its_own_submission_context() {
        let (_log, registry) = fixture();
        let slot = alpha_slot();
        let (pool, worker) = channel_pool();
        let executor = ContextAwareExecutor::with_registry(pool, registry);

        let first_guard = slot.activate("first".to_string());
        let first = executor.submit(move || slot.current());
        drop(first_guard);

        let _second_guard = slot.activate("second".to_string());
        let second = executor.submit(move || slot.current());

        assert_eq!(first.join().unwrap(), Some("first".to_string()));
        assert_eq!(second.join().unwrap(), Some("second".to_string()));

        drop(executor);
        worker.join().unwrap();
    }

    #[test]
    fn test_worker_thread_is_cleared_between_tasks() {
        let (_log, registry) = fixture();
        let slot = alpha_slot();
        let (pool, worker) = channel_pool();
        let executor = ContextAwareExecutor::with_registry(pool, registry);

        // A task that leaks an activation instead of closing it.
        let leaky = executor.submit(move || {
            std::mem::forget(slot.activate("leaked".to_string()));
        });
        leaky.join().unwrap();

        let later = executor.submit(move || slot.current());
        assert_eq!(later.join().unwrap(), None);

        drop(executor);
        worker.join().unwrap();
    }

    #[test]
    fn test_submitted_panic_becomes_task_error_and_spares_the_worker() {
        let (_log, registry) = fixture();
        let (pool, worker) = channel_pool();
        let executor = ContextAwareExecutor::with_registry(pool, registry);

        let exploding = executor.submit(|| -> () { panic!("boom") });
        match exploding.join() {
            Err(TaskError::Panicked(message)) => assert_eq!(message, "boom"),
            other => panic!("expected Panicked, got {other:?}"),
        }

        // The worker survived and still runs tasks.
        let after = executor.submit(|| 7);
        assert_eq!(after.join().unwrap(), 7);

        drop(executor);
        worker.join().unwrap();
    }

    #[test]
    fn test_execute_rethrows_panic_on_worker_thread() {
        let (_log, registry) = fixture();
        let (pool, worker) = channel_pool();
        let executor = ContextAwareExecutor::with_registry(pool, registry);

        executor.execute(Box::new(|| panic!("unhandled")));

        drop(executor);
        assert!(worker.join().is_err());
    }

    #[test]
    fn test_dropped_task_reports_lost() {
        struct DiscardExecutor;

        impl TaskExecutor for DiscardExecutor {
            fn execute(&self, _task: Task) {}
        }

        let (_log, registry) = fixture();
        let executor = ContextAwareExecutor::with_registry(DiscardExecutor, registry);
        let handle = executor.submit(|| 1);
        assert!(matches!(handle.join(), Err(TaskError::Lost)));
    }

    #[test]
    fn test_spawn_executor_carries_context_to_fresh_thread() {
        let (_log, registry) = fixture();
        let slot = alpha_slot();
        let executor = ContextAwareExecutor::with_registry(SpawnExecutor, registry);

        let _old = slot.activate("old".to_string());
        let handle = executor.submit(move || slot.current());
        assert_eq!(handle.join().unwrap(), Some("old".to_string()));
    }
}
