//! End-to-end correlation propagation: link-time discovery, executors,
//! futures, and plain thread spawns, all through the process-wide registry.

use std::sync::mpsc;
use std::thread;

use tasuki_core::{ContextAwareExecutor, FutureExt, ManagerRegistry, Task, TaskExecutor};
use tasuki_correlate::{clear, get, put};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

/// Single worker thread fed over a channel, so consecutive tasks share one
/// thread.
struct ChannelPool {
    sender: mpsc::Sender<Task>,
}

fn channel_pool() -> (ChannelPool, thread::JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel::<Task>();
    let worker = thread::spawn(move || {
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

#[test]
fn test_global_registry_discovers_correlation() {
    init_tracing();
    assert!(ManagerRegistry::global().managers().iter().any(|m| m.name() == "correlation"));
}

#[test]
fn test_executor_propagates_submitter_map() {
    init_tracing();
    clear();
    put("flow", "Old");

    let (pool, worker) = channel_pool();
    let executor = ContextAwareExecutor::new(pool);

    let handle = executor.submit(|| get("flow"));
    put("flow", "New");

    // The task saw the submission-time value on the worker thread; the
    // submitting thread's later value is untouched.
    assert_eq!(handle.join().unwrap(), Some("Old".to_string()));
    assert_eq!(get("flow"), Some("New".to_string()));

    drop(executor);
    worker.join().unwrap();
    clear();
}

#[test]
fn test_worker_thread_is_cleared_between_tasks() {
    init_tracing();
    clear();

    let (pool, worker) = channel_pool();
    let executor = ContextAwareExecutor::new(pool);

    // The first task edits the worker's map directly and never cleans up.
    let first = executor.submit(|| {
        put("leak", "spilled");
        get("leak")
    });
    assert_eq!(first.join().unwrap(), Some("spilled".to_string()));

    let second = executor.submit(|| get("leak"));
    assert_eq!(second.join().unwrap(), None);

    drop(executor);
    worker.join().unwrap();
}

#[test]
fn test_wrap_carries_map_to_plain_thread() {
    init_tracing();
    clear();
    put("request.id", "r-42");

    let task = tasuki_core::capture_snapshot().wrap(|| get("request.id"));
    let seen = thread::spawn(task).join().unwrap();

    assert_eq!(seen, Some("r-42".to_string()));
    assert_eq!(get("request.id"), Some("r-42".to_string()));
    clear();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_future_observes_correlation_across_polls() {
    init_tracing();
    clear();
    put("job", "j-7");

    let observed = async {
        let before_yield = get("job");
        tokio::task::yield_now().await;
        let after_yield = get("job");
        (before_yield, after_yield)
    }
    .with_current_context();

    let (before_yield, after_yield) = tokio::spawn(observed).await.unwrap();
    assert_eq!(before_yield, Some("j-7".to_string()));
    assert_eq!(after_yield, Some("j-7".to_string()));
    clear();
}
