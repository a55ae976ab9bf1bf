use futures_util::FutureExt;
use std::{
    borrow::Cow,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn into_inner(self) -> (Cow<'static, str>, JoinHandle<()>) {
        (self.name, self.handle)
    }
}

/// Background loops owned by the engine, stopped together on shutdown.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(target: "daas::supervisor", task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(TaskHandle::name).collect()
    }

    pub async fn shutdown(self) {
        self.shutdown_with_grace(Duration::from_secs(0)).await;
    }

    /// Waits up to `grace` for each task to finish on its own (after its
    /// cancellation token fired), then aborts it.
    pub async fn shutdown_with_grace(self, grace: Duration) -> TaskShutdownReport {
        let mut report = TaskShutdownReport::default();
        for task in self.tasks {
            let (name_cow, mut handle) = task.into_inner();
            let name = name_cow.into_owned();

            if grace.is_zero() {
                handle.abort();
                let result = handle.await;
                if result.is_ok() {
                    report.completed += 1;
                } else {
                    debug!(target: "daas::supervisor", task = %name, ?result, "task join after abort failed");
                    report.aborted += 1;
                }
                continue;
            }

            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(target: "daas::supervisor", task = %name, ?err, "task exited with error");
                        report.aborted += 1;
                    } else {
                        report.completed += 1;
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    match handle.await {
                        Ok(_) => report.completed += 1,
                        Err(err) => {
                            debug!(target: "daas::supervisor", task = %name, ?err, "task join after abort failed");
                            report.aborted += 1;
                        }
                    }
                }
            }
        }
        report
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskShutdownReport {
    pub completed: usize,
    pub aborted: usize,
}

/// Spawn a supervised background task that restarts on panic with exponential backoff.
/// Use for long-running loops that should survive transient failures.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    spawn_supervised_with(name, factory, Option::<fn(u32)>::None)
}

/// Supervised spawn with a restart callback. The callback receives the restart count within
/// the current window whenever a panic occurs.
pub fn spawn_supervised_with<F, Fut, R>(
    name: impl Into<Cow<'static, str>>,
    mut factory: F,
    mut on_restart: Option<R>,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
    R: FnMut(u32) + Send + 'static,
{
    let name_cow = name.into();
    let name_for_task = name_cow.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        // Thrash detection window
        let window = Duration::from_secs(30);
        let mut window_start = Instant::now();
        let mut restarts_in_window: u32 = 0;
        loop {
            let result = std::panic::AssertUnwindSafe(factory()).catch_unwind().await;
            match result {
                Ok(()) => {
                    tracing::debug!(target: "daas::supervisor", task = %name_for_task, "supervised task completed normally");
                    break;
                }
                Err(_) => {
                    let now = Instant::now();
                    if now.duration_since(window_start) > window {
                        window_start = now;
                        restarts_in_window = 0;
                    }
                    restarts_in_window = restarts_in_window.saturating_add(1);
                    tracing::error!(
                        target: "daas::supervisor",
                        task = %name_for_task,
                        backoff_ms,
                        restarts_in_window,
                        "supervised task panicked; restarting"
                    );
                    if let Some(cb) = on_restart.as_mut() {
                        cb(restarts_in_window);
                    }
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms.saturating_mul(2)).min(10_000);
                }
            }
        }
    });
    TaskHandle::new(name_cow, handle)
}
