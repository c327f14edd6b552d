use crate::io::{read_frame, write_frame};
use crate::messaging::{ContextMap, WorkerInvocation, WorkerReport};
use log::error;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered work function.
///
/// Workers run in their own short-lived child process: they take the task's
/// options and the ambient context, and either return a result payload or
/// fail with an error that becomes the task's `Failed` output. Blocking
/// freely inside a worker is fine.
pub type WorkerFn =
    Arc<dyn Fn(serde_json::Value, &ContextMap) -> Result<serde_json::Value, anyhow::Error> + Send + Sync>;

/// A task referencing a worker name nobody registered.
#[derive(Debug, thiserror::Error)]
#[error("unknown worker {0:?}")]
pub struct UnknownWorker(pub String);

#[derive(Clone)]
struct WorkerEntry {
    func: WorkerFn,
    pool_size: usize,
}

/// The table of work functions, built explicitly during process bootstrap
/// and handed to the scheduler and worker pool constructors.
///
/// Every tier of the process tree (scheduler, pool, worker children) runs
/// the same binary and builds the same table, so a name registered here
/// resolves identically wherever it is looked up.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a work function under a name, with the number of child
    /// processes allowed to run it concurrently. A size below 1 is treated
    /// as 1.
    pub fn register<S, F>(&mut self, name: S, pool_size: usize, func: F)
    where
        S: Into<String>,
        F: Fn(serde_json::Value, &ContextMap) -> Result<serde_json::Value, anyhow::Error>
            + Send
            + Sync
            + 'static,
    {
        let entry = WorkerEntry { func: Arc::new(func), pool_size: pool_size.max(1) };
        self.workers.insert(name.into(), entry);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn pool_size(&self, name: &str) -> Option<usize> {
        self.workers.get(name).map(|entry| entry.pool_size)
    }

    /// Registered worker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.workers.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Invoke a worker in the calling process. Used by the exec child and by
    /// foreground diagnostic runs.
    pub fn run(
        &self,
        name: &str,
        options: serde_json::Value,
        context: &ContextMap,
    ) -> Result<serde_json::Value, anyhow::Error> {
        let entry = self.workers.get(name).ok_or_else(|| UnknownWorker(name.to_owned()))?;
        (entry.func)(options, context)
    }
}

/// Entry point of a worker child process.
///
/// Reads one invocation frame from stdin, runs the named work function, and
/// writes one report frame to stdout (which the pool parent reads back over
/// the pipe). Returns the process exit code: 0 on success, 1 when the work
/// function failed, 2 when the exchange itself broke down.
pub async fn exec_child(registry: &WorkerRegistry, name: &str) -> i32 {
    restore_default_signals();

    let mut stdin = tokio::io::stdin();
    let invocation: WorkerInvocation = match read_frame(&mut stdin).await {
        Ok(Some(invocation)) => invocation,
        Ok(None) => {
            error!(worker = name; "No invocation received on stdin");
            return 2;
        }
        Err(e) => {
            error!(worker = name, e:?; "Failed to read invocation");
            return 2;
        }
    };

    let (report, code) = match registry.run(name, invocation.options, &invocation.context) {
        Ok(output) => (WorkerReport::Success { output }, 0),
        Err(e) => (WorkerReport::Failure { message: format!("{e:#}") }, 1),
    };

    let mut stdout = tokio::io::stdout();
    match write_frame(&mut stdout, &report).await {
        Ok(()) => code,
        Err(e) => {
            error!(worker = name, e:?; "Failed to write report");
            2
        }
    }
}

/// Put signal handling back to the OS defaults so a worker can be
/// interrupted or killed cleanly, independent of whatever the pool parent
/// had installed.
fn restore_default_signals() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::signal(libc::SIGQUIT, libc::SIG_DFL);
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn echo_registry() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        registry.register("echo", 2, |options, _| Ok(options));
        registry.register("fail", 1, |_, _| Err(anyhow!("nope")));
        registry
    }

    #[test]
    fn run_dispatches_by_name() {
        let registry = echo_registry();
        let output = registry.run("echo", json!({"x": 1}), &ContextMap::new()).unwrap();
        assert_eq!(output, json!({"x": 1}));
    }

    #[test]
    fn run_surfaces_worker_errors() {
        let registry = echo_registry();
        let err = registry.run("fail", json!(null), &ContextMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn unknown_name_is_reported_as_such() {
        let registry = echo_registry();
        let err = registry.run("missing", json!(null), &ContextMap::new()).unwrap_err();
        assert!(err.downcast_ref::<UnknownWorker>().is_some());
    }

    #[test]
    fn context_reaches_the_worker() {
        let mut registry = WorkerRegistry::new();
        registry.register("read_ctx", 1, |_, context| {
            Ok(context.get("dsn").cloned().unwrap_or(serde_json::Value::Null))
        });

        let mut context = ContextMap::new();
        context.insert("dsn".to_owned(), json!("postgres://localhost"));
        let output = registry.run("read_ctx", json!(null), &context).unwrap();
        assert_eq!(output, json!("postgres://localhost"));
    }

    #[test]
    fn pool_size_is_clamped_to_at_least_one() {
        let mut registry = WorkerRegistry::new();
        registry.register("tiny", 0, |_, _| Ok(json!(null)));
        assert_eq!(registry.pool_size("tiny"), Some(1));
        assert_eq!(registry.pool_size("missing"), None);
    }

    #[test]
    fn names_are_sorted() {
        let registry = echo_registry();
        assert_eq!(registry.names(), vec!["echo".to_owned(), "fail".to_owned()]);
    }
}
