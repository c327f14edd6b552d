use crate::io::{read_frame, write_frame};
use crate::messaging::{ContextMap, StatusUpdate, Task, TaskId, TaskStatus, WorkerInvocation, WorkerReport};
use crate::pool::EXEC_SUBCOMMAND;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use log::warn;
use serde_json::json;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::task::JoinSet;

/// Bookkeeping for one in-flight worker child.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub id: TaskId,
    pub worker_name: String,
    pub pid: u32,
}

/// Everything known about a worker child once it has exited.
#[derive(Debug)]
pub struct FinishedTask {
    pub id: TaskId,
    pub worker_name: String,
    pub wait: std::io::Result<ExitStatus>,
    pub report: Option<WorkerReport>,
}

/// Spawn one OS process executing a task's work function.
///
/// The child is this same binary re-executed in worker mode. It receives
/// `{options, context}` on stdin; its stdout carries the report frame back.
/// The wait-and-collect future lands in `children` so the pool's supervision
/// step can reap it without blocking.
pub async fn spawn_task(
    task: &Task,
    context: &ContextMap,
    children: &mut JoinSet<FinishedTask>,
) -> Result<RunningTask, anyhow::Error> {
    let exe = std::env::current_exe().context("locating current executable")?;
    let mut child = Command::new(exe)
        .arg(EXEC_SUBCOMMAND)
        .arg(&task.worker_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .context("spawning worker process")?;

    let pid = child.id().ok_or_else(|| anyhow!("worker process exited before it was tracked"))?;

    let invocation = WorkerInvocation { options: task.options.clone(), context: context.clone() };
    let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("worker stdin not captured"))?;
    write_frame(&mut stdin, &invocation).await.context("sending invocation to worker")?;
    drop(stdin);

    let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("worker stdout not captured"))?;
    let id = task.id.clone();
    let worker_name = task.worker_name.clone();
    children.spawn(async move {
        let report = read_frame::<_, WorkerReport>(&mut stdout).await.unwrap_or_default();
        let wait = child.wait().await;
        FinishedTask { id, worker_name, wait, report }
    });

    Ok(RunningTask { id: task.id.clone(), worker_name: task.worker_name.clone(), pid })
}

/// Ask a running worker child to stop. The child runs with default signal
/// dispositions, so SIGTERM kills it and supervision later classifies the
/// death as `Aborted`.
pub fn terminate(running: &RunningTask) {
    let rc = unsafe { libc::kill(running.pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        // Already gone; supervision will reap it.
        warn!(pid = running.pid, id:% = running.id; "Could not signal worker process");
    }
}

/// Turn a reaped child into the status event reported to the scheduler.
///
/// Killed by signal means `Aborted`. A clean exit is `Done` only when the
/// child actually produced a result payload; a silent clean exit means the
/// work function bailed before reporting, which is a failure. Everything
/// else is `Failed`, carrying the child's own error message when one made it
/// out of the pipe.
pub fn classify_outcome(finished: &FinishedTask, now: DateTime<Utc>) -> StatusUpdate {
    let id = finished.id.clone();

    let status = match &finished.wait {
        Err(e) => {
            return StatusUpdate::new(id, TaskStatus::Failed)
                .stopped_at(now)
                .with_output(json!(format!("waiting for worker process failed: {e}")))
        }
        Ok(status) => status,
    };

    if let Some(signal) = status.signal() {
        return StatusUpdate::new(id, TaskStatus::Aborted)
            .stopped_at(now)
            .with_output(json!(format!("worker terminated by signal {signal}")));
    }

    match (status.code(), &finished.report) {
        (Some(0), Some(WorkerReport::Success { output })) => {
            StatusUpdate::new(id, TaskStatus::Done).stopped_at(now).with_output(output.clone())
        }
        (Some(0), None) => StatusUpdate::new(id, TaskStatus::Failed)
            .stopped_at(now)
            .with_output(json!("worker exited without reporting a result")),
        (_, Some(WorkerReport::Failure { message })) => {
            StatusUpdate::new(id, TaskStatus::Failed).stopped_at(now).with_output(json!(message))
        }
        (code, _) => StatusUpdate::new(id, TaskStatus::Failed)
            .stopped_at(now)
            .with_output(json!(format!("worker exited with code {}", code.unwrap_or(-1)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(raw: i32, report: Option<WorkerReport>) -> FinishedTask {
        FinishedTask {
            id: TaskId::new("t1"),
            worker_name: "echo".to_owned(),
            wait: Ok(ExitStatus::from_raw(raw)),
            report,
        }
    }

    #[test]
    fn clean_exit_with_report_is_done() {
        let fin = finished(0, Some(WorkerReport::Success { output: json!({"x": 1}) }));
        let update = classify_outcome(&fin, Utc::now());
        assert_eq!(update.status, TaskStatus::Done);
        assert_eq!(update.output, Some(json!({"x": 1})));
        assert!(update.stop_datetime.is_some());
    }

    #[test]
    fn clean_exit_without_report_is_failed() {
        let update = classify_outcome(&finished(0, None), Utc::now());
        assert_eq!(update.status, TaskStatus::Failed);
    }

    #[test]
    fn nonzero_exit_is_failed_with_reported_message() {
        let fin = finished(1 << 8, Some(WorkerReport::Failure { message: "boom".to_owned() }));
        let update = classify_outcome(&fin, Utc::now());
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(update.output, Some(json!("boom")));
    }

    #[test]
    fn nonzero_exit_without_report_mentions_the_code() {
        let update = classify_outcome(&finished(3 << 8, None), Utc::now());
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(update.output, Some(json!("worker exited with code 3")));
    }

    #[test]
    fn death_by_signal_is_aborted() {
        let update = classify_outcome(&finished(libc::SIGTERM, None), Utc::now());
        assert_eq!(update.status, TaskStatus::Aborted);
    }

    #[test]
    fn wait_error_is_failed() {
        let fin = FinishedTask {
            id: TaskId::new("t1"),
            worker_name: "echo".to_owned(),
            wait: Err(std::io::Error::other("lost")),
            report: None,
        };
        assert_eq!(classify_outcome(&fin, Utc::now()).status, TaskStatus::Failed);
    }
}
