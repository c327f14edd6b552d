//! Full-tree scenarios against the built binary: scheduler process, worker
//! pool process and worker children, talked to through the control socket.

use chrono::{Duration as ChronoDuration, Utc};
use drudge::control::{ControlClient, ControlClientOptions};
use drudge::messaging::{Task, TaskId, TaskSpec, TaskStatus};
use serde_json::json;
use std::process::Child;
use std::time::{Duration, Instant};

struct Server {
    child: Child,
    // Holds the socket; removed with the test.
    _dir: tempfile::TempDir,
}

impl Server {
    async fn start(token: Option<&str>) -> (Server, ControlClient) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("drudge.sock");

        let mut command = std::process::Command::new(env!("CARGO_BIN_EXE_drudge"));
        command.args(["serve", "--in-memory", "--tick-ms", "100"]).arg("--socket").arg(&socket);
        if let Some(token) = token {
            command.args(["--token", token]);
        }
        let child = command.spawn().expect("starting drudge serve");

        let deadline = Instant::now() + Duration::from_secs(15);
        while !socket.exists() {
            assert!(Instant::now() < deadline, "scheduler did not come up in time");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let client = ControlClient::new(ControlClientOptions {
            socket_path: socket,
            token: token.map(str::to_owned),
        });
        (Server { child, _dir: dir }, client)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn wait_until<F>(client: &ControlClient, condition: F, timeout: Duration) -> Vec<Task>
where
    F: Fn(&[Task]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let tasks = client.list().await.expect("listing tasks");
        if condition(&tasks) {
            return tasks;
        }
        assert!(Instant::now() < deadline, "condition not reached in time, tasks: {tasks:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn find<'a>(tasks: &'a [Task], id: &TaskId) -> &'a Task {
    tasks.iter().find(|task| &task.id == id).expect("task disappeared")
}

#[tokio::test]
async fn echo_task_runs_to_done_with_its_output() {
    let (_server, client) = Server::start(None).await;

    let id = client.submit(TaskSpec::new("echo", json!({"x": 1}))).await.unwrap();

    let tasks = wait_until(
        &client,
        |tasks| tasks.iter().any(|t| t.id == id && t.status == TaskStatus::Done),
        Duration::from_secs(20),
    )
    .await;

    let task = find(&tasks, &id);
    assert_eq!(task.output, Some(json!({"x": 1})));
    assert!(task.stop_datetime.is_some());
}

#[tokio::test]
async fn failing_worker_reports_its_error() {
    let (_server, client) = Server::start(None).await;

    let id = client
        .submit(TaskSpec::new("fail", json!({"message": "collector unreachable"})))
        .await
        .unwrap();

    let tasks = wait_until(
        &client,
        |tasks| tasks.iter().any(|t| t.id == id && t.status == TaskStatus::Failed),
        Duration::from_secs(20),
    )
    .await;

    assert_eq!(find(&tasks, &id).output, Some(json!("collector unreachable")));
}

#[tokio::test]
async fn pool_size_one_never_runs_two_at_once() {
    let (_server, client) = Server::start(None).await;

    // The bundled "sleep" worker has pool_size 1.
    let first = client.submit(TaskSpec::new("sleep", json!({"seconds": 2.0}))).await.unwrap();
    let second = client.submit(TaskSpec::new("sleep", json!({"seconds": 2.0}))).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut saw_one_waiting = false;
    loop {
        let tasks = client.list().await.unwrap();
        let doing = tasks.iter().filter(|t| t.status == TaskStatus::Doing).count();
        assert!(doing <= 1, "pool size exceeded: {tasks:?}");

        let waiting = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Scheduled | TaskStatus::Queued))
            .count();
        if doing == 1 && waiting == 1 {
            saw_one_waiting = true;
        }

        let done = [&first, &second]
            .into_iter()
            .all(|id| tasks.iter().any(|t| &t.id == id && t.status == TaskStatus::Done));
        if done {
            break;
        }

        assert!(Instant::now() < deadline, "sleep tasks never finished: {tasks:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(saw_one_waiting, "second task was never observed waiting its turn");
}

#[tokio::test]
async fn cancel_before_start_never_spawns_a_child() {
    let (_server, client) = Server::start(None).await;

    // Not due for an hour, so the pool never sees it.
    let mut spec = TaskSpec::new("echo", json!({"x": 1}));
    spec.start_datetime = Some(Utc::now() + ChronoDuration::seconds(3600));
    let id = client.submit(spec).await.unwrap();

    assert!(client.cancel(id.clone()).await.unwrap());

    let tasks = wait_until(
        &client,
        |tasks| tasks.iter().any(|t| t.id == id && t.status == TaskStatus::Canceled),
        Duration::from_secs(10),
    )
    .await;
    let task = find(&tasks, &id);
    assert!(task.output.is_none(), "a child ran for a canceled task");
    assert!(task.stop_datetime.is_some());

    // And it stays canceled across further sweeps.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let tasks = client.list().await.unwrap();
    assert_eq!(find(&tasks, &id).status, TaskStatus::Canceled);

    // A second cancel is a no-op.
    assert!(!client.cancel(id).await.unwrap());
}

#[tokio::test]
async fn redo_interval_rearms_and_clears_output() {
    let (_server, client) = Server::start(None).await;

    let mut spec = TaskSpec::new("echo", json!({"beat": true}));
    spec.redo_interval = Some(1);
    let id = client.submit(spec).await.unwrap();

    let tasks = wait_until(
        &client,
        |tasks| tasks.iter().any(|t| t.id == id && t.status == TaskStatus::Done),
        Duration::from_secs(20),
    )
    .await;
    let first_stop = find(&tasks, &id).stop_datetime.unwrap();

    // A later completion proves the task went back through the whole
    // schedule/queue/run cycle.
    wait_until(
        &client,
        |tasks| {
            tasks.iter().any(|t| {
                t.id == id
                    && t.status == TaskStatus::Done
                    && t.stop_datetime.is_some_and(|stop| stop > first_stop)
            })
        },
        Duration::from_secs(20),
    )
    .await;

    // Cancel ends the series.
    client.cancel(id.clone()).await.unwrap();
    wait_until(
        &client,
        |tasks| {
            tasks
                .iter()
                .all(|t| t.id != id || matches!(t.status, TaskStatus::Canceled | TaskStatus::Doing))
        },
        Duration::from_secs(10),
    )
    .await;
}

#[tokio::test]
async fn duplicate_id_is_rejected_over_the_socket() {
    let (_server, client) = Server::start(None).await;

    let mut spec = TaskSpec::new("echo", json!(null));
    spec.id = Some(TaskId::new("fixed"));
    spec.start_datetime = Some(Utc::now() + ChronoDuration::seconds(3600));

    client.submit(spec.clone()).await.unwrap();
    let err = client.submit(spec).await.unwrap_err();
    assert!(err.to_string().contains("already exists"), "got: {err:#}");
}

#[tokio::test]
async fn unknown_worker_is_rejected_on_submission() {
    let (_server, client) = Server::start(None).await;

    let err = client.submit(TaskSpec::new("no-such-worker", json!(null))).await.unwrap_err();
    assert!(err.to_string().contains("unknown worker"), "got: {err:#}");
}

#[tokio::test]
async fn wrong_token_is_turned_away() {
    let (server, client) = Server::start(Some("hunter2")).await;

    // The right token works.
    assert!(client.list().await.unwrap().is_empty());

    let anonymous = ControlClient::new(ControlClientOptions {
        socket_path: server._dir.path().join("drudge.sock"),
        token: None,
    });
    let err = anonymous.list().await.unwrap_err();
    assert!(err.to_string().contains("authentication failed"), "got: {err:#}");
}

#[tokio::test]
async fn context_round_trips_through_the_scheduler() {
    let (_server, client) = Server::start(None).await;

    let mut pairs = drudge::messaging::ContextMap::new();
    pairs.insert("fleet".to_owned(), json!("production"));
    let merged = client.set_context(pairs).await.unwrap();
    assert_eq!(merged.get("fleet"), Some(&json!("production")));

    let context = client.get_context().await.unwrap();
    assert_eq!(context.get("fleet"), Some(&json!("production")));
}
