mod common;

use std::time::Duration;

use common::{QueueHome, wait_for_path};

const WAIT: Duration = Duration::from_secs(15);

fn fast_home() -> QueueHome {
    let home = QueueHome::new();
    home.stdout(&["config", "set", "poll_interval_ms", "50"]);
    home
}

// --- Single worker ---

#[test]
fn worker_completes_job_and_captures_log() {
    let home = fast_home();
    let id = home.enqueue("echo hello; echo oops >&2");

    let mut worker = home.spawn(&["worker", "run", "--id", "w-test"]);
    assert!(home.wait_for_count("completed", 1, WAIT), "job never completed");

    let completed = home.list("completed");
    assert_eq!(completed[0]["id"], id.as_str());
    assert_eq!(completed[0]["attempts"], 1);
    assert_eq!(completed[0]["output"], "hello\n");
    assert!(completed[0]["locked_by"].is_null());

    home.assert_cmd()
        .args(["logs", &id])
        .assert()
        .success()
        .stdout("hello\noops\n");

    home.stdout(&["worker", "stop"]);
    let status = worker.wait_exit(WAIT).expect("worker did not stop");
    assert!(status.success(), "worker exited with {status}");
}

#[test]
fn failing_job_exhausts_retries_into_dlq() {
    let home = fast_home();
    home.stdout(&["config", "set", "max_retries", "1"]);
    home.stdout(&["config", "set", "backoff_base", "1"]);
    let id = home.enqueue("echo broken >&2; exit 1");

    let mut worker = home.spawn(&["worker", "run"]);
    assert!(home.wait_for_count("dead", 1, WAIT), "job never died");

    home.stdout(&["worker", "stop"]);
    worker.wait_exit(WAIT).expect("worker did not stop");

    let dead = home.list("dead");
    assert_eq!(dead[0]["attempts"], 2);
    assert_eq!(dead[0]["last_error"], "broken");

    let dlq: Vec<serde_json::Value> =
        serde_json::from_str(&home.stdout(&["dlq", "list", "--json"])).unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0]["id"], id.as_str());
    assert_eq!(dlq[0]["last_error"], "broken");

    home.stdout(&["dlq", "retry", &id]);
    let pending = home.list("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["attempts"], 0);
    assert_eq!(home.status()["dlq"], 0);
}

#[test]
fn timed_out_job_is_killed_and_recorded() {
    let home = fast_home();
    home.stdout(&["config", "set", "job_timeout_ms", "500"]);
    home.stdout(&["config", "set", "max_retries", "0"]);
    home.enqueue("sleep 30");

    let _worker = home.spawn(&["worker", "run"]);
    assert!(
        home.wait_for_count("dead", 1, Duration::from_secs(10)),
        "timed out job never died"
    );

    let dead = home.list("dead");
    assert_eq!(dead[0]["last_error"], "timed out after 500ms");
}

#[test]
fn sigterm_lets_current_job_finish() {
    let home = fast_home();
    let id = home.enqueue("sleep 1; echo finished");

    let mut worker = home.spawn(&["worker", "run"]);
    assert!(home.wait_for_count("processing", 1, WAIT), "job never started");

    worker.terminate();
    let status = worker.wait_exit(WAIT).expect("worker did not exit");
    assert!(status.success(), "worker exited with {status}");

    let completed = home.list("completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["id"], id.as_str());
    assert_eq!(completed[0]["output"], "finished\n");
}

#[test]
fn worker_exits_immediately_when_stop_requested() {
    let home = fast_home();
    home.stdout(&["worker", "stop"]);
    home.enqueue("true");

    let mut worker = home.spawn(&["worker", "run"]);
    let status = worker.wait_exit(WAIT).expect("worker did not exit");
    assert!(status.success());
    assert_eq!(home.status()["pending"], 1);
}

// --- Pool ---

#[test]
fn pool_processes_each_job_exactly_once() {
    let home = fast_home();
    let ids: Vec<String> = (0..8)
        .map(|n| home.enqueue(&format!("sleep 0.1; echo {n}")))
        .collect();

    let mut pool = home.spawn(&["worker", "start", "--count", "3"]);
    assert!(home.wait_for_count("completed", 8, WAIT), "jobs never drained");

    let completed = home.list("completed");
    for job in &completed {
        assert_eq!(job["attempts"], 1, "job ran more than once: {job}");
    }
    let mut done: Vec<&str> = completed.iter().map(|j| j["id"].as_str().unwrap()).collect();
    done.sort();
    let mut expected: Vec<&str> = ids.iter().map(String::as_str).collect();
    expected.sort();
    assert_eq!(done, expected);

    home.stdout(&["worker", "stop"]);
    let status = pool.wait_exit(WAIT).expect("pool did not stop");
    assert!(status.success(), "pool exited with {status}");
}

#[test]
fn pool_start_clears_stale_stop_marker() {
    let home = fast_home();
    home.stdout(&["worker", "stop"]);
    home.enqueue("true");

    let _pool = home.spawn(&["worker", "start"]);
    assert!(home.wait_for_count("completed", 1, WAIT), "job never completed");
}

#[test]
fn pool_sigterm_stops_workers() {
    let home = fast_home();
    home.enqueue("true");

    let mut pool = home.spawn(&["worker", "start", "--count", "2"]);
    // A finished job means workers are running, so the pool is already listening.
    assert!(home.wait_for_count("completed", 1, WAIT), "workers never ran");
    pool.terminate();

    assert!(wait_for_path(&home.stop_flag_path(), WAIT), "stop marker not written");
    let status = pool.wait_exit(WAIT).expect("pool did not exit");
    assert!(status.success(), "pool exited with {status}");
}
