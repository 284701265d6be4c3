// ABOUTME: Runner loop integration tests: wiremock coordinator plus scripted fake driver

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path as url_path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use kiln_runner::config::{Config, LxdConfig, RunnerConfig, ScriptConfig};
use kiln_runner::connection::Connection;
use kiln_runner::lxd::ContainerDriver;
use kiln_runner::runner::Runner;
use kiln_runner::workspace::Cloner;
use support::{ChannelScript, FailingCloner, FakeDriver, NoopCloner};

fn config(endpoint: &str, repository_dir: &Path) -> Config {
    Config {
        runner: RunnerConfig {
            token: "tok".to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            repository_dir: repository_dir.to_path_buf(),
            interval: 1,
            instances: 2,
        },
        lxd: LxdConfig {
            endpoint: "https://lxd.invalid:8443".to_string(),
            cert: "/dev/null".into(),
            key: "/dev/null".into(),
            verify: false,
            profiles: vec!["default".to_string()],
        },
        script: ScriptConfig::default(),
    }
}

/// Spawn a runner against the mock coordinator; returns the shutdown token
/// and the join handle.
fn spawn_runner(
    config: &Config,
    driver: Arc<dyn ContainerDriver>,
    cloner: Arc<dyn Cloner>,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let connection = Connection::new(config.runner.endpoint.clone())
        .unwrap()
        .with_report_policy(2, Duration::from_millis(20));
    let token = CancellationToken::new();
    let runner = Runner::new(config, connection, driver, cloner, token.clone());
    let handle = tokio::spawn(async move { runner.run().await });
    (token, handle)
}

async fn reports(server: &MockServer) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.method.to_string() == "POST")
        .collect()
}

async fn wait_for_report(server: &MockServer, status: &str) -> Request {
    let deadline = Duration::from_secs(10);
    let start = std::time::Instant::now();
    loop {
        if let Some(request) = reports(server).await.into_iter().find(|request| {
            request
                .url
                .query()
                .is_some_and(|query| query.contains(&format!("status={status}")))
        }) {
            return request;
        }
        assert!(
            start.elapsed() < deadline,
            "no {status} report within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Queue that hands out the payload once, then reports an empty queue.
async fn mount_queue_once(server: &MockServer, payload: serde_json::Value) {
    Mock::given(method("GET"))
        .and(url_path("/jobs/queue/tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payload))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/jobs/queue/tok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

fn respond_ok() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"status": "OK"}))
}

#[tokio::test]
async fn fast_failing_job_reports_completed_with_the_marker_stream() {
    let server = MockServer::start().await;
    let workspace = tempfile::tempdir().unwrap();

    let mut payload = support::job_payload("job-1", &["exit 1"]);
    payload["after_failure"] = json!(["echo 1"]);
    mount_queue_once(&server, payload).await;
    Mock::given(method("POST"))
        .and(url_path("/jobs/report/job-1"))
        .respond_with(respond_ok())
        .mount(&server)
        .await;

    // What the container would print for this job.
    let driver = Arc::new(FakeDriver::with_output(
        ChannelScript::lines(&[
            "::kiln:command:0:start:100::",
            "::kiln:command:0:end:100:1::",
            "::kiln:after_failure:0:start:100::",
            "1",
            "::kiln:after_failure:0:end:101:0::",
        ]),
        ChannelScript::default(),
    ));

    let config = config(&server.uri(), workspace.path());
    let (token, handle) = spawn_runner(&config, driver.clone(), Arc::new(NoopCloner));

    let completed = wait_for_report(&server, "COMPLETED").await;
    token.cancel();
    handle.await.unwrap();

    let log = String::from_utf8(completed.body.clone()).unwrap();
    assert!(log.contains("::kiln:command:0:end:100:1::"));
    assert!(log.contains("::kiln:after_failure:0:start:100::"));
    assert!(log.contains("\n1\n"));
    assert!(log.contains("::kiln:after_failure:0:end:101:0::"));

    // A failing script is not an infrastructure failure: no ERROR report.
    for report in reports(&server).await {
        assert!(!report.url.query().unwrap_or("").contains("status=ERROR"));
    }

    // The clone directory is keyed by the job secret.
    assert!(workspace.path().join("job-1").is_dir());

    // Exactly one container lived and died.
    assert_eq!(driver.created_names().len(), 1);
    assert_eq!(driver.deleted_names(), driver.created_names());
}

#[tokio::test]
async fn cancel_directive_stops_polling_and_suppresses_the_terminal_report() {
    let server = MockServer::start().await;
    let workspace = tempfile::tempdir().unwrap();

    mount_queue_once(&server, support::job_payload("job-2", &["sleep 600"])).await;
    Mock::given(method("POST"))
        .and(url_path("/jobs/report/job-2"))
        .respond_with(respond_ok())
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/jobs/report/job-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "CANCEL"})))
        .mount(&server)
        .await;

    // A job that would run for a long time.
    let driver = Arc::new(FakeDriver::with_output(
        ChannelScript::silent_for(Duration::from_secs(120)),
        ChannelScript::silent_for(Duration::from_secs(120)),
    ));

    let config = config(&server.uri(), workspace.path());
    let (token, handle) = spawn_runner(&config, driver.clone(), Arc::new(NoopCloner));

    wait_for_report(&server, "RUNNING").await;

    // Give the loop time to receive CANCEL and prove it goes quiet.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let after_cancel = reports(&server).await.len();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(reports(&server).await.len(), after_cancel);

    // Exactly two RUNNING reports went out (OK, then CANCEL), nothing else.
    assert_eq!(after_cancel, 2);
    for report in reports(&server).await {
        assert!(report.url.query().unwrap_or("").contains("status=RUNNING"));
    }

    // Cancellation still tears the container down.
    assert_eq!(driver.deleted_names(), driver.created_names());

    token.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn invalid_payload_with_a_secret_reports_error() {
    let server = MockServer::start().await;
    let workspace = tempfile::tempdir().unwrap();

    mount_queue_once(&server, json!({"secret": "bad-1"})).await;
    Mock::given(method("POST"))
        .and(url_path("/jobs/report/bad-1"))
        .respond_with(respond_ok())
        .mount(&server)
        .await;

    let driver = Arc::new(FakeDriver::default());
    let config = config(&server.uri(), workspace.path());
    let (token, handle) = spawn_runner(&config, driver.clone(), Arc::new(NoopCloner));

    let report = wait_for_report(&server, "ERROR").await;
    token.cancel();
    handle.await.unwrap();

    assert!(report.url.path().ends_with("/jobs/report/bad-1"));
    // Nothing was executed for the rejected payload.
    assert!(driver.created_names().is_empty());
}

#[tokio::test]
async fn payload_without_a_secret_is_dropped_silently() {
    let server = MockServer::start().await;
    let workspace = tempfile::tempdir().unwrap();

    mount_queue_once(&server, json!({"image": "alpine/3.20"})).await;

    let driver = Arc::new(FakeDriver::default());
    let config = config(&server.uri(), workspace.path());
    let (token, handle) = spawn_runner(&config, driver.clone(), Arc::new(NoopCloner));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    token.cancel();
    handle.await.unwrap();

    assert!(reports(&server).await.is_empty());
    assert!(driver.created_names().is_empty());
}

#[tokio::test]
async fn empty_queue_sleeps_one_interval_and_retries() {
    let server = MockServer::start().await;
    let workspace = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(url_path("/jobs/queue/tok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let driver = Arc::new(FakeDriver::default());
    let config = config(&server.uri(), workspace.path());
    let (token, handle) = spawn_runner(&config, driver, Arc::new(NoopCloner));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    token.cancel();
    handle.await.unwrap();

    // interval = 1s: roughly one fetch per second, all of them GETs.
    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 2, "expected repeated polls, got {}", requests.len());
    assert!(requests.iter().all(|request| request.method.to_string() == "GET"));
}

#[tokio::test]
async fn clone_failure_reports_error_and_abandons_the_job() {
    let server = MockServer::start().await;
    let workspace = tempfile::tempdir().unwrap();

    mount_queue_once(&server, support::job_payload("job-3", &["true"])).await;
    Mock::given(method("POST"))
        .and(url_path("/jobs/report/job-3"))
        .respond_with(respond_ok())
        .mount(&server)
        .await;

    let driver = Arc::new(FakeDriver::default());
    let config = config(&server.uri(), workspace.path());
    let (token, handle) = spawn_runner(&config, driver.clone(), Arc::new(FailingCloner));

    wait_for_report(&server, "ERROR").await;
    token.cancel();
    handle.await.unwrap();

    assert!(driver.created_names().is_empty());
}

#[tokio::test]
async fn session_start_failure_reports_error_after_teardown() {
    let server = MockServer::start().await;
    let workspace = tempfile::tempdir().unwrap();

    mount_queue_once(&server, support::job_payload("job-4", &["true"])).await;
    Mock::given(method("POST"))
        .and(url_path("/jobs/report/job-4"))
        .respond_with(respond_ok())
        .mount(&server)
        .await;

    let driver = Arc::new(FakeDriver {
        fail_exec: true,
        ..Default::default()
    });
    let config = config(&server.uri(), workspace.path());
    let (token, handle) = spawn_runner(&config, driver.clone(), Arc::new(NoopCloner));

    wait_for_report(&server, "ERROR").await;
    token.cancel();
    handle.await.unwrap();

    assert_eq!(driver.deleted_names(), driver.created_names());
}
