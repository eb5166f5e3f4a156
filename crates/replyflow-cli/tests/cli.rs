use assert_cmd::Command;
use predicates::str::{contains, starts_with};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn replyflow(data_dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("replyflow"));
    cmd.current_dir(data_dir.path())
        .env("REPLYFLOW_DIR", data_dir.path())
        .env_remove("REPLYFLOW_CONFIG")
        .env_remove("REPLYFLOW_TOKEN")
        .env_remove("REPLYFLOW_BASE_URL")
        .env("REPLYFLOW_POLL_INTERVAL_MS", "10");
    cmd
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("replyflow"));
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("ReplyFlow"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("replyflow"));
    cmd.arg("--version").assert().success();
}

#[test]
fn test_cli_completions() {
    let dir = tempfile::tempdir().unwrap();
    replyflow(&dir)
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(starts_with("_replyflow"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_polls_reply_to_stdout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "conversation_id": "c1",
            "message_id": "m1",
            "status": "queued"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/chat/messages/m1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "m1",
            "content": "Hello back",
            "status": "complete"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let uri = server.uri();
    tokio::task::spawn_blocking(move || {
        replyflow(&dir)
            .args(["send", "Hello", "--poll", "--base-url", uri.as_str()])
            .assert()
            .success()
            .stdout(contains("Hello back"))
            .stderr(contains("New conversation: c1"));
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_poll_prints_json_summary() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chat/messages/m7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "m7",
            "content": "Already done",
            "status": "complete"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let uri = server.uri();
    tokio::task::spawn_blocking(move || {
        replyflow(&dir)
            .args([
                "poll",
                "m7",
                "--conversation",
                "c3",
                "--format",
                "json",
                "--base-url",
                uri.as_str(),
            ])
            .assert()
            .success()
            .stdout(contains("\"content\": \"Already done\""))
            .stdout(contains("\"conversation_id\": \"c3\""));
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_reports_backend_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/messages"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let uri = server.uri();
    tokio::task::spawn_blocking(move || {
        replyflow(&dir)
            .args(["send", "Hello", "--poll", "--base-url", uri.as_str()])
            .assert()
            .failure()
            .stderr(contains("Error:"))
            .stderr(contains("REPLYFLOW_TOKEN"));
    })
    .await
    .unwrap();
}
