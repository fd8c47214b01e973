//! Pairs the `wcb` binary with a dApp through a local bridge server.

mod common;

use common::{run_wcb, wcb_binary, LocalBridge, WsDapp, WAIT};
use serde_json::{json, Value};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use wc_bridge::MethodCall;

const ACCOUNT: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

async fn next_line(lines: &mut Lines<BufReader<ChildStdout>>) -> Value {
    let line = tokio::time::timeout(WAIT, lines.next_line())
        .await
        .expect("timed out waiting for wcb")
        .unwrap()
        .expect("wcb closed stdout");
    serde_json::from_str(&line).unwrap()
}

fn spawn_pair(data_dir: &std::path::Path, uri: &str) -> Child {
    tokio::process::Command::new(wcb_binary())
        .arg("--json")
        .arg("--data-dir")
        .arg(data_dir)
        .args(["pair", uri, "--account", ACCOUNT])
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to start wcb")
}

#[tokio::test]
async fn test_list_empty() {
    let temp = TempDir::new().unwrap();
    let result = run_wcb(temp.path(), &["list"]).await;
    assert_eq!(result["status"], "ok");
    assert_eq!(result["command"], "list");
    assert_eq!(result["data"]["sessions"], json!([]));
}

#[tokio::test]
async fn test_show_unknown_session_fails() {
    let temp = TempDir::new().unwrap();
    let output = tokio::process::Command::new(wcb_binary())
        .arg("--json")
        .arg("--data-dir")
        .arg(temp.path())
        .args(["show", "missing"])
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    let error: Value = serde_json::from_str(stderr.lines().last().unwrap()).unwrap();
    assert_eq!(error["status"], "error");
}

#[tokio::test]
async fn test_set_account_is_reported_by_config() {
    let temp = TempDir::new().unwrap();
    run_wcb(temp.path(), &["set-account", ACCOUNT]).await;
    let result = run_wcb(temp.path(), &["config"]).await;
    assert_eq!(result["data"]["account"], ACCOUNT);
    assert_eq!(result["data"]["bridge"]["chainId"], 1);
}

#[tokio::test]
async fn test_pair_then_close() {
    let bridge = LocalBridge::new().await;
    let temp = TempDir::new().unwrap();
    let mut dapp = WsDapp::connect(&bridge, "socket-dapp").await;

    let mut child = spawn_pair(temp.path(), &dapp.uri());
    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();

    let paired = next_line(&mut lines).await;
    assert_eq!(paired["command"], "pair");
    let session_id = paired["data"]["sessionId"].as_str().unwrap().to_string();
    assert_eq!(session_id, dapp.config.handshake_topic);

    dapp.handshake(1).await;
    match dapp.next_call().await {
        MethodCall::Response {
            id: 1,
            result: Some(result),
            error: None,
        } => {
            assert_eq!(result["approved"], json!(true));
            assert_eq!(result["accounts"], json!([ACCOUNT]));
        }
        other => panic!("unexpected {:?}", other),
    }

    loop {
        let event = next_line(&mut lines).await;
        if event["event"] == "session_approved" {
            assert_eq!(event["sessionId"], session_id.as_str());
            break;
        }
    }
    child.kill().await.unwrap();

    let listed = run_wcb(temp.path(), &["list"]).await;
    let sessions = listed["data"]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["status"], "active");
    assert_eq!(sessions[0]["dappName"], "Socket dApp");
    assert_eq!(sessions[0]["approvedAccounts"], json!([ACCOUNT]));

    let closed = run_wcb(temp.path(), &["close", &session_id]).await;
    assert_eq!(closed["data"]["sessionId"], session_id.as_str());
    match dapp.next_call().await {
        MethodCall::SessionUpdate { params, .. } => assert!(!params.approved),
        other => panic!("unexpected {:?}", other),
    }

    let listed = run_wcb(temp.path(), &["list"]).await;
    assert_eq!(listed["data"]["sessions"], json!([]));
}
