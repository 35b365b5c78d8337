//! Self-contained integration tests for the control server
//!
//! These tests run setup in a server mode, which binds the control server on
//! an ephemeral port, and talk to it over TCP.

use core_agent::bridge::SetupRequest;
use core_agent::control::{ApiError, ApiRequest, ApiResponse, ControlAction};
use core_agent::{Bridge, CoreState};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SECRET: &str = "integration-secret";

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect to control server");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, request: &ApiRequest) -> ApiResponse {
        let mut line = request.to_json().unwrap();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();

        let mut response = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut response))
            .await
            .expect("Timed out waiting for response")
            .unwrap();
        ApiResponse::from_json(response.trim()).unwrap()
    }
}

fn setup_request(dir: &TempDir, mode: i32, secret: &str) -> SetupRequest {
    SetupRequest {
        base_path: dir.path().to_string_lossy().into_owned(),
        working_dir: dir.path().join("work").to_string_lossy().into_owned(),
        temp_dir: dir.path().join("tmp").to_string_lossy().into_owned(),
        status_port: 0,
        debug: false,
        mode,
        listen: "127.0.0.1:0".to_string(),
        secret: secret.to_string(),
    }
}

fn write_profile(dir: &TempDir) -> String {
    let path = dir.path().join("profile.json");
    std::fs::write(
        &path,
        r#"{"outbounds": [
            {"type": "selector", "tag": "proxy", "outbounds": ["a", "b"]},
            {"type": "socks", "tag": "a", "server": "127.0.0.1", "server_port": 1080},
            {"type": "socks", "tag": "b", "server": "127.0.0.1", "server_port": 1081}
        ]}"#,
    )
    .unwrap();
    path.to_string_lossy().into_owned()
}

async fn server_addr(bridge: &Bridge) -> SocketAddr {
    bridge
        .controller()
        .control_server_addr()
        .await
        .expect("Control server is not running")
}

#[tokio::test]
async fn test_insecure_server_drives_lifecycle() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let profile = write_profile(&dir);
    let bridge = Bridge::default();
    assert_eq!(bridge.setup(setup_request(&dir, 3, "")).await, "");

    let mut client = Client::connect(server_addr(&bridge).await).await;

    let response = client
        .send(&ApiRequest::new("1", ControlAction::Status))
        .await;
    assert!(response.success);
    let data = response.data.unwrap();
    assert_eq!(data["core_state"], "STOPPED");

    let response = client
        .send(
            &ApiRequest::new("2", ControlAction::Start)
                .with_params(json!({ "config_path": profile })),
        )
        .await;
    assert!(response.success, "start failed: {:?}", response.error);
    assert_eq!(bridge.status().core_state, CoreState::Started);

    let response = client
        .send(
            &ApiRequest::new("3", ControlAction::SelectOutbound)
                .with_params(json!({ "group": "proxy", "outbound": "b" })),
        )
        .await;
    assert!(response.success);

    let response = client
        .send(
            &ApiRequest::new("4", ControlAction::SelectOutbound)
                .with_params(json!({ "group": "nope", "outbound": "b" })),
        )
        .await;
    assert!(!response.success);
    assert_eq!(
        response.error,
        Some(ApiError::GroupNotFound("nope".to_string()))
    );

    let response = client
        .send(&ApiRequest::new("5", ControlAction::Stop))
        .await;
    assert!(response.success);
    assert_eq!(response.id, "5");
    assert_eq!(bridge.status().core_state, CoreState::Stopped);

    bridge.close(3).await;
    assert!(bridge.controller().control_server_addr().await.is_none());
}

#[tokio::test]
async fn test_secured_server_requires_secret() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let bridge = Bridge::default();
    assert_eq!(bridge.setup(setup_request(&dir, 1, SECRET)).await, "");

    let mut client = Client::connect(server_addr(&bridge).await).await;

    let response = client
        .send(&ApiRequest::new("1", ControlAction::Status))
        .await;
    assert_eq!(response.error, Some(ApiError::AuthenticationFailed));

    let response = client
        .send(&ApiRequest::new("2", ControlAction::Status).with_secret("wrong-secret"))
        .await;
    assert_eq!(response.error, Some(ApiError::AuthenticationFailed));

    let response = client
        .send(&ApiRequest::new("3", ControlAction::Status).with_secret(SECRET))
        .await;
    assert!(response.success);

    bridge.close(1).await;
}

#[tokio::test]
async fn test_secured_server_checks_registered_client_keys() {
    use core_agent::security::KeyPair;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let bridge = Bridge::default();
    assert_eq!(bridge.setup(setup_request(&dir, 1, SECRET)).await, "");
    assert_eq!(bridge.get_server_public_key().len(), 32);

    let registered = KeyPair::generate();
    let stranger = KeyPair::generate();
    assert_eq!(
        bridge
            .add_client_public_key(registered.public.as_bytes())
            .await,
        ""
    );

    let mut client = Client::connect(server_addr(&bridge).await).await;

    let response = client
        .send(&ApiRequest::new("1", ControlAction::Status).with_secret(SECRET))
        .await;
    assert_eq!(response.error, Some(ApiError::AuthenticationFailed));

    let response = client
        .send(
            &ApiRequest::new("2", ControlAction::Status)
                .with_secret(SECRET)
                .with_client_key(stranger.public.to_base64()),
        )
        .await;
    assert_eq!(response.error, Some(ApiError::AuthenticationFailed));

    let response = client
        .send(
            &ApiRequest::new("3", ControlAction::Status)
                .with_secret(SECRET)
                .with_client_key(registered.public.to_base64()),
        )
        .await;
    assert!(response.success);

    bridge.close(1).await;
}

#[tokio::test]
async fn test_invalid_json_gets_parse_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let bridge = Bridge::default();
    assert_eq!(bridge.setup(setup_request(&dir, 3, "")).await, "");

    let stream = TcpStream::connect(server_addr(&bridge).await).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"{ nope\n").await.unwrap();

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    let response = ApiResponse::from_json(line.trim()).unwrap();
    assert!(!response.success);
    assert!(matches!(response.error, Some(ApiError::ParseError(_))));

    bridge.close(3).await;
}

#[tokio::test]
async fn test_setup_rejects_short_secret() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let bridge = Bridge::default();

    let message = bridge.setup(setup_request(&dir, 1, "short")).await;
    assert!(message.starts_with("setup error"));
    assert!(bridge.controller().control_server_addr().await.is_none());
}
