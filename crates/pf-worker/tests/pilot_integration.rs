//! Agent client integration tests
//!
//! Drives the HTTP agent client against an in-process axum server that
//! behaves like the on-device agent, both directly and through a tunnel
//! table entry.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use pf_core::{AgentProtocolError, DeviceSerial, TunnelError};
use pf_protocol::TaskInfo;
use pf_tunnel::TunnelTable;
use pf_worker::pilot::{Pilot, PilotClient, PilotEndpoint};

const STATUS_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Agent {
    installed: BTreeSet<String>,
    /// Status polls left before the current task finishes
    busy_polls: u32,
    task_info: Option<Value>,
    status_polls: u32,
    refuse_execution: bool,
    requests: Vec<(String, Value)>,
}

type Shared = Arc<Mutex<Agent>>;

async fn status(State(agent): State<Shared>) -> Json<Value> {
    let mut agent = agent.lock().unwrap();
    agent.status_polls += 1;
    if agent.busy_polls > 0 {
        agent.busy_polls -= 1;
        return Json(json!({"taskRunning": true, "taskInfo": agent.task_info}));
    }
    Json(json!({"taskRunning": false}))
}

async fn applications(State(agent): State<Shared>) -> Json<Value> {
    let agent = agent.lock().unwrap();
    let apps: serde_json::Map<String, Value> = agent
        .installed
        .iter()
        .map(|id| (id.clone(), json!({"CFBundleIdentifier": id})))
        .collect();
    Json(Value::Object(apps))
}

async fn install_appstore(State(agent): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    let mut agent = agent.lock().unwrap();
    if let Some(bundle_id) = body["appInfo"]["bundle-id"].as_str() {
        agent.installed.insert(bundle_id.to_string());
    }
    agent.busy_polls = 2;
    agent.task_info = Some(body["taskInfo"].clone());
    agent.requests.push(("install/appstore".into(), body));
    StatusCode::OK
}

async fn install_cydia(State(agent): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    agent.lock().unwrap().requests.push(("install/cydia".into(), body));
    StatusCode::OK
}

async fn open(State(agent): State<Shared>, Path(bundle_id): Path<String>, Json(body): Json<Value>) -> StatusCode {
    agent.lock().unwrap().requests.push((format!("open/{}", bundle_id), body));
    StatusCode::OK
}

async fn execute(
    State(agent): State<Shared>,
    Path(bundle_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut agent = agent.lock().unwrap();
    if agent.refuse_execution {
        return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response();
    }
    agent.busy_polls = 3;
    agent.task_info = Some(body["taskInfo"].clone());
    agent.requests.push((format!("execute/{}", bundle_id), body));
    StatusCode::OK.into_response()
}

async fn inject(State(agent): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let process = body["process"].clone();
    agent.lock().unwrap().requests.push(("inject".into(), body));
    Json(json!({"process": process, "result": "done"}))
}

async fn start_agent(agent: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/status", get(status))
        .route("/applications", get(applications))
        .route("/install/appstore", post(install_appstore))
        .route("/install/cydia", post(install_cydia))
        .route("/open/:bundle_id", post(open))
        .route("/execute/:bundle_id", post(execute))
        .route("/inject", post(inject))
        .with_state(agent);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn client() -> (PilotClient, Shared) {
    let agent = Shared::default();
    let addr = start_agent(agent.clone()).await;
    let endpoint = PilotEndpoint::Fixed(format!("http://{}/", addr));
    (PilotClient::new(endpoint, STATUS_POLL), agent)
}

fn task(run_id: &str) -> TaskInfo {
    let mut info = TaskInfo::new();
    info.insert("runId".into(), json!(run_id));
    info
}

#[tokio::test]
async fn test_store_install_waits_and_verifies() {
    let (pilot, agent) = client().await;
    let app_info = json!({"adam-id": "42", "bundle-id": "com.example.app"});

    assert!(pilot.install_from_store(&app_info, "111", task("r1")).await.unwrap());

    let agent = agent.lock().unwrap();
    let (path, body) = &agent.requests[0];
    assert_eq!(path, "install/appstore");
    assert_eq!(body["accountIdentifier"], "111");
    assert_eq!(body["appInfo"]["adam-id"], "42");
    assert_eq!(body["taskInfo"]["worker_action"], "install_appstore");
    assert_eq!(body["taskInfo"]["runId"], "r1");
    assert!(agent.status_polls >= 3);
}

#[tokio::test]
async fn test_store_install_of_present_app_is_rejected() {
    let (pilot, agent) = client().await;
    agent.lock().unwrap().installed.insert("com.example.app".into());

    let app_info = json!({"bundle-id": "com.example.app"});
    let result = pilot.install_from_store(&app_info, "111", TaskInfo::new()).await;

    assert!(matches!(result, Err(AgentProtocolError::AlreadyInstalled(id)) if id == "com.example.app"));
    assert!(agent.lock().unwrap().requests.is_empty());
}

#[tokio::test]
async fn test_execution_blocks_until_task_finishes() {
    let (pilot, agent) = client().await;

    assert!(pilot.run_auto_execution("com.example.app", task("r7")).await.unwrap());

    let agent = agent.lock().unwrap();
    let (path, body) = &agent.requests[0];
    assert_eq!(path, "execute/com.example.app");
    assert_eq!(body["taskInfo"]["bundleId"], "com.example.app");
    assert_eq!(body["taskInfo"]["runId"], "r7");
    assert_eq!(agent.busy_polls, 0);
    assert!(agent.status_polls >= 4);
}

#[tokio::test]
async fn test_refused_execution_returns_false() {
    let (pilot, agent) = client().await;
    agent.lock().unwrap().refuse_execution = true;

    assert!(!pilot.run_auto_execution("com.example.app", task("r7")).await.unwrap());
    assert_eq!(agent.lock().unwrap().status_polls, 0);
}

#[tokio::test]
async fn test_alternate_install_open_and_inject() {
    let (pilot, agent) = client().await;

    assert!(pilot
        .install_from_alternate_source("org.example.tweak", TaskInfo::new())
        .await
        .unwrap());
    assert!(pilot.open("org.example.tweak", TaskInfo::new()).await.unwrap());
    let result = pilot.inject("SpringBoard", "lock", TaskInfo::new()).await.unwrap();
    assert_eq!(result, json!({"process": "SpringBoard", "result": "done"}));

    let agent = agent.lock().unwrap();
    let paths: Vec<&str> = agent.requests.iter().map(|(path, _)| path.as_str()).collect();
    assert_eq!(paths, vec!["install/cydia", "open/org.example.tweak", "inject"]);
    assert_eq!(agent.requests[0].1["bundleId"], "org.example.tweak");
    assert_eq!(agent.requests[2].1["command"], "lock");
}

#[tokio::test]
async fn test_tunnel_endpoint_follows_table() {
    let agent = Shared::default();
    agent.lock().unwrap().installed.insert("com.example.app".into());
    let addr = start_agent(agent).await;

    let table = Arc::new(TunnelTable::new());
    let serial = DeviceSerial::new("device-1");
    let pilot = PilotClient::new(
        PilotEndpoint::Tunnel {
            handle: table.handle(),
            serial: serial.clone(),
        },
        STATUS_POLL,
    );

    assert!(matches!(
        pilot.installed_applications().await,
        Err(AgentProtocolError::Tunnel(TunnelError::NoEndpoint(_)))
    ));

    table.insert(serial, addr);
    let apps = pilot.installed_applications().await.unwrap();
    assert!(apps.contains("com.example.app"));
}

#[tokio::test]
async fn test_unreachable_agent_is_connectivity() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let pilot = PilotClient::new(PilotEndpoint::Fixed(format!("http://{}", addr)), STATUS_POLL);
    assert!(matches!(
        pilot.open("com.example.app", TaskInfo::new()).await,
        Err(AgentProtocolError::Connectivity(_))
    ));
}
