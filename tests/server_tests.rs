use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use portwatch_rs::banner::NoopBannerGrabber;
use portwatch_rs::config::ScanConfig;
use portwatch_rs::decision::DecisionEngine;
use portwatch_rs::engine::{EngineParams, EngineSet, PortStream, ScanEngine};
use portwatch_rs::hub::ProgressHub;
use portwatch_rs::netdetect::StaticNetworkFacts;
use portwatch_rs::orchestrator::Orchestrator;
use portwatch_rs::server::{router, AppState};
use portwatch_rs::store::EmbeddedStore;
use portwatch_rs::types::{EngineKind, OpenPortRecord};
use portwatch_rs::{Result, ScanError};

const TOKEN: &str = "s3cret";

/// Yields fixed records; optionally never finishes.
struct StubEngine {
    kind: EngineKind,
    records: Vec<OpenPortRecord>,
    hang: bool,
}

#[async_trait]
impl ScanEngine for StubEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self, _params: &EngineParams, _cancel: CancellationToken) -> Result<PortStream> {
        use tokio_stream::StreamExt;
        let stream = tokio_stream::iter(self.records.clone().into_iter().map(Ok::<_, ScanError>));
        if self.hang {
            Ok(Box::pin(stream.chain(tokio_stream::pending())))
        } else {
            Ok(Box::pin(stream))
        }
    }
}

struct TestApp {
    app: Router,
    orch: Orchestrator,
    _assets: tempfile::TempDir,
}

fn test_app(defaults: ScanConfig, hang_fast: bool) -> TestApp {
    let facts = StaticNetworkFacts {
        interface: Some("eth0".into()),
        source: Some(Ipv4Addr::new(192, 168, 1, 10)),
        ..Default::default()
    };
    let orch = Orchestrator::new(
        DecisionEngine::new(Arc::new(facts)),
        EngineSet::new(
            Arc::new(StubEngine {
                kind: EngineKind::Fast,
                records: Vec::new(),
                hang: hang_fast,
            }),
            Arc::new(StubEngine {
                kind: EngineKind::Verify,
                records: vec![OpenPortRecord::tcp("127.0.0.1", 22)],
                hang: false,
            }),
        ),
        Arc::new(EmbeddedStore::open_in_memory().unwrap()),
        Arc::new(NoopBannerGrabber),
        ProgressHub::new(),
    );
    let assets = tempfile::tempdir().unwrap();
    std::fs::write(assets.path().join("index.html"), "<html>portwatch</html>").unwrap();
    let app = router(AppState::new(orch.clone(), defaults, TOKEN), assets.path());
    TestApp {
        app,
        orch,
        _assets: assets,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn until_idle(orch: &Orchestrator) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while orch.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scan did not finish");
}

#[tokio::test]
async fn health_is_open_and_api_requires_token() {
    let t = test_app(ScanConfig::default(), false);

    let req = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
    let (status, body) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));

    let req = Request::builder().uri("/api/stats").body(Body::empty()).unwrap();
    assert_eq!(send(&t.app, req).await.0, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/stats")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&t.app, req).await.0, StatusCode::FORBIDDEN);

    let (status, body) = send(&t.app, get("/api/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_findings"], json!(0));
}

#[tokio::test]
async fn out_of_scope_custom_scan_is_forbidden() {
    let t = test_app(ScanConfig::default(), false);
    let (status, body) = send(
        &t.app,
        post_json("/api/scan/custom", json!({"targets": ["8.8.8.8"], "ports": "top"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], json!("target 8.8.8.8 is outside allowed networks"));
    assert!(!t.orch.is_running());
}

#[tokio::test]
async fn custom_scan_runs_and_results_are_served() {
    let t = test_app(ScanConfig::default(), false);
    let (status, body) = send(
        &t.app,
        post_json("/api/scan/custom", json!({"targets": ["localhost"], "ports": "22"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("started"));
    let run_id = body["run_id"].as_str().unwrap().to_string();

    until_idle(&t.orch).await;

    let (_, results) = send(&t.app, get("/api/results")).await;
    assert_eq!(results[0]["host"], json!("127.0.0.1"));
    assert_eq!(results[0]["port"], json!(22));

    let (_, scans) = send(&t.app, get("/api/scans")).await;
    assert_eq!(scans[0]["id"], json!(run_id));
    assert_eq!(scans[0]["status"], json!("completed"));
    assert_eq!(scans[0]["engine"], json!("verify"));
}

#[tokio::test]
async fn second_scan_is_conflict_until_cancelled() {
    let defaults = ScanConfig {
        targets: vec!["10.20.0.0/24".into()],
        ..ScanConfig::default()
    };
    let t = test_app(defaults, true);

    let (status, _) = send(&t.app, post_json("/api/scan", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&t.app, get("/api/scan/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], json!(true));

    let (status, _) = send(&t.app, post_json("/api/scan", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(&t.app, post_json("/api/scan/cancel", json!({}))).await;
    assert_eq!(body["cancelled"], json!(true));
    until_idle(&t.orch).await;

    let (_, body) = send(&t.app, get("/api/scan/status")).await;
    assert_eq!(body["running"], json!(false));
}

#[tokio::test]
async fn plan_and_netinfo_reflect_local_facts() {
    let t = test_app(ScanConfig::default(), false);

    let (status, plan) = send(&t.app, get("/api/scan/plan")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["targets"], json!(["192.168.1.0/24"]));
    assert_eq!(plan["engine"], json!("fast"));
    assert_eq!(plan["ports"], json!("1-65535"));

    let (_, info) = send(&t.app, get("/api/netinfo")).await;
    assert_eq!(info["interface"], json!("eth0"));
    assert_eq!(info["src_ip"], json!("192.168.1.10"));
}

#[tokio::test]
async fn static_ui_is_served_as_fallback() {
    let t = test_app(ScanConfig::default(), false);
    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let resp = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("portwatch"));
}
