//! Integration tests for the built-in HTTP strategy against a mock server.

mod support;

use std::sync::Arc;
use std::time::Duration;

use acquirer_core::engine::MANIFEST_FILE;
use acquirer_core::{
    AttemptContext, AttemptOutcome, DownloadTarget, FailureCategory, HttpStrategy, ManifestSink,
    Orchestrator, Strategy, StrategyRegistry, TargetId, TargetPhase, classify,
};
use support::{ARTIFACT_BYTES, fixed_probe, setup_ledger, test_config};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mp3_body() -> Vec<u8> {
    let mut body = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
    body.resize(ARTIFACT_BYTES, 0x55);
    body
}

fn episode(server: &MockServer, route: &str) -> DownloadTarget {
    DownloadTarget::new(
        TargetId::new("ep-1"),
        "Episode 1",
        format!("{}{route}", server.uri()),
    )
}

async fn attempt(target: &DownloadTarget, dir: &TempDir) -> AttemptOutcome {
    let strategy = HttpStrategy::new().unwrap();
    let (ctx, _progress) = AttemptContext::new(dir.path().join("ep-1.part"), "test");
    strategy.attempt(target, &ctx).await
}

fn failure_of(outcome: AttemptOutcome) -> acquirer_core::StrategyFailure {
    match outcome {
        AttemptOutcome::Failure(failure) => failure,
        AttemptOutcome::Success { .. } => panic!("expected a failure"),
    }
}

// ==================== Attempt Outcome Tests ====================

#[tokio::test]
async fn test_http_strategy_streams_audio_to_destination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ep-1.mp3"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/mpeg")
                .set_body_bytes(mp3_body()),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let outcome = attempt(&episode(&server, "/ep-1.mp3"), &dir).await;

    assert_eq!(
        outcome,
        AttemptOutcome::Success {
            bytes_transferred: ARTIFACT_BYTES as u64
        }
    );
    let written = std::fs::read(dir.path().join("ep-1.part")).unwrap();
    assert!(written.starts_with(b"ID3"));
}

#[tokio::test]
async fn test_http_strategy_forbidden_is_access_denied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let failure = failure_of(attempt(&episode(&server, "/ep-1.mp3"), &dir).await);

    assert_eq!(failure.metadata.http_status, Some(403));
    assert_eq!(classify(&failure), FailureCategory::AccessDenied);
}

#[tokio::test]
async fn test_http_strategy_missing_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let failure = failure_of(attempt(&episode(&server, "/gone.mp3"), &dir).await);

    assert_eq!(classify(&failure), FailureCategory::NotFound);
    assert!(!dir.path().join("ep-1.part").exists());
}

#[tokio::test]
async fn test_http_strategy_html_page_is_access_denied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string("<html><body>Please log in</body></html>"),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let failure = failure_of(attempt(&episode(&server, "/ep-1.mp3"), &dir).await);

    assert_eq!(
        failure.metadata.content_type.as_deref(),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(classify(&failure), FailureCategory::AccessDenied);
}

#[tokio::test]
async fn test_http_strategy_captures_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(504).insert_header("retry-after", "3"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let failure = failure_of(attempt(&episode(&server, "/ep-1.mp3"), &dir).await);

    assert_eq!(failure.metadata.retry_after, Some(Duration::from_secs(3)));
    assert_eq!(classify(&failure), FailureCategory::Timeout);
}

// ==================== Orchestrated Download Tests ====================

#[tokio::test]
async fn test_orchestrated_http_download_writes_manifest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed/ep-1.mp3"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/mpeg")
                .set_body_bytes(mp3_body()),
        )
        .mount(&server)
        .await;

    let (ledger, dir) = setup_ledger().await;
    let config = test_config(dir.path());
    let output_dir = config.output_dir.clone();

    let mut registry = StrategyRegistry::new();
    registry.register(Arc::new(HttpStrategy::new().unwrap())).unwrap();
    let orchestrator = Orchestrator::new(config, ledger.clone(), registry)
        .unwrap()
        .with_probe(fixed_probe())
        .with_sink(Arc::new(ManifestSink::new(&output_dir)));

    let report = orchestrator
        .run(vec![episode(&server, "/feed/ep-1.mp3")])
        .await
        .unwrap();

    assert_eq!(report.count(&TargetPhase::Done), 1);
    assert_eq!(report.bytes, ARTIFACT_BYTES as u64);
    let artifact = report.targets[0].artifact_path.clone().unwrap();
    assert!(artifact.exists());

    let manifest = std::fs::read_to_string(output_dir.join(MANIFEST_FILE)).unwrap();
    let line: serde_json::Value = serde_json::from_str(manifest.lines().next().unwrap()).unwrap();
    assert_eq!(line["target_id"], "ep-1");

    let attempts = ledger
        .attempts_for(&TargetId::new("ep-1"))
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].strategy, "direct");
    assert!(attempts[0].sha256.is_some());
}
