use chrono::Utc;
use httpmock::prelude::*;
use hypernode_node::coordinator::{
    CoordinatorClient, CoordinatorError, FailureReport, Heartbeat, HttpCoordinator, Registration,
};
use hypernode_node::ledger::{
    HttpLedger, LedgerClient, ReputationEvent, ReputationRecord,
};
use hypernode_types::{JobId, NodeCapability};
use serde_json::json;

fn capability() -> NodeCapability {
    let mut cap = NodeCapability::cpu_only("EPYC".into(), 32, 131_072, "Ubuntu 22.04".into());
    cap.gpu_model = "NVIDIA A100".into();
    cap.gpu_count = 2;
    cap.vram_mb = 81_920;
    cap
}

#[tokio::test]
async fn register_sends_bearer_token_and_reads_node_id() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/nodes/register")
                .header("authorization", "Bearer tok-123")
                .json_body_partial(r#"{ "walletAddress": "wallet-9", "gpuModel": "NVIDIA A100", "vram": 80 }"#);
            then.status(200).json_body(json!({ "id": "node-77" }));
        })
        .await;

    let client = HttpCoordinator::new(&server.base_url(), "tok-123").unwrap();
    let ack = client
        .register(&Registration::new("wallet-9", &capability()))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(ack.node_id.as_deref(), Some("node-77"));
}

#[tokio::test]
async fn rejected_token_is_not_transient() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/nodes/heartbeat");
            then.status(401);
        })
        .await;

    let client = HttpCoordinator::new(&server.base_url(), "bad").unwrap();
    let err = client
        .heartbeat(&Heartbeat {
            wallet_address: "w".into(),
            status: "online".into(),
            in_flight: 0,
            capacity: 1,
            timestamp: Utc::now(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Unauthorized));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn poll_parses_an_offer() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/jobs/available")
                .query_param("wallet", "wallet-9");
            then.status(200).json_body(json!({
                "job": {
                    "job_id": "job-42",
                    "job_type": "inference",
                    "requirements": {
                        "profile": "single_gpu",
                        "vram_mb": 16000,
                        "ram_mb": 8192,
                        "cpu_cores": 4.0
                    },
                    "payload": { "image": "ghcr.io/acme/llm:1", "command": ["serve"] },
                    "deadline": "2030-01-01T00:00:00Z"
                }
            }));
        })
        .await;

    let client = HttpCoordinator::new(&server.base_url(), "tok").unwrap();
    let offer = client.poll_offer("wallet-9").await.unwrap().unwrap();
    mock.assert_async().await;

    assert_eq!(offer.job_id, JobId::new("job-42"));
    assert_eq!(offer.requirements.vram_mb, 16_000);
    assert_eq!(offer.payload.command, vec!["serve".to_string()]);
}

#[tokio::test]
async fn poll_without_work_is_none() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/jobs/available");
            then.status(200).json_body(json!({ "job": null }));
        })
        .await;

    let client = HttpCoordinator::new(&server.base_url(), "tok").unwrap();
    assert!(client.poll_offer("wallet-9").await.unwrap().is_none());
}

#[tokio::test]
async fn failure_report_goes_to_job_path() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/jobs/job-5/failure")
                .json_body_partial(r#"{ "kind": "timed_out", "nodeId": "node-1" }"#);
            then.status(204);
        })
        .await;

    let client = HttpCoordinator::new(&server.base_url(), "tok").unwrap();
    client
        .report_failure(
            &JobId::new("job-5"),
            &FailureReport {
                node_id: "node-1".into(),
                error: "deadline elapsed".into(),
                kind: "timed_out".into(),
                logs: vec![],
            },
        )
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/nodes/register");
            then.status(503).body("maintenance");
        })
        .await;

    let client = HttpCoordinator::new(&server.base_url(), "tok").unwrap();
    let err = client
        .register(&Registration::new("w", &capability()))
        .await
        .unwrap_err();
    match &err {
        CoordinatorError::Status { status, body } => {
            assert_eq!(*status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(err.is_transient());
}

#[tokio::test]
async fn ledger_profile_is_fetched() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/reputation/profiles/wallet-9");
            then.status(200).json_body(json!({
                "computed_score": 712.5,
                "metrics": { "jobs_succeeded": 90, "jobs_failed": 3 }
            }));
        })
        .await;

    let ledger = HttpLedger::new(&server.base_url()).unwrap();
    let profile = ledger.fetch_reputation("wallet-9").await.unwrap().unwrap();
    mock.assert_async().await;

    assert_eq!(profile.score, 712.5);
    assert_eq!(profile.metrics.jobs_succeeded, 90);
    assert_eq!(profile.metrics.jobs_failed, 3);
}

#[tokio::test]
async fn unknown_ledger_profile_is_none() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/reputation/profiles/fresh");
            then.status(404);
        })
        .await;

    let ledger = HttpLedger::new(&server.base_url()).unwrap();
    assert!(ledger.fetch_reputation("fresh").await.unwrap().is_none());
}

#[tokio::test]
async fn ledger_record_is_posted() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/reputation/records")
                .json_body_partial(r#"{ "subject": "wallet-9", "event": "job_succeeded", "job_id": "job-1" }"#);
            then.status(201);
        })
        .await;

    let ledger = HttpLedger::new(&server.base_url()).unwrap();
    ledger
        .submit_record(&ReputationRecord {
            subject: "wallet-9".into(),
            event: ReputationEvent::JobSucceeded,
            job_id: Some(JobId::new("job-1")),
            local_score: 503.0,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
    mock.assert_async().await;
}
