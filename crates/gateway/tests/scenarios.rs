//! End-to-end gateway scenarios against a file-backed audit log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use warden_config::{AppConfig, CommandEntryConfig, ExecutorConfig, RiskLevel, WhitelistConfig};
use warden_core::{CallerContext, ErrorKind};
use warden_executor::Executor;
use warden_gateway::{Gateway, InitError};
use warden_security::audit::read_records;
use warden_security::{
    AuditError, AuditLogger, AuditOp, AuditOutcome, AuditRecord, SecretsVault, Validator,
    WhitelistRegistry, verify_chain,
};

struct Fixture {
    gateway: Gateway,
    audit_path: PathBuf,
    data_dir: PathBuf,
    _root: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_executor(ExecutorConfig::default())
    }

    fn with_executor(executor: ExecutorConfig) -> Self {
        let root = tempfile::tempdir().unwrap();
        let data_dir = root.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();

        let whitelist = WhitelistConfig {
            path_roots: vec![data_dir.display().to_string()],
            url_schemes: vec!["http".into(), "https".into()],
            commands: vec![
                CommandEntryConfig::exact("ls", RiskLevel::Low),
                CommandEntryConfig::exact("echo", RiskLevel::Low),
                CommandEntryConfig::exact("sleep", RiskLevel::Low),
                CommandEntryConfig {
                    pipeline_safe: true,
                    ..CommandEntryConfig::exact("grep", RiskLevel::Low)
                },
            ],
        };
        let registry = Arc::new(WhitelistRegistry::from_config(&whitelist).unwrap());
        let audit_path = root.path().join("audit.jsonl");
        let audit = Arc::new(AuditLogger::open(&audit_path).unwrap());
        let vault = SecretsVault::open(
            &root.path().join("vault.json"),
            &root.path().join("vault.index.json"),
            "correct horse battery staple",
            1_000,
            audit.clone(),
        )
        .unwrap();

        let gateway = Gateway::new(
            Validator::new(registry, false),
            Executor::new(executor).unwrap(),
            audit,
            Some(Arc::new(vault)),
        );
        Self {
            gateway,
            audit_path,
            data_dir,
            _root: root,
        }
    }

    fn records(&self) -> Vec<AuditRecord> {
        read_records(&self.audit_path).unwrap()
    }

    fn raw_log(&self) -> String {
        std::fs::read_to_string(&self.audit_path).unwrap()
    }
}

fn alice() -> CallerContext {
    CallerContext::new("alice")
}

fn outcomes(records: &[AuditRecord]) -> Vec<AuditOutcome> {
    records.iter().map(|r| r.outcome).collect()
}

async fn serve_ok() -> String {
    use axum::{Router, routing::get};
    let app = Router::new().route("/data", get(|| async { r#"{"items":[1,2,3]}"# }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/data")
}

#[tokio::test]
async fn chained_command_is_rejected_without_running() {
    let fx = Fixture::new();
    let err = fx
        .gateway
        .run_command(&alice(), "ls; rm -rf /", 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::DangerousCharacter);

    let records = fx.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].op, AuditOp::RunCommand);
    assert_eq!(records[0].outcome, AuditOutcome::Rejected);
    assert!(records[0].detail.contains("DangerousCharacter"));
}

#[tokio::test]
async fn traversal_out_of_base_is_rejected() {
    let fx = Fixture::new();
    let err = fx
        .gateway
        .read_file(&alice(), "../../../../etc/shadow", &fx.data_dir)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PathTraversal);
    assert_eq!(outcomes(&fx.records()), vec![AuditOutcome::Rejected]);
}

#[tokio::test]
async fn base_dir_outside_roots_is_rejected() {
    let fx = Fixture::new();
    let err = fx
        .gateway
        .read_file(&alice(), "passwd", Path::new("/etc"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PathTraversal);
}

#[tokio::test]
async fn javascript_url_is_rejected() {
    let fx = Fixture::new();
    let err = fx
        .gateway
        .http_get(&alice(), "javascript:alert(1)")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidScheme);
    assert_eq!(outcomes(&fx.records()), vec![AuditOutcome::Rejected]);
}

#[tokio::test]
async fn allowed_fetch_records_intent_and_outcome() {
    let fx = Fixture::new();
    let url = serve_ok().await;
    let response = fx.gateway.http_get(&alice(), &url).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, br#"{"items":[1,2,3]}"#);

    let records = fx.records();
    assert_eq!(
        outcomes(&records),
        vec![AuditOutcome::Allowed, AuditOutcome::Executed]
    );
    assert_eq!(records[0].req, records[1].req);
    assert!(records[0].req.is_some());
    assert!(records[1].detail.contains("status 200"));
}

#[tokio::test]
async fn secret_values_never_reach_the_audit_log() {
    let fx = Fixture::new();
    fx.gateway
        .secret_add(&alice(), "db_password", "p@ss")
        .unwrap();
    let value = fx.gateway.secret_get(&alice(), "db_password").unwrap();
    assert_eq!(value, "p@ss");

    let records = fx.records();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.target == "db_password"));
    assert!(!fx.raw_log().contains("p@ss"));
}

#[tokio::test]
async fn hanging_command_times_out_and_is_killed() {
    let fx = Fixture::with_executor(ExecutorConfig {
        max_timeout_secs: 5,
        ..ExecutorConfig::default()
    });
    let started = Instant::now();
    let err = fx
        .gateway
        .run_command(&alice(), "sleep 30", 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_secs(10));

    let records = fx.records();
    assert_eq!(
        outcomes(&records),
        vec![AuditOutcome::Allowed, AuditOutcome::Failed]
    );
    assert!(records[1].detail.contains("Timeout"));
}

#[tokio::test]
async fn records_follow_call_order_and_chain_verifies() {
    let fx = Fixture::new();
    let ctx = alice();

    fx.gateway.run_command(&ctx, "echo one", 0).await.unwrap();
    let _ = fx.gateway.run_command(&ctx, "cat /etc/passwd", 0).await;
    fx.gateway
        .write_file(&ctx, "out.txt", &fx.data_dir, b"two")
        .await
        .unwrap();
    let _ = fx
        .gateway
        .read_file(&ctx, "missing.txt", &fx.data_dir)
        .await;

    let records = fx.records();
    let ops: Vec<_> = records.iter().map(|r| (r.op, r.outcome)).collect();
    assert_eq!(
        ops,
        vec![
            (AuditOp::RunCommand, AuditOutcome::Allowed),
            (AuditOp::RunCommand, AuditOutcome::Executed),
            (AuditOp::RunCommand, AuditOutcome::Rejected),
            (AuditOp::WriteFile, AuditOutcome::Allowed),
            (AuditOp::WriteFile, AuditOutcome::Executed),
            (AuditOp::ReadFile, AuditOutcome::Allowed),
            (AuditOp::ReadFile, AuditOutcome::Failed),
        ]
    );
    assert!(records.iter().all(|r| r.actor == "alice"));

    let report = verify_chain(&fx.audit_path).unwrap();
    assert_eq!(report.records, records.len());
    assert!(report.is_intact());
}

#[tokio::test]
async fn non_zero_exit_is_still_executed() {
    let fx = Fixture::new();
    let output = fx
        .gateway
        .run_command(&alice(), "ls /definitely/not/here", 0)
        .await
        .unwrap();
    assert!(!output.success());
    assert_eq!(
        outcomes(&fx.records()),
        vec![AuditOutcome::Allowed, AuditOutcome::Executed]
    );
}

#[tokio::test]
async fn bad_secret_key_is_rejected_before_the_vault() {
    let fx = Fixture::new();
    let err = fx
        .gateway
        .secret_add(&alice(), "../etc/passwd", "x")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MalformedInput);
    assert_eq!(outcomes(&fx.records()), vec![AuditOutcome::Rejected]);
    assert!(fx.gateway.secret_list(&alice()).unwrap().is_empty());
}

#[tokio::test]
async fn validation_is_repeatable() {
    let fx = Fixture::new();
    for _ in 0..3 {
        let err = fx
            .gateway
            .http_get(&alice(), "ftp://example.com/file")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidScheme);
    }
    assert_eq!(fx.records().len(), 3);
}

#[test]
fn second_gateway_on_the_same_files_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let passphrase_file = root.path().join("passphrase");
    std::fs::write(&passphrase_file, "correct horse battery staple\n").unwrap();

    let mut config = AppConfig::default();
    config.audit.path = root.path().join("audit.jsonl").display().to_string();
    config.vault.path = root.path().join("vault.json").display().to_string();
    config.vault.index_path = root.path().join("vault.index.json").display().to_string();
    config.vault.passphrase_file = Some(passphrase_file.display().to_string());
    config.vault.kdf_iterations = 1_000;

    let server = Gateway::from_config(&config).unwrap();
    server.secret_add(&alice(), "FROM_API", "v1").unwrap();

    let second = Gateway::from_config(&config);
    assert!(matches!(second, Err(InitError::Audit(AuditError::Locked(_)))));

    server.secret_add(&alice(), "ALSO_FROM_API", "v2").unwrap();
    let keys: Vec<_> = server
        .secret_list(&alice())
        .unwrap()
        .into_iter()
        .map(|m| m.key)
        .collect();
    assert_eq!(keys, vec!["ALSO_FROM_API", "FROM_API"]);
    drop(server);

    assert!(verify_chain(&root.path().join("audit.jsonl")).unwrap().is_intact());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_share_one_intact_chain() {
    const CALLS: usize = 24;

    let fx = Arc::new(Fixture::new());
    std::fs::write(fx.data_dir.join("notes.txt"), "hello").unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..CALLS {
        let fx = fx.clone();
        tasks.spawn(async move {
            let ctx = CallerContext::new(format!("agent-{i}"));
            if i % 2 == 0 {
                fx.gateway.run_command(&ctx, "echo hi", 0).await.map(|_| ())
            } else {
                fx.gateway
                    .read_file(&ctx, "notes.txt", &fx.data_dir)
                    .await
                    .map(|_| ())
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let records = fx.records();
    assert_eq!(records.len(), 2 * CALLS);
    assert!(verify_chain(&fx.audit_path).unwrap().is_intact());

    let mut by_request: HashMap<String, Vec<AuditOutcome>> = HashMap::new();
    for record in &records {
        by_request
            .entry(record.req.clone().unwrap())
            .or_default()
            .push(record.outcome);
    }
    assert_eq!(by_request.len(), CALLS);
    for outcomes in by_request.values() {
        assert_eq!(outcomes, &vec![AuditOutcome::Allowed, AuditOutcome::Executed]);
    }
}

#[tokio::test]
async fn escaped_quote_pipeline_never_runs() {
    let fx = Fixture::new();
    let marker = fx.data_dir.join("created");
    let line = format!(r"grep \' | touch {} | echo ' '", marker.display());
    let err = fx.gateway.run_command(&alice(), &line, 0).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DisallowedCommand);
    assert!(!marker.exists());
    assert_eq!(outcomes(&fx.records()), vec![AuditOutcome::Rejected]);
}
