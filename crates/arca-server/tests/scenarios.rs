//! End-to-end federation scenarios: two live instances on loopback,
//! pushing files through the real HTTP surface and background tasks.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use arca_core::models::{
    File, IncomingTransfer, Instance, Librarian, OutgoingTransfer, RemoteInstance, StoreRow, User,
};
use arca_core::scheduler::run_task_once;
use arca_core::tasks::{
    BackgroundTask, CheckConsumedQueue, CheckConsumedQueueConfig, ConsumeQueue, ConsumeQueueConfig,
    HypervisorConfig, OutgoingTransferHypervisor, ReceiveClone, ReceiveCloneConfig, SendClone,
    SendCloneConfig,
};
use arca_core::{CoreContext, CredentialKey, Database};
use arca_protocol::errors::ErrorCategory;
use arca_protocol::TransferStatus;
use arca_server::config::ServerConfig;
use arca_server::notify::Notifier;
use arca_server::state::ServerState;

struct TestInstance {
    state: ServerState,
    addr: SocketAddr,
    tmp: tempfile::TempDir,
}

/// Spin up a full instance: in-memory database, one local store, a live
/// axum server on an ephemeral loopback port.
async fn spawn_instance(name: &str, async_manager: &str, accepted: &[&str]) -> TestInstance {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db = arca_core::shared(Database::open_in_memory().expect("database"));
    let keys = CredentialKey::from_hex(&"77".repeat(32)).expect("key");
    let ctx = CoreContext::new(db, keys, name);

    ctx.with_db(|c| {
        StoreRow::create(
            c,
            "vault",
            "local",
            true,
            &serde_json::json!({
                "staging_path": tmp.path().join("staging"),
                "store_path": tmp.path().join("store"),
                "capacity_bytes": 1u64 << 24,
                "accepted_async_managers": accepted,
            }),
            &serde_json::json!({"name": "local"}),
            &serde_json::json!({"name": async_manager}),
        )?;
        // Account peers use when calling us, plus a local uploader.
        User::create(c, "peer-bot", "peer-pw", arca_protocol::AuthLevel::ReadAppend)?;
        User::create(c, "obs", "obs-pw", arca_protocol::AuthLevel::ReadAppend)?;
        Ok(())
    })
    .expect("seed instance");

    let config = ServerConfig {
        name: name.into(),
        displayed_site_name: name.into(),
        displayed_site_description: format!("{name} (test)"),
        host: "127.0.0.1".into(),
        port: 0,
        database_driver: "sqlite".into(),
        database_name: tmp.path().join("unused.db"),
        database_user: None,
        database_password: None,
        database_host: None,
        database_port: None,
        encryption_key_file: tmp.path().join("unused.key"),
        max_search_results: 64,
        maximal_upload_size_bytes: 1 << 30,
        add_stores: Vec::new(),
        log_format: "pretty".into(),
        slack_webhook_enable: false,
        slack_webhook_url_file: None,
        slack_webhook_post_error_severity: Vec::new(),
        slack_webhook_post_error_category: Vec::new(),
        background_config: None,
    };

    let state = ServerState::new(config, ctx, Notifier::disabled());
    let router = arca_server::handlers::router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    TestInstance { state, addr, tmp }
}

/// Register `remote` as a known peer of `local`.
fn register_peer(local: &TestInstance, remote: &TestInstance) {
    local
        .state
        .ctx
        .with_db(|c| {
            Librarian::create(
                c,
                &local.state.ctx.keys,
                &remote.state.config.name,
                "http://127.0.0.1",
                remote.addr.port(),
                "peer-bot:peer-pw",
            )?;
            Ok(())
        })
        .expect("register peer");
}

/// Ingest a file locally through the store driver and models, as an
/// earlier upload would have left it.
fn seed_file(instance: &TestInstance, name: &str, payload: &[u8]) {
    let checksum = arca_store::checksum_of_bytes(payload);
    instance
        .state
        .ctx
        .with_db(|c| {
            let store = StoreRow::get_by_name(c, "vault")?.unwrap();
            let slot = store.stage_ingest(name, payload.len() as u64)?;
            std::fs::write(&slot.path, payload)?;
            let path = store.driver()?.commit(&slot.path, name, &checksum)?;
            File::create(c, name, payload.len() as u64, &checksum, "obs", "test")?;
            Instance::create(
                c,
                name,
                store.id,
                &path,
                arca_core::models::DeletionPolicy::Disallowed,
            )?;
            Ok(())
        })
        .expect("seed file");
}

async fn run_task(ctx: &CoreContext, task: impl BackgroundTask + 'static) {
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || run_task_once(&ctx, &task).expect("task run"))
        .await
        .expect("task join");
}

fn send_clone_task(destination: &str) -> SendClone {
    SendClone::from_config(SendCloneConfig {
        task_name: format!("send to {destination}"),
        every_seconds: 60,
        soft_timeout_seconds: 60,
        destination_librarian: destination.to_string(),
        age_in_days: 0,
        store_preference: Some("vault".into()),
        send_batch_size: 8,
    })
}

fn consume_task() -> ConsumeQueue {
    ConsumeQueue::from_config(ConsumeQueueConfig {
        task_name: "consume queue".into(),
        every_seconds: 60,
        soft_timeout_seconds: 60,
        max_live_handles: 100,
    })
}

fn check_task() -> CheckConsumedQueue {
    CheckConsumedQueue::from_config(CheckConsumedQueueConfig {
        task_name: "check consumed queue".into(),
        every_seconds: 60,
        soft_timeout_seconds: 60,
    })
}

fn receive_task() -> ReceiveClone {
    ReceiveClone::from_config(ReceiveCloneConfig {
        task_name: "receive clones".into(),
        every_seconds: 60,
        soft_timeout_seconds: 60,
        deletion_policy: Some("DISALLOWED".into()),
        files_per_run: 64,
    })
}

fn outgoing_hypervisor() -> OutgoingTransferHypervisor {
    OutgoingTransferHypervisor::from_config(HypervisorConfig {
        task_name: "outgoing hypervisor".into(),
        every_seconds: 3600,
        soft_timeout_seconds: 60,
        age_in_days: 0,
        handle_max_age_in_days: None,
    })
}

fn outgoing_status(instance: &TestInstance, id: i64) -> TransferStatus {
    instance
        .state
        .ctx
        .with_db(|c| Ok(OutgoingTransfer::get(c, id)?.unwrap().status))
        .unwrap()
}

fn sole_outgoing_id(instance: &TestInstance) -> i64 {
    instance
        .state
        .ctx
        .with_db(|c| {
            c.query_row("SELECT id FROM outgoing_transfers", [], |r| r.get(0))
                .map_err(arca_core::CoreError::from)
        })
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_clone_happy_path() {
    let a = spawn_instance("site-a", "local_async", &["local_async"]).await;
    let b = spawn_instance("site-b", "local_async", &["local_async"]).await;
    register_peer(&a, &b);
    register_peer(&b, &a);

    let payload = b"uv data: not really".to_vec();
    seed_file(&a, "zen.2457644.12345.uv", &payload);

    // One scheduler cycle per side.
    run_task(&a.state.ctx, send_clone_task("site-b")).await;
    run_task(&a.state.ctx, consume_task()).await;
    run_task(&a.state.ctx, check_task()).await;
    run_task(&b.state.ctx, receive_task()).await;

    // Source side: transfer completed and the remote claim recorded.
    let id = sole_outgoing_id(&a);
    assert_eq!(outgoing_status(&a, id), TransferStatus::Completed);
    a.state
        .ctx
        .with_db(|c| {
            assert!(RemoteInstance::exists(
                c,
                "zen.2457644.12345.uv",
                Librarian::get_by_name(c, "site-b")?.unwrap().id
            )?);
            Ok(())
        })
        .unwrap();

    // Destination side: file, instance, bytes.
    b.state
        .ctx
        .with_db(|c| {
            let file = File::get(c, "zen.2457644.12345.uv")?.expect("file on b");
            assert!(file.checksum.matches(&arca_store::checksum_of_bytes(&payload)));
            let instances = Instance::for_file(c, "zen.2457644.12345.uv")?;
            assert_eq!(instances.len(), 1);
            let store = StoreRow::get(c, instances[0].store_id)?.unwrap();
            let on_disk = std::fs::read(store.driver()?.resolve(&instances[0].path)?)?;
            assert_eq!(on_disk, payload);
            Ok(())
        })
        .unwrap();
    drop(a.tmp);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_callback_is_repaired_by_the_hypervisor() {
    let a = spawn_instance("site-a", "local_async", &["local_async"]).await;
    let b = spawn_instance("site-b", "local_async", &["local_async"]).await;
    register_peer(&a, &b);
    // b deliberately does NOT know site-a: its completion callback has
    // nowhere to go and is dropped.

    seed_file(&a, "zen.2457644.12345.uv", b"observed bytes");

    run_task(&a.state.ctx, send_clone_task("site-b")).await;
    run_task(&a.state.ctx, consume_task()).await;
    run_task(&a.state.ctx, check_task()).await;
    run_task(&b.state.ctx, receive_task()).await;

    // The destination ingested, but the source is stuck in STAGED.
    let id = sole_outgoing_id(&a);
    assert_eq!(outgoing_status(&a, id), TransferStatus::Staged);
    b.state
        .ctx
        .with_db(|c| {
            assert!(File::exists(c, "zen.2457644.12345.uv")?);
            Ok(())
        })
        .unwrap();

    // The hypervisor queries ground truth and repairs.
    run_task(&a.state.ctx, outgoing_hypervisor()).await;
    assert_eq!(outgoing_status(&a, id), TransferStatus::Completed);
    a.state
        .ctx
        .with_db(|c| {
            let librarian = Librarian::get_by_name(c, "site-b")?.unwrap();
            assert!(RemoteInstance::exists(c, "zen.2457644.12345.uv", librarian.id)?);
            Ok(())
        })
        .unwrap();

    // No duplicate ingest happened on the destination.
    b.state
        .ctx
        .with_db(|c| {
            assert_eq!(Instance::for_file(c, "zen.2457644.12345.uv")?.len(), 1);
            Ok(())
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_failure_fails_the_batch() {
    // The source's store is configured with the fault-injection
    // transport; the destination accepts it.
    let a = spawn_instance("site-a", "failing", &["local_async"]).await;
    let b = spawn_instance("site-b", "local_async", &["failing", "local_async"]).await;
    register_peer(&a, &b);
    register_peer(&b, &a);

    seed_file(&a, "zen.2457645.00001.uv", b"doomed bytes");

    run_task(&a.state.ctx, send_clone_task("site-b")).await;
    run_task(&a.state.ctx, consume_task()).await;
    run_task(&a.state.ctx, check_task()).await;

    let id = sole_outgoing_id(&a);
    assert_eq!(outgoing_status(&a, id), TransferStatus::Failed);

    // One transport-category warning row per failed file.
    a.state
        .ctx
        .with_db(|c| {
            let rows = arca_core::models::ErrorLogRow::with_category(c, ErrorCategory::Transport)?;
            let per_file: Vec<_> = rows
                .iter()
                .filter(|r| r.message.contains("zen.2457645.00001.uv"))
                .collect();
            assert_eq!(per_file.len(), 1);
            assert_eq!(
                per_file[0].severity,
                arca_protocol::errors::ErrorSeverity::Warning
            );
            Ok(())
        })
        .unwrap();

    // The destination made no ingest progress.
    run_task(&b.state.ctx, receive_task()).await;
    b.state
        .ctx
        .with_db(|c| {
            assert!(!File::exists(c, "zen.2457645.00001.uv")?);
            let transfer = IncomingTransfer::find_by_source_transfer_id(c, id)?.unwrap();
            assert_eq!(transfer.status, TransferStatus::Failed);
            Ok(())
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_manifest_round_trips_over_sneakernet() {
    let a = spawn_instance("site-a", "local_async", &["local_async"]).await;
    let b = spawn_instance("site-b", "local_async", &["local_async"]).await;
    register_peer(&a, &b);
    register_peer(&b, &a);

    seed_file(&a, "cal.0001.dat", b"calibration one");
    seed_file(&a, "cal.0002.dat", b"calibration two");

    // Generate the manifest on the source, with outgoing transfers so the
    // receiving side's callbacks complete them. Generation needs ADMIN.
    a.state
        .ctx
        .with_db(|c| {
            User::create(c, "root", "root-pw", arca_protocol::AuthLevel::Admin)?;
            Ok(())
        })
        .unwrap();
    let admin = ureq_client(&a, "root", "root-pw");

    let manifest: serde_json::Value = tokio::task::spawn_blocking(move || {
        admin
            .post("admin/stores/manifest")
            .send_json(serde_json::json!({
                "store_name": "vault",
                "create_outgoing_transfers": true,
                "destination_librarian": "site-b",
            }))
            .expect("manifest request")
            .into_json()
            .expect("manifest json")
    })
    .await
    .unwrap();
    assert_eq!(manifest["items"].as_array().unwrap().len(), 2);

    // "Mount" the shipped device on the destination: a store whose root
    // is the source store's directory.
    b.state
        .ctx
        .with_db(|c| {
            StoreRow::create(
                c,
                "shipped",
                "local",
                false,
                &serde_json::json!({
                    "staging_path": b.tmp.path().join("shipped-staging"),
                    "store_path": a.tmp.path().join("store"),
                    "capacity_bytes": 1u64 << 24,
                }),
                &serde_json::json!({"name": "local"}),
                &serde_json::json!({"name": "local_async"}),
            )?;
            Ok(())
        })
        .unwrap();

    let ingest = ureq_client(&b, "peer-bot", "peer-pw");
    let response: serde_json::Value = tokio::task::spawn_blocking(move || {
        ingest
            .post("sneakernet/ingest")
            .send_json(serde_json::json!({
                "manifest": manifest,
                "store_name": "shipped",
            }))
            .expect("ingest request")
            .into_json()
            .expect("ingest json")
    })
    .await
    .unwrap();
    assert_eq!(response["ingested"].as_array().unwrap().len(), 2);
    assert!(response["rejected"].as_array().unwrap().is_empty());

    // Every manifest item is now a File + Instance on the destination.
    b.state
        .ctx
        .with_db(|c| {
            for name in ["cal.0001.dat", "cal.0002.dat"] {
                assert!(File::exists(c, name)?, "{name} missing");
                assert_eq!(Instance::for_file(c, name)?.len(), 1);
            }
            Ok(())
        })
        .unwrap();

    // The callbacks completed the source-side transfers.
    a.state
        .ctx
        .with_db(|c| {
            let count: i64 = c.query_row(
                "SELECT COUNT(*) FROM outgoing_transfers WHERE status = 'COMPLETED'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(count, 2);
            Ok(())
        })
        .unwrap();
}

/// Minimal blocking HTTP helper for the scenario tests.
struct TestHttp {
    base: String,
    authorization: String,
}

impl TestHttp {
    fn post(&self, endpoint: &str) -> ureq::Request {
        ureq::post(&format!("{}/api/v2/{endpoint}", self.base))
            .set("Authorization", &self.authorization)
    }
}

fn ureq_client(instance: &TestInstance, user: &str, password: &str) -> TestHttp {
    use base64::Engine;
    let credentials =
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    TestHttp {
        base: format!("http://127.0.0.1:{}", instance.addr.port()),
        authorization: format!("Basic {credentials}"),
    }
}
