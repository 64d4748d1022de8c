use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tower::ServiceExt;

use arca_core::models::User;
use arca_core::{CoreContext, CredentialKey, Database};
use arca_protocol::AuthLevel;

use crate::config::ServerConfig;
use crate::notify::Notifier;
use crate::state::ServerState;

pub const ADMIN: (&str, &str) = ("admin", "admin-pw");
pub const UPLOADER: (&str, &str) = ("uploader", "uploader-pw");
pub const READER: (&str, &str) = ("reader", "reader-pw");

/// A wired-up router and state backed by a temp directory, with one store
/// ("vault") and three users at admin/readappend/readonly levels.
pub fn setup_app(capacity: u64) -> (Router, ServerState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("create tempdir");
    let db = arca_core::shared(Database::open_in_memory().expect("open database"));
    let keys = CredentialKey::from_hex(&"42".repeat(32)).expect("test key");

    let config = ServerConfig {
        name: "site-test".into(),
        displayed_site_name: "Test Site".into(),
        displayed_site_description: "test instance".into(),
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

    let ctx = CoreContext::new(db, keys, "site-test");
    ctx.with_db(|c| {
        User::create(c, ADMIN.0, ADMIN.1, AuthLevel::Admin)?;
        User::create(c, UPLOADER.0, UPLOADER.1, AuthLevel::ReadAppend)?;
        User::create(c, READER.0, READER.1, AuthLevel::ReadOnly)?;
        arca_core::models::StoreRow::create(
            c,
            "vault",
            "local",
            true,
            &serde_json::json!({
                "staging_path": tmp.path().join("staging"),
                "store_path": tmp.path().join("store"),
                "capacity_bytes": capacity,
            }),
            &serde_json::json!({"name": "local"}),
            &serde_json::json!({"name": "local_async"}),
        )?;
        Ok(())
    })
    .expect("seed database");

    let state = ServerState::new(config, ctx, Notifier::disabled());
    let router = super::router(state.clone());
    (router, state, tmp)
}

fn basic(user: (&str, &str)) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", user.0, user.1)))
}

/// POST a JSON value as the given user.
pub async fn post_json(
    router: Router,
    user: (&str, &str),
    path: &str,
    body: serde_json::Value,
) -> axum::response::Response {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("Authorization", basic(user))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    router.oneshot(req).await.unwrap()
}

/// POST raw bytes (the upload endpoint) as the given user.
pub async fn post_bytes(
    router: Router,
    user: (&str, &str),
    path: &str,
    body: Vec<u8>,
) -> axum::response::Response {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("Authorization", basic(user))
        .header("Content-Length", body.len().to_string())
        .body(Body::from(body))
        .unwrap();
    router.oneshot(req).await.unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("collect body");
    serde_json::from_slice(&bytes).expect("parse body as json")
}

pub fn assert_status(response: &axum::response::Response, expected: StatusCode) {
    assert_eq!(
        response.status(),
        expected,
        "expected {expected}, got {}",
        response.status()
    );
}
