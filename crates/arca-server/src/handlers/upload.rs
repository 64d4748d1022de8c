//! Client ingest: stream the body into a staging slot, verify, commit.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use futures_util::TryStreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;

use arca_core::ingest::ingest_staged_file;
use arca_core::models::{log_error, DeletionPolicy, File, Instance, StoreRow};
use arca_protocol::errors::{ErrorCategory, ErrorSeverity};
use arca_protocol::upload::{UploadParams, UploadResponse};
use arca_protocol::AuthLevel;

use crate::auth::{require, AuthUser};
use crate::error::ApiError;
use crate::state::ServerState;

/// Pick the ingest store: the hinted one, or the first that can take the
/// bytes right now.
fn choose_store(state: &ServerState, hint: Option<&str>, size: u64) -> Result<StoreRow, ApiError> {
    let stores = state
        .ctx
        .with_db(|c| {
            if let Some(name) = hint {
                Ok(StoreRow::get_by_name(c, name)?.into_iter().collect())
            } else {
                StoreRow::all(c)
            }
        })
        .map_err(ApiError::from)?;

    if stores.is_empty() {
        return Err(ApiError::NotFound("no such store".into()));
    }

    let mut last_error = ApiError::StoreFull("no store can accept the upload".into());
    for store in stores {
        if !store.enabled || !store.ingestible {
            last_error = ApiError::StoreFull(format!("store '{}' does not ingest", store.name));
            continue;
        }
        let Ok(driver) = store.driver() else {
            continue;
        };
        if !driver.available() {
            last_error = ApiError::StoreUnavailable(format!("store '{}' unreachable", store.name));
            continue;
        }
        match driver.report() {
            Ok(report) if !report.full && size <= report.free => return Ok(store),
            Ok(report) => {
                last_error = ApiError::StoreFull(format!(
                    "store '{}' cannot take {size} bytes ({} free)",
                    store.name, report.free
                ));
            }
            Err(e) => last_error = ApiError::from(e),
        }
    }
    Err(last_error)
}

/// `POST /api/v2/upload?name=…&size=…&checksum=…` — READAPPEND.
pub async fn upload(
    State(state): State<ServerState>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<UploadParams>,
    body: Body,
) -> Result<Json<UploadResponse>, ApiError> {
    require(&user, AuthLevel::ReadAppend)?;

    File::validate_name(&params.name)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // Size ceiling is enforced before any byte is read.
    if params.size > state.config.maximal_upload_size_bytes {
        return Err(ApiError::PayloadTooLarge(format!(
            "upload of {} bytes exceeds the {}-byte ceiling",
            params.size, state.config.maximal_upload_size_bytes
        )));
    }

    // Duplicate names: identical checksum is a no-op, anything else is a
    // conflict. The original file is never touched.
    let existing = state
        .ctx
        .with_db(|c| {
            let Some(file) = File::get(c, &params.name)? else {
                return Ok(None);
            };
            let instance = Instance::for_file(c, &params.name)?
                .into_iter()
                .find(|i| i.available);
            Ok(Some((file, instance)))
        })
        .map_err(ApiError::from)?;
    if let Some((file, instance)) = existing {
        if file.checksum.matches(&params.checksum) {
            let (store_name, path) = match instance {
                Some(instance) => {
                    let store = state
                        .ctx
                        .with_db(|c| StoreRow::get(c, instance.store_id))
                        .map_err(ApiError::from)?;
                    (
                        store.map(|s| s.name).unwrap_or_default(),
                        instance.path,
                    )
                }
                None => (String::new(), String::new()),
            };
            return Ok(Json(UploadResponse {
                file_name: params.name,
                store_name,
                instance_path: path,
                already_present: true,
            }));
        }
        return Err(ApiError::Conflict(format!(
            "file '{}' already exists with a different checksum",
            params.name
        )));
    }

    let store = choose_store(&state, params.store.as_deref(), params.size)?;
    let slot = store
        .stage_ingest(&params.name, params.size)
        .map_err(ApiError::from)?;

    // Stream the body onto the staged path.
    let written = async {
        let stream = body.into_data_stream();
        let stream = TryStreamExt::map_err(stream, std::io::Error::other);
        let mut reader = StreamReader::new(stream);

        let file = tokio::fs::File::create(&slot.path).await?;
        let mut writer = BufWriter::new(file);
        let mut buf = vec![0u8; 256 * 1024];
        let mut written: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > params.size {
                break;
            }
            writer.write_all(&buf[..n]).await?;
        }
        writer.flush().await?;
        Ok::<u64, std::io::Error>(written)
    }
    .await;

    let cleanup = |reason: ApiError| {
        if let Ok(driver) = store.driver() {
            let _ = driver.unstage(&slot.dir);
        }
        reason
    };

    let written = written.map_err(|e| cleanup(ApiError::Internal(e.to_string())))?;
    if written != params.size {
        return Err(cleanup(ApiError::Unprocessable(format!(
            "declared size {} but received {} bytes",
            params.size, written
        ))));
    }

    // Hash verification and commit are blocking; hand them off.
    let ctx = state.ctx.clone();
    let uploader = user.username.clone();
    let site = state.config.name.clone();
    let staged_path = slot.path.clone();
    let store_for_commit = store.clone();
    let params_for_commit = params.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        ctx.transaction(|tx| {
            ingest_staged_file(
                tx,
                &store_for_commit,
                &staged_path,
                &params_for_commit.name,
                params_for_commit.size,
                &params_for_commit.checksum,
                &uploader,
                &site,
                DeletionPolicy::Disallowed,
            )
        })
    })
    .await
    .map_err(|e| ApiError::Internal(format!("commit task panicked: {e}")))?;

    match outcome {
        Ok(outcome) => Ok(Json(UploadResponse {
            file_name: params.name.clone(),
            store_name: store.name.clone(),
            instance_path: outcome.instance_path,
            already_present: outcome.already_present,
        })),
        Err(e) => {
            let api: ApiError = e.into();
            if matches!(api, ApiError::Unprocessable(_) | ApiError::Internal(_)) {
                let _ = state.ctx.with_db(|c| {
                    log_error(
                        c,
                        ErrorSeverity::Error,
                        ErrorCategory::Store,
                        &format!("upload of '{}' failed at commit", params.name),
                    )
                });
            }
            Err(cleanup(api))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::super::test_helpers::*;

    const TEST_MD5: &str = "975cf4ac8d495c42892ced97446ecff3";

    fn upload_uri(name: &str, size: usize, checksum: &str) -> String {
        format!("/api/v2/upload?name={name}&size={size}&checksum={checksum}")
    }

    #[tokio::test]
    async fn upload_then_locate_round_trip() {
        let (router, _state, _tmp) = setup_app(1 << 20);

        let resp = post_bytes(
            router.clone(),
            UPLOADER,
            &upload_uri("test.txt", 8, TEST_MD5),
            b"hello\nhe".to_vec(),
        )
        .await;
        assert_status(&resp, StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["instance_path"], "test.txt");
        assert_eq!(body["already_present"], false);

        let resp = post_json(
            router,
            READER,
            "/api/v2/files/locate",
            serde_json::json!({"name": "test.txt"}),
        )
        .await;
        assert_status(&resp, StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["locations"][0]["store"], "vault");
        assert_eq!(body["locations"][0]["path"], "test.txt");
    }

    #[tokio::test]
    async fn duplicate_name_conflicts_unless_same_checksum() {
        let (router, _state, _tmp) = setup_app(1 << 20);
        let uri = upload_uri("test.txt", 8, TEST_MD5);

        let resp = post_bytes(router.clone(), UPLOADER, &uri, b"hello\nhe".to_vec()).await;
        assert_status(&resp, StatusCode::OK);

        // Identical redelivery is a no-op success.
        let resp = post_bytes(router.clone(), UPLOADER, &uri, b"hello\nhe".to_vec()).await;
        assert_status(&resp, StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["already_present"], true);

        // Same name, different payload: conflict, original untouched.
        let bad = upload_uri("test.txt", 8, &"f".repeat(32));
        let resp = post_bytes(router.clone(), UPLOADER, &bad, b"imposter".to_vec()).await;
        assert_status(&resp, StatusCode::CONFLICT);

        let resp = post_json(
            router,
            UPLOADER,
            "/api/v2/validate/file",
            serde_json::json!({"name": "test.txt"}),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["results"][0]["match"], true);
        assert_eq!(body["results"][0]["original_checksum"], TEST_MD5);
        assert_eq!(body["results"][0]["current_checksum"], TEST_MD5);
    }

    #[tokio::test]
    async fn store_capacity_gates_uploads() {
        let (router, _state, _tmp) = setup_app(1024);

        let payload = vec![0xAAu8; 1000];
        let checksum = arca_store::checksum_of_bytes(&payload);
        let resp = post_bytes(
            router.clone(),
            UPLOADER,
            &upload_uri("big.dat", 1000, checksum.as_str()),
            payload,
        )
        .await;
        assert_status(&resp, StatusCode::OK);

        let small = vec![0xBBu8; 100];
        let checksum = arca_store::checksum_of_bytes(&small);
        let resp = post_bytes(
            router,
            UPLOADER,
            &upload_uri("small.dat", 100, checksum.as_str()),
            small,
        )
        .await;
        assert_status(&resp, StatusCode::INSUFFICIENT_STORAGE);
    }

    #[tokio::test]
    async fn zero_byte_files_are_accepted() {
        let (router, _state, _tmp) = setup_app(1024);
        // MD5 of the empty string.
        let resp = post_bytes(
            router,
            UPLOADER,
            &upload_uri("empty.dat", 0, "d41d8cd98f00b204e9800998ecf8427e"),
            Vec::new(),
        )
        .await;
        assert_status(&resp, StatusCode::OK);
    }

    #[tokio::test]
    async fn declared_size_must_match_body() {
        let (router, _state, _tmp) = setup_app(1 << 20);
        let resp = post_bytes(
            router,
            UPLOADER,
            &upload_uri("short.dat", 100, TEST_MD5),
            b"only a few bytes".to_vec(),
        )
        .await;
        assert_status(&resp, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn wrong_checksum_is_rejected_and_staging_cleaned() {
        let (router, state, _tmp) = setup_app(1 << 20);
        let resp = post_bytes(
            router,
            UPLOADER,
            &upload_uri("bad.dat", 4, &"0".repeat(32)),
            b"data".to_vec(),
        )
        .await;
        assert_status(&resp, StatusCode::UNPROCESSABLE_ENTITY);

        // No file row was created.
        let exists = state
            .ctx
            .with_db(|c| arca_core::models::File::exists(c, "bad.dat"))
            .unwrap();
        assert!(!exists);
    }

    #[tokio::test]
    async fn readonly_users_cannot_upload() {
        let (router, _state, _tmp) = setup_app(1 << 20);
        let resp = post_bytes(
            router,
            READER,
            &upload_uri("test.txt", 8, TEST_MD5),
            b"hello\nhe".to_vec(),
        )
        .await;
        assert_status(&resp, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_rejected() {
        let (router, _state, _tmp) = setup_app(1 << 20);
        let req = axum::http::Request::builder()
            .method("POST")
            .uri(upload_uri("x.dat", 1, TEST_MD5))
            .body(axum::body::Body::from("x"))
            .unwrap();
        let resp = tower::ServiceExt::oneshot(router, req).await.unwrap();
        assert_status(&resp, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn oversized_declared_uploads_are_rejected_pre_stream() {
        let (router, state, _tmp) = setup_app(1 << 20);
        let too_big = state.config.maximal_upload_size_bytes + 1;
        let uri = format!(
            "/api/v2/upload?name=huge.dat&size={too_big}&checksum={TEST_MD5}"
        );
        let resp = post_bytes(router, UPLOADER, &uri, b"irrelevant".to_vec()).await;
        assert_status(&resp, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
