use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use bytes::Bytes;
use clap::Parser;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::util::ServiceExt;

use crate::{
    blob::{BlobStore, DiskBlobStore, MAX_BLOB_BYTES, UrlSigner, to_data_url},
    config::{Cli, Config},
    http::{AppState, build_router},
    pledge::{PledgeEngine, VenmoLinkBuilder},
    reconcile::{Reconciler, SyncMode},
    store::{RecordStore, local::LocalStore, remote::RemoteStore, sqlite::SqliteStore},
};

fn test_config(tmp: &TempDir, extra: &[&str]) -> Config {
    let data_dir = tmp.path().to_str().unwrap().to_string();
    let mut args = vec!["housewarming", "--data-dir", data_dir.as_str()];
    args.extend_from_slice(extra);
    Cli::try_parse_from(args).unwrap().config
}

fn app_with(
    tmp: &TempDir,
    mode: SyncMode,
    durable: Option<Arc<dyn RecordStore>>,
    extra: &[&str],
) -> axum::Router {
    let config = test_config(tmp, extra);
    let disk = Arc::new(DiskBlobStore::new(
        &config.data_dir,
        config.blob_url_base(),
        UrlSigner::new(Some("test-signing-key")),
        Duration::from_secs(3600),
    ));
    let reconciler = Reconciler::new(
        mode,
        durable,
        Arc::new(LocalStore::in_memory()),
        disk.clone() as Arc<dyn BlobStore>,
    );
    let state = AppState {
        reconciler: Arc::new(reconciler),
        pledges: Arc::new(PledgeEngine::new(
            VenmoLinkBuilder::new(&config.venmo_username).unwrap(),
        )),
        disk_blobs: Some(disk),
    };
    build_router(&config, state)
}

fn app(tmp: &TempDir) -> axum::Router {
    let sqlite: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    app_with(tmp, SyncMode::RemoteRequired, Some(sqlite), &[])
}

fn req(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn req_json(method: &str, uri: &str, value: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap()))
        .unwrap()
}

async fn body_bytes(res: axum::response::Response) -> Bytes {
    res.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(res: axum::response::Response) -> Value {
    let bytes = body_bytes(res).await;
    serde_json::from_slice(&bytes).unwrap()
}

fn assert_error_shape(json: &Value, code: &str) {
    assert_eq!(json["error"]["code"], code);
    assert!(!json["error"]["message"].as_str().unwrap().is_empty());
    assert!(json["error"]["details"].is_object());
}

#[tokio::test]
async fn health_reports_ok() {
    let tmp = tempfile::tempdir().unwrap();
    let res = app(&tmp).oneshot(req("GET", "/api/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["sync_mode"], "remote-required");
}

#[tokio::test]
async fn unknown_route_returns_404_with_error_shape() {
    let tmp = tempfile::tempdir().unwrap();
    let res = app(&tmp).oneshot(req("GET", "/api/nope")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_error_shape(&body_json(res).await, "not_found");
}

#[tokio::test]
async fn funds_are_seeded() {
    let tmp = tempfile::tempdir().unwrap();
    let res = app(&tmp).oneshot(req("GET", "/api/funds")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    let ids: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["fund_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 5);
    assert!(ids.contains(&"mower"));
    assert!(json.as_array().unwrap().iter().all(|f| f["current"] == 0));
}

#[tokio::test]
async fn pledge_increments_fund_and_returns_payment_link() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    let res = app
        .clone()
        .oneshot(req_json(
            "POST",
            "/api/pledge",
            json!({"fund_id": "mower", "amount": 50, "name": "Casper"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["fund"]["current"], 50);
    let url = json["redirect_url"].as_str().unwrap();
    assert!(url.contains("MOWER"));
    assert!(url.contains("50"));
    assert_eq!(json["pledge"]["name"], "Casper");

    let res = app.oneshot(req("GET", "/api/funds")).await.unwrap();
    let json = body_json(res).await;
    let mower = json
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["fund_id"] == "mower")
        .unwrap();
    assert_eq!(mower["current"], 50);
}

#[tokio::test]
async fn rejected_pledges_leave_funds_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    let res = app
        .clone()
        .oneshot(req_json(
            "POST",
            "/api/pledge",
            json!({"fund_id": "hottub", "amount": 10}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_error_shape(&body_json(res).await, "not_found");

    for body in [
        json!({"fund_id": "mower", "amount": 0}),
        json!({"fund_id": "mower", "amount": -5}),
        json!({"fund_id": "mower", "amount": "lots"}),
        json!({"fund_id": "mower"}),
        json!({"amount": 5}),
    ] {
        let res = app
            .clone()
            .oneshot(req_json("POST", "/api/pledge", body.clone()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{body}");
        assert_error_shape(&body_json(res).await, "invalid_request");
    }

    let res = app.oneshot(req("GET", "/api/funds")).await.unwrap();
    let json = body_json(res).await;
    assert!(json.as_array().unwrap().iter().all(|f| f["current"] == 0));
}

#[tokio::test]
async fn malformed_json_is_invalid_request() {
    let tmp = tempfile::tempdir().unwrap();
    let res = app(&tmp)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/guestbook")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_error_shape(&body_json(res).await, "invalid_request");
}

#[tokio::test]
async fn guestbook_rejects_empty_message() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    let res = app
        .clone()
        .oneshot(req_json(
            "POST",
            "/api/guestbook",
            json!({"name": "Casper", "message": "   "}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_error_shape(&body_json(res).await, "invalid_request");

    let res = app.oneshot(req("GET", "/api/guestbook")).await.unwrap();
    assert_eq!(body_json(res).await, json!([]));
}

#[tokio::test]
async fn guestbook_lists_newest_first() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    for (message, created_at) in [
        ("middle", "2025-10-15T12:00:00.000Z"),
        ("newest", "2025-10-31T12:00:00.000Z"),
        ("oldest", "2025-10-01T12:00:00.000Z"),
    ] {
        let res = app
            .clone()
            .oneshot(req_json(
                "POST",
                "/api/guestbook",
                json!({"message": message, "created_at": created_at}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app.oneshot(req("GET", "/api/guestbook")).await.unwrap();
    let json = body_json(res).await;
    let messages: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["message"].as_str().unwrap())
        .collect();
    assert_eq!(messages, vec!["newest", "middle", "oldest"]);
}

#[tokio::test]
async fn guestbook_cards_carry_display_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    let res = app
        .clone()
        .oneshot(req_json(
            "POST",
            "/api/guestbook",
            json!({
                "message": "boo",
                "image_url": "https://example.com/pumpkin.jpg",
                "created_at": "2025-10-31T12:00:00.000Z"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = app
        .clone()
        .oneshot(req_json(
            "POST",
            "/api/guestbook",
            json!({"name": "Casper", "message": "hi", "created_at": "2025-10-01T12:00:00.000Z"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.oneshot(req("GET", "/api/guestbook")).await.unwrap();
    let json = body_json(res).await;
    let cards = json.as_array().unwrap();

    assert_eq!(cards[0]["name"], Value::Null);
    assert_eq!(cards[0]["display_name"], "A friendly ghost");
    assert_eq!(cards[0]["display_alt"], "Guestbook upload");

    assert_eq!(cards[1]["display_name"], "Casper");
    assert!(cards[1].get("display_alt").is_none());
}

#[tokio::test]
async fn gallery_requires_src_and_leaves_list_unchanged() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    let res = app
        .clone()
        .oneshot(req_json(
            "POST",
            "/api/gallery",
            json!({"caption": "no image"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let json = body_json(res).await;
    assert_error_shape(&json, "invalid_request");
    assert_eq!(json["error"]["details"]["field"], "src");

    let res = app.oneshot(req("GET", "/api/gallery")).await.unwrap();
    assert_eq!(body_json(res).await, json!([]));
}

#[tokio::test]
async fn gallery_rejects_non_array_tags() {
    let tmp = tempfile::tempdir().unwrap();
    let res = app(&tmp)
        .oneshot(req_json(
            "POST",
            "/api/gallery",
            json!({"src": "https://example.com/a.jpg", "tags": "party"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_error_shape(&body_json(res).await, "invalid_request");
}

#[tokio::test]
async fn gallery_filters_by_tag() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    for (src, tags) in [
        ("https://example.com/porch.jpg", json!(["house"])),
        ("https://example.com/costume.jpg", json!(["party"])),
    ] {
        let res = app
            .clone()
            .oneshot(req_json(
                "POST",
                "/api/gallery",
                json!({"src": src, "tags": tags}),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .clone()
        .oneshot(req("GET", "/api/gallery?tag=party"))
        .await
        .unwrap();
    let json = body_json(res).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["src"], "https://example.com/costume.jpg");

    let res = app.oneshot(req("GET", "/api/gallery?tag=all")).await.unwrap();
    assert_eq!(body_json(res).await.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn uploaded_image_is_served_through_signed_url() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    let res = app
        .clone()
        .oneshot(req_json(
            "POST",
            "/api/guestbook",
            json!({
                "message": "boo",
                "image_url": to_data_url("image/png", b"png-bytes"),
                "image_alt": "ghost.png"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    let url = json[0]["image_url"].as_str().unwrap().to_string();
    assert!(url.starts_with("/api/blobs/guestbook/"), "{url}");
    assert!(url.contains("-ghost.png?expires="), "{url}");

    let res = app.clone().oneshot(req("GET", &url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(body_bytes(res).await, Bytes::from_static(b"png-bytes"));

    let tampered = url.replace("sig=", "sig=AAAA");
    let res = app.clone().oneshot(req("GET", &tampered)).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_error_shape(&body_json(res).await, "forbidden");

    let (path, _) = url.split_once('?').unwrap();
    let res = app.oneshot(req("GET", path)).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn five_mib_upload_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app(&tmp);

    let res = app
        .clone()
        .oneshot(req_json(
            "POST",
            "/api/gallery",
            json!({"src": to_data_url("image/jpeg", &vec![1u8; MAX_BLOB_BYTES])}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json = body_json(res).await;
    assert_error_shape(&json, "payload_too_large");
    assert_eq!(json["error"]["details"]["limit"], MAX_BLOB_BYTES);

    let res = app
        .oneshot(req_json(
            "POST",
            "/api/gallery",
            json!({"src": to_data_url("image/jpeg", &vec![1u8; MAX_BLOB_BYTES - 1])}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn unreachable_upstream_serves_fallback_reads_and_fails_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let remote: Arc<dyn RecordStore> = Arc::new(
        RemoteStore::new("http://127.0.0.1:9", None, Duration::from_millis(300)).unwrap(),
    );
    let app = app_with(&tmp, SyncMode::RemoteRequired, Some(remote), &[]);

    let res = app
        .clone()
        .oneshot(req("GET", "/api/guestbook"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await, json!([]));

    let res = app
        .clone()
        .oneshot(req("GET", "/api/funds"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await.as_array().unwrap().len(), 5);

    let res = app
        .oneshot(req_json(
            "POST",
            "/api/guestbook",
            json!({"message": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(res).await;
    assert_error_shape(&json, "unavailable");
    assert!(!json["error"]["message"].as_str().unwrap().contains("127.0.0.1"));
}

#[tokio::test]
async fn custom_prefix_and_cors_preflight() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app_with(
        &tmp,
        SyncMode::LocalOnly,
        None,
        &["--api-prefix", "/v1", "--cors-origin", "https://party.example"],
    );

    let res = app
        .clone()
        .oneshot(req("GET", "/v1/health"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/v1/guestbook")
                .header(header::ORIGIN, "https://party.example")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://party.example"
    );
}
