use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use quayside::config::RegistryConfig;
use quayside::digest::Digest;
use quayside::serve::routes::build_router;
use quayside::serve::state::AppState;
use serde_json::json;
use tower::ServiceExt;

fn app() -> axum::Router {
    build_router(AppState::new(RegistryConfig::default()))
}

fn app_without_delete() -> axum::Router {
    build_router(AppState::new(RegistryConfig {
        enable_delete: false,
        ..RegistryConfig::default()
    }))
}

async fn send(app: &axum::Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn request(app: &axum::Router, method: Method, uri: String) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

async fn put_blob(app: &axum::Router, name: &str, data: &[u8]) -> Digest {
    let digest = Digest::compute(data);
    let response = send(
        app,
        Request::builder()
            .method(Method::POST)
            .uri(format!("/v2/{name}/blobs/uploads/?digest={digest}"))
            .body(Body::from(data.to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    digest
}

async fn put_manifest(app: &axum::Router, name: &str, reference: &str, body: String) -> Digest {
    let digest = Digest::compute(body.as_bytes());
    let response = send(
        app,
        Request::builder()
            .method(Method::PUT)
            .uri(format!("/v2/{name}/manifests/{reference}"))
            .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
            .body(Body::from(body))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    digest
}

fn plain_manifest(marker: &str) -> String {
    json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.empty.v1+json",
            "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
            "size": 2
        },
        "layers": [],
        "annotations": {"org.example.marker": marker}
    })
    .to_string()
}

async fn tag_count(app: &axum::Router, name: &str) -> usize {
    let response = request(app, Method::GET, format!("/v2/{name}/tags/list")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    json["tags"].as_array().unwrap().len()
}

#[tokio::test]
async fn delete_tag_removes_only_the_tag_pointer() {
    let app = app();
    let body = plain_manifest("shared");
    let digest = put_manifest(&app, "myorg/app", "keep", body.clone()).await;
    put_manifest(&app, "myorg/app", "drop", body).await;
    assert_eq!(tag_count(&app, "myorg/app").await, 2);

    let response = request(
        &app,
        Method::DELETE,
        "/v2/myorg/app/manifests/drop".to_string(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // exactly one tag gone; content still reachable by digest and by the
    // surviving tag
    assert_eq!(tag_count(&app, "myorg/app").await, 1);
    for reference in ["keep", digest.as_str()] {
        let response = request(
            &app,
            Method::GET,
            format!("/v2/myorg/app/manifests/{reference}"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = request(
        &app,
        Method::GET,
        "/v2/myorg/app/manifests/drop".to_string(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_manifest_by_digest_removes_content_and_tags() {
    let app = app();
    let digest = put_manifest(&app, "myorg/app", "v1", plain_manifest("doomed")).await;

    let response = request(
        &app,
        Method::DELETE,
        format!("/v2/myorg/app/manifests/{digest}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    for reference in ["v1", digest.as_str()] {
        let response = request(
            &app,
            Method::GET,
            format!("/v2/myorg/app/manifests/{reference}"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    assert_eq!(tag_count(&app, "myorg/app").await, 0);
}

#[tokio::test]
async fn delete_referrer_manifest_removes_its_index_entry() {
    let app = app();
    let subject = Digest::compute(b"subject");
    let referrer = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "artifactType": "application/vnd.example.sbom",
        "config": {
            "mediaType": "application/vnd.oci.empty.v1+json",
            "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
            "size": 2
        },
        "layers": [],
        "subject": {
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": subject.as_str(),
            "size": 100
        }
    })
    .to_string();
    let referrer_digest = Digest::compute(referrer.as_bytes());
    put_manifest(&app, "myorg/app", referrer_digest.as_str(), referrer).await;

    let response = request(
        &app,
        Method::DELETE,
        format!("/v2/myorg/app/manifests/{referrer_digest}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = request(
        &app,
        Method::GET,
        format!("/v2/myorg/app/referrers/{subject}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let index: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(index["manifests"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn delete_blob_returns_202_then_404() {
    let app = app();
    let digest = put_blob(&app, "myorg/app", b"deletable layer").await;

    let response = request(
        &app,
        Method::DELETE,
        format!("/v2/myorg/app/blobs/{digest}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = request(&app, Method::GET, format!("/v2/myorg/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = request(
        &app,
        Method::DELETE,
        format!("/v2/myorg/app/blobs/{digest}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deletion_disabled_answers_405() {
    let app = app_without_delete();
    let digest = put_blob(&app, "myorg/app", b"protected layer").await;
    put_manifest(&app, "myorg/app", "v1", plain_manifest("protected")).await;

    let response = request(
        &app,
        Method::DELETE,
        format!("/v2/myorg/app/blobs/{digest}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = request(
        &app,
        Method::DELETE,
        "/v2/myorg/app/manifests/v1".to_string(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    // content untouched
    let response = request(&app, Method::GET, format!("/v2/myorg/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn delete_unknown_manifest_returns_404() {
    let app = app();
    put_manifest(&app, "myorg/app", "v1", plain_manifest("present")).await;
    let response = request(
        &app,
        Method::DELETE,
        "/v2/myorg/app/manifests/no-such-tag".to_string(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_upload_session_returns_204() {
    let app = app();
    let response = request(
        &app,
        Method::POST,
        "/v2/myorg/app/blobs/uploads/".to_string(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = response
        .headers()
        .get("Location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let response = request(&app, Method::DELETE, location.clone()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // the session is gone for good
    let response = request(&app, Method::GET, location).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
