use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use std::collections::HashMap;

use crate::digest::Digest;
use crate::oci::{
    is_valid_repository_name, is_valid_tag_name, Manifest, ReferrersIndex, TagList,
    INDEX_MEDIA_TYPE, MANIFEST_MEDIA_TYPE,
};
use crate::serve::error::OciError;
use crate::serve::state::AppState;
use crate::store::upload::{UploadError, UploadSession};

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), OciError> {
    let header_name = axum::http::header::HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| OciError::internal(format!("Invalid header name {name}: {e}")))?;
    let header_value = axum::http::header::HeaderValue::from_str(value)
        .map_err(|e| OciError::internal(format!("Invalid header value for {name}: {e}")))?;
    headers.insert(header_name, header_value);
    Ok(())
}

#[derive(Clone)]
enum OciRoute {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    BlobUploadStart { name: String },
    BlobUpload { name: String, uuid: String },
    Tags { name: String },
    Referrers { name: String, digest: String },
}

// The trailing component of each route (digest, tag, session id) is a
// single path segment, so a route literal followed by more segments is
// part of the repository name, not a separator.
fn parse_oci_path(path: &str) -> Option<OciRoute> {
    let path = path.strip_prefix('/').unwrap_or(path);

    if let Some(idx) = path.rfind("/blobs/uploads/") {
        let name = &path[..idx];
        let uuid = &path[idx + "/blobs/uploads/".len()..];
        if !name.is_empty() && !uuid.is_empty() && !uuid.contains('/') {
            return Some(OciRoute::BlobUpload {
                name: name.to_string(),
                uuid: uuid.to_string(),
            });
        }
    }

    for suffix in ["/blobs/uploads", "/blobs/uploads/"] {
        if let Some(name) = path.strip_suffix(suffix) {
            if !name.is_empty() {
                return Some(OciRoute::BlobUploadStart {
                    name: name.to_string(),
                });
            }
        }
    }

    if let Some(idx) = path.rfind("/blobs/") {
        let name = &path[..idx];
        let digest = &path[idx + "/blobs/".len()..];
        if !name.is_empty() && !digest.is_empty() && !digest.contains('/') {
            return Some(OciRoute::Blob {
                name: name.to_string(),
                digest: digest.to_string(),
            });
        }
    }

    if let Some(idx) = path.rfind("/manifests/") {
        let name = &path[..idx];
        let reference = &path[idx + "/manifests/".len()..];
        if !name.is_empty() && !reference.is_empty() && !reference.contains('/') {
            return Some(OciRoute::Manifest {
                name: name.to_string(),
                reference: reference.to_string(),
            });
        }
    }

    if let Some(name) = path.strip_suffix("/tags/list") {
        if !name.is_empty() {
            return Some(OciRoute::Tags {
                name: name.to_string(),
            });
        }
    }

    if let Some(idx) = path.rfind("/referrers/") {
        let name = &path[..idx];
        let digest = &path[idx + "/referrers/".len()..];
        if !name.is_empty() && !digest.is_empty() && !digest.contains('/') {
            return Some(OciRoute::Referrers {
                name: name.to_string(),
                digest: digest.to_string(),
            });
        }
    }

    None
}

pub async fn v2_base() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Docker-Distribution-API-Version", "registry/2.0")],
        "",
    )
}

pub async fn oci_dispatch(
    method: Method,
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, OciError> {
    let route = match parse_oci_path(&path) {
        Some(route) => route,
        None => return Err(OciError::name_unknown("not found")),
    };
    log::debug!("OCI {} /v2/{}", method, path);
    let request_method = method.clone();

    let response = match route {
        OciRoute::Manifest { name, reference } => match method {
            Method::GET | Method::HEAD => get_manifest(method, state, name, reference).await,
            Method::PUT => put_manifest(state, name, reference, headers, body).await,
            Method::DELETE => delete_manifest(state, name, reference).await,
            _ => Err(OciError::unsupported("method not allowed")),
        },
        OciRoute::Blob { name, digest } => match method {
            Method::GET | Method::HEAD => get_blob(method, state, name, digest).await,
            Method::DELETE => delete_blob(state, name, digest).await,
            _ => Err(OciError::unsupported("method not allowed")),
        },
        OciRoute::BlobUploadStart { name } => match method {
            Method::POST => start_upload(state, name, params, body).await,
            _ => Err(OciError::unsupported("method not allowed")),
        },
        OciRoute::BlobUpload { name, uuid } => match method {
            Method::GET => get_upload_status(state, name, uuid).await,
            Method::PATCH => patch_upload(state, name, uuid, headers, body).await,
            Method::PUT => put_upload(state, name, uuid, params, headers, body).await,
            Method::DELETE => delete_upload(state, name, uuid).await,
            _ => Err(OciError::unsupported("method not allowed")),
        },
        OciRoute::Tags { name } => match method {
            Method::GET => list_tags(state, name, params).await,
            _ => Err(OciError::unsupported("method not allowed")),
        },
        OciRoute::Referrers { name, digest } => match method {
            Method::GET => list_referrers(state, name, digest, params).await,
            _ => Err(OciError::unsupported("method not allowed")),
        },
    };

    if let Err(error) = &response {
        log::debug!(
            "OCI {} /v2/{} -> {} ({})",
            request_method,
            path,
            error.status(),
            error.message()
        );
    }
    response
}

async fn collect_body(body: Body) -> Result<Vec<u8>, OciError> {
    let mut stream = body.into_data_stream();
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| OciError::blob_upload_invalid(format!("body stream error: {e}")))?;
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

/// Inclusive byte span like `0-9` from a Content-Range header. Absent
/// header means "append wherever the session is".
fn parse_content_range(headers: &HeaderMap) -> Result<Option<(u64, u64)>, OciError> {
    let Some(value) = headers.get("Content-Range") else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| OciError::blob_upload_invalid("unreadable Content-Range header"))?;
    let value = value.strip_prefix("bytes ").unwrap_or(value);
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| OciError::blob_upload_invalid(format!("malformed Content-Range {value}")))?;
    let start = start
        .trim()
        .parse::<u64>()
        .map_err(|_| OciError::blob_upload_invalid(format!("malformed Content-Range {value}")))?;
    let end = end
        .trim()
        .parse::<u64>()
        .map_err(|_| OciError::blob_upload_invalid(format!("malformed Content-Range {value}")))?;
    if end < start {
        return Err(OciError::blob_upload_invalid(format!(
            "inverted Content-Range {value}"
        )));
    }
    Ok(Some((start, end)))
}

fn require_valid_name(name: &str) -> Result<(), OciError> {
    if is_valid_repository_name(name) {
        Ok(())
    } else {
        Err(OciError::name_invalid(format!(
            "invalid repository name {name}"
        )))
    }
}

fn parse_digest(raw: &str) -> Result<Digest, OciError> {
    Digest::parse(raw).map_err(|e| OciError::digest_invalid(e.to_string()))
}

fn range_header(bytes_received: u64) -> String {
    let end = bytes_received.saturating_sub(1);
    format!("0-{end}")
}

fn session_accepted_response(
    name: &str,
    uuid: &str,
    bytes_received: u64,
    status: StatusCode,
) -> Result<Response, OciError> {
    let location = format!("/v2/{name}/blobs/uploads/{uuid}");
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "Location", &location)?;
    insert_header(&mut headers, "Docker-Upload-UUID", uuid)?;
    insert_header(&mut headers, "Range", &range_header(bytes_received))?;
    insert_header(&mut headers, "Content-Length", "0")?;
    Ok((status, headers, Body::empty()).into_response())
}

fn blob_created_response(name: &str, digest: &Digest) -> Result<Response, OciError> {
    let location = format!("/v2/{name}/blobs/{digest}");
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "Location", &location)?;
    insert_header(&mut headers, "Docker-Content-Digest", digest.as_str())?;
    insert_header(&mut headers, "Content-Length", "0")?;
    Ok((StatusCode::CREATED, headers, Body::empty()).into_response())
}

async fn start_upload(
    state: AppState,
    name: String,
    params: HashMap<String, String>,
    body: Body,
) -> Result<Response, OciError> {
    require_valid_name(&name)?;

    if let Some(mount_digest) = params.get("mount") {
        let digest = parse_digest(mount_digest)?;
        let from = params.get("from").map(String::as_str);
        let mounted = {
            let mut store = state.store.write().await;
            store.mount_blob(&name, &digest, from, state.config.auto_mount_discovery)
        };
        if mounted {
            return blob_created_response(&name, &digest);
        }
        // degrade to an ordinary session under the target namespace
    }

    let data = collect_body(body).await?;

    // single-POST monolithic upload
    if let Some(digest_param) = params.get("digest") {
        let expected = parse_digest(digest_param)?;
        let actual = Digest::compute(&data);
        if actual != expected {
            return Err(OciError::digest_invalid(format!(
                "expected {expected}, got {actual}"
            )));
        }
        let mut store = state.store.write().await;
        store.put_blob(&name, expected.clone(), data.into());
        return blob_created_response(&name, &expected);
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let mut session = UploadSession::new(session_id.clone(), name.clone());
    if !data.is_empty() {
        session
            .append_chunk(None, &data)
            .map_err(|e| OciError::blob_upload_invalid(e.to_string()))?;
    }
    let bytes_received = session.bytes_received();

    let mut sessions = state.upload_sessions.write().await;
    sessions.create(session);

    session_accepted_response(&name, &session_id, bytes_received, StatusCode::ACCEPTED)
}

async fn get_upload_status(
    state: AppState,
    name: String,
    uuid: String,
) -> Result<Response, OciError> {
    let bytes_received = {
        let sessions = state.upload_sessions.read().await;
        let session = sessions
            .get(&uuid)
            .filter(|s| s.repository == name)
            .ok_or_else(|| OciError::blob_upload_unknown(format!("upload {uuid}")))?;
        session.bytes_received()
    };

    session_accepted_response(&name, &uuid, bytes_received, StatusCode::NO_CONTENT)
}

async fn patch_upload(
    state: AppState,
    name: String,
    uuid: String,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, OciError> {
    // a session id only resolves inside the namespace that opened it
    let session_write_lock = {
        let sessions = state.upload_sessions.read().await;
        let session = sessions
            .get(&uuid)
            .filter(|s| s.repository == name)
            .ok_or_else(|| OciError::blob_upload_unknown(format!("upload {uuid}")))?;
        session.write_lock.clone()
    };
    let _session_guard = session_write_lock.lock().await;

    let range = parse_content_range(&headers)?;
    let data = collect_body(body).await?;
    if let Some((start, end)) = range {
        let declared = end
            .checked_sub(start)
            .and_then(|span| span.checked_add(1))
            .ok_or_else(|| {
                OciError::size_invalid(format!("Content-Range {start}-{end} is out of range"))
            })?;
        if declared != data.len() as u64 {
            return Err(OciError::size_invalid(format!(
                "Content-Range spans {declared} bytes but body is {} bytes",
                data.len()
            )));
        }
    }

    let mut sessions = state.upload_sessions.write().await;
    let session = sessions
        .get_mut(&uuid)
        .ok_or_else(|| OciError::blob_upload_unknown(format!("upload {uuid}")))?;
    let bytes_received = session
        .append_chunk(range.map(|(start, _)| start), &data)
        .map_err(|e| match e {
            UploadError::NonContiguousChunk { .. } => OciError::range_not_satisfiable(e.to_string()),
            other => OciError::blob_upload_invalid(other.to_string()),
        })?;
    drop(sessions);

    session_accepted_response(&name, &uuid, bytes_received, StatusCode::ACCEPTED)
}

async fn put_upload(
    state: AppState,
    name: String,
    uuid: String,
    params: HashMap<String, String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, OciError> {
    let digest_param = params
        .get("digest")
        .ok_or_else(|| OciError::digest_invalid("missing digest query parameter"))?;
    let expected = parse_digest(digest_param)?;

    let session_write_lock = {
        let sessions = state.upload_sessions.read().await;
        let session = sessions
            .get(&uuid)
            .filter(|s| s.repository == name)
            .ok_or_else(|| OciError::blob_upload_unknown(format!("upload {uuid}")))?;
        session.write_lock.clone()
    };
    let _session_guard = session_write_lock.lock().await;

    let range = parse_content_range(&headers)?;
    let data = collect_body(body).await?;

    let blob = {
        let mut sessions = state.upload_sessions.write().await;
        let session = sessions
            .get_mut(&uuid)
            .ok_or_else(|| OciError::blob_upload_unknown(format!("upload {uuid}")))?;
        let bytes_before = session.bytes_received();

        if !data.is_empty() {
            session
                .append_chunk(range.map(|(start, _)| start), &data)
                .map_err(|e| match e {
                    UploadError::NonContiguousChunk { .. } => {
                        OciError::range_not_satisfiable(e.to_string())
                    }
                    other => OciError::blob_upload_invalid(other.to_string()),
                })?;
        }

        match session.commit(&expected) {
            Ok(blob) => blob,
            Err(e) => {
                // roll back the final chunk; the session stays resumable
                session.truncate(bytes_before);
                return Err(OciError::digest_invalid(e.to_string()));
            }
        }
    };

    {
        let mut sessions = state.upload_sessions.write().await;
        sessions.remove(&uuid);
    }
    {
        let mut store = state.store.write().await;
        store.put_blob(&name, expected.clone(), blob);
    }

    blob_created_response(&name, &expected)
}

async fn delete_upload(state: AppState, name: String, uuid: String) -> Result<Response, OciError> {
    let mut sessions = state.upload_sessions.write().await;
    if sessions.get(&uuid).is_none_or(|s| s.repository != name) {
        return Err(OciError::blob_upload_unknown(format!("upload {uuid}")));
    }
    if let Some(mut session) = sessions.remove(&uuid) {
        session.abandon();
    }
    Ok((StatusCode::NO_CONTENT, Body::empty()).into_response())
}

async fn get_blob(
    method: Method,
    state: AppState,
    name: String,
    digest: String,
) -> Result<Response, OciError> {
    let digest = parse_digest(&digest)?;
    let blob = {
        let store = state.store.read().await;
        store
            .get_blob(&name, &digest)
            .ok_or_else(|| OciError::blob_unknown(format!("{name}@{digest}")))?
    };

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "Docker-Content-Digest", digest.as_str())?;
    insert_header(&mut headers, "Content-Type", "application/octet-stream")?;
    insert_header(&mut headers, "Content-Length", &blob.len().to_string())?;

    if method == Method::HEAD {
        return Ok((StatusCode::OK, headers, Body::empty()).into_response());
    }
    Ok((StatusCode::OK, headers, Body::from(blob)).into_response())
}

async fn delete_blob(state: AppState, name: String, digest: String) -> Result<Response, OciError> {
    if !state.config.enable_delete {
        return Err(OciError::unsupported("deletion is disabled"));
    }
    let digest = parse_digest(&digest)?;
    let deleted = {
        let mut store = state.store.write().await;
        store.delete_blob(&name, &digest)
    };
    if !deleted {
        return Err(OciError::blob_unknown(format!("{name}@{digest}")));
    }
    Ok((StatusCode::ACCEPTED, Body::empty()).into_response())
}

async fn put_manifest(
    state: AppState,
    name: String,
    reference: String,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, OciError> {
    require_valid_name(&name)?;

    let content_type = headers
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let data = collect_body(body).await?;
    let parsed = Manifest::parse(&data, content_type.as_deref())
        .map_err(|e| OciError::manifest_invalid(e.to_string()))?;

    let digest = Digest::compute(&data);
    let tag = match Digest::parse(&reference) {
        Ok(declared) => {
            if declared != digest {
                return Err(OciError::digest_invalid(format!(
                    "manifest digests to {digest}, reference says {declared}"
                )));
            }
            None
        }
        Err(_) => {
            if !is_valid_tag_name(&reference) {
                return Err(OciError::tag_invalid(format!("invalid tag {reference}")));
            }
            Some(reference.clone())
        }
    };

    let media_type = content_type
        .or_else(|| parsed.media_type.clone())
        .unwrap_or_else(|| MANIFEST_MEDIA_TYPE.to_string());
    let subject_digest = parsed.subject.as_ref().map(|s| s.digest.clone());

    {
        let mut store = state.store.write().await;
        store.put_manifest(
            &name,
            digest.clone(),
            media_type,
            data.into(),
            &parsed,
            tag.as_deref(),
        );
    }

    let location = format!("/v2/{name}/manifests/{digest}");
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "Location", &location)?;
    insert_header(&mut headers, "Docker-Content-Digest", digest.as_str())?;
    if let Some(subject) = subject_digest {
        insert_header(&mut headers, "OCI-Subject", subject.as_str())?;
    }
    insert_header(&mut headers, "Content-Length", "0")?;

    Ok((StatusCode::CREATED, headers, Body::empty()).into_response())
}

async fn get_manifest(
    method: Method,
    state: AppState,
    name: String,
    reference: String,
) -> Result<Response, OciError> {
    let manifest = {
        let store = state.store.read().await;
        store
            .get_manifest(&name, &reference)
            .ok_or_else(|| OciError::manifest_unknown(format!("{name}:{reference}")))?
    };

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "Docker-Content-Digest", manifest.digest.as_str())?;
    insert_header(&mut headers, "Content-Type", &manifest.media_type)?;
    insert_header(
        &mut headers,
        "Content-Length",
        &manifest.bytes.len().to_string(),
    )?;

    if method == Method::HEAD {
        return Ok((StatusCode::OK, headers, Body::empty()).into_response());
    }
    Ok((StatusCode::OK, headers, Body::from(manifest.bytes)).into_response())
}

async fn delete_manifest(
    state: AppState,
    name: String,
    reference: String,
) -> Result<Response, OciError> {
    if !state.config.enable_delete {
        return Err(OciError::unsupported("deletion is disabled"));
    }

    let deleted = {
        let mut store = state.store.write().await;
        match Digest::parse(&reference) {
            Ok(digest) => store.delete_manifest(&name, &digest),
            Err(_) => store.delete_tag(&name, &reference),
        }
    };
    if !deleted {
        return Err(OciError::manifest_unknown(format!("{name}:{reference}")));
    }
    Ok((StatusCode::ACCEPTED, Body::empty()).into_response())
}

async fn list_tags(
    state: AppState,
    name: String,
    params: HashMap<String, String>,
) -> Result<Response, OciError> {
    let n = match params.get("n") {
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| OciError::size_invalid(format!("invalid n parameter {raw}")))?,
        ),
        None => None,
    };
    let last = params.get("last").map(String::as_str);

    let tags = {
        let store = state.store.read().await;
        store
            .list_tags(&name, n, last)
            .ok_or_else(|| OciError::name_unknown(format!("repository {name}")))?
    };

    let body = serde_json::to_string(&TagList { name, tags })
        .map_err(|e| OciError::internal(format!("Failed to encode tag list: {e}")))?;
    Ok((
        StatusCode::OK,
        [("Content-Type", "application/json")],
        body,
    )
        .into_response())
}

async fn list_referrers(
    state: AppState,
    name: String,
    digest: String,
    params: HashMap<String, String>,
) -> Result<Response, OciError> {
    let subject = parse_digest(&digest)?;
    let filter = params
        .get("artifactType")
        .filter(|_| state.config.filter_referrers)
        .map(String::as_str);

    let manifests = {
        let store = state.store.read().await;
        store.list_referrers(&name, &subject, filter)
    };

    let index = ReferrersIndex::new(manifests);
    let body = serde_json::to_string(&index)
        .map_err(|e| OciError::internal(format!("Failed to encode referrers index: {e}")))?;

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "Content-Type", INDEX_MEDIA_TYPE)?;
    if filter.is_some() {
        insert_header(&mut headers, "OCI-Filters-Applied", "artifactType")?;
    }
    Ok((StatusCode::OK, headers, Body::from(body)).into_response())
}
