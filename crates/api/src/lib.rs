//! HTTP surface for needlestore.
//!
//! A deliberately small REST layer over [`Store`] and [`ChunkManager`]:
//! upload, download, delete, metadata and name lookups, chunked uploads,
//! and status/health probes. Bare hyper, one handler, no framework.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use needlestore_storage::{ChunkManager, Store, StoreError};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared handler state.
pub struct ApiContext {
    pub store: Arc<Store>,
    pub chunks: Arc<ChunkManager>,
}

/// Serve the REST API on `addr` until the process exits.
pub async fn serve(
    addr: SocketAddr,
    ctx: Arc<ApiContext>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("api server listening on http://{}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, std::convert::Infallible>(handle(req, &ctx).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!("api connection error: {}", e);
            }
        });
    }
}

/// Route one request. Generic over the body so tests can drive it with
/// pre-built buffers.
async fn handle<B>(req: Request<B>, ctx: &ApiContext) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("failed to read request body: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(StatusCode::OK, &json!({"status": "ok"})),
        (&Method::GET, ["status"]) => {
            json_response(StatusCode::OK, &json!(ctx.store.status()))
        }

        (&Method::POST, ["upload"]) => {
            let filename = query_value(&query, "filename").unwrap_or_default();
            let mime = query_value(&query, "mime").unwrap_or_default();
            match ctx.store.write(&body, &filename, &mime) {
                Ok(id) => json_response(
                    StatusCode::OK,
                    &json!({"id": id, "size": body.len()}),
                ),
                Err(e) => store_error_response(e),
            }
        }

        (&Method::GET, ["file", id]) => match parse_id(id) {
            Some(id) => match ctx.store.read_with_metadata(id) {
                Ok((data, meta)) => {
                    let mime = if meta.mime_type.is_empty() {
                        "application/octet-stream"
                    } else {
                        &meta.mime_type
                    };
                    Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", mime)
                        .header("content-length", data.len())
                        .header("etag", meta.md5)
                        .body(Full::new(Bytes::from(data)))
                        .expect("valid HTTP response")
                }
                Err(e) => store_error_response(e),
            },
            None => error_response(StatusCode::BAD_REQUEST, "invalid id"),
        },

        (&Method::DELETE, ["file", id]) => match parse_id(id) {
            Some(id) => match ctx.store.delete(id) {
                Ok(()) => json_response(StatusCode::OK, &json!({"deleted": id})),
                Err(e) => store_error_response(e),
            },
            None => error_response(StatusCode::BAD_REQUEST, "invalid id"),
        },

        (&Method::GET, ["meta", id]) => match parse_id(id) {
            Some(id) => match ctx.store.get_metadata(id) {
                Ok(meta) => json_response(StatusCode::OK, &json!(meta)),
                Err(e) => store_error_response(e),
            },
            None => error_response(StatusCode::BAD_REQUEST, "invalid id"),
        },

        (&Method::GET, ["find"]) => {
            let name = match query_value(&query, "name") {
                Some(name) if !name.is_empty() => name,
                _ => return error_response(StatusCode::BAD_REQUEST, "missing name parameter"),
            };
            match ctx.store.find_by_name(&name) {
                Ok(Some(meta)) => json_response(StatusCode::OK, &json!(meta)),
                Ok(None) => error_response(StatusCode::NOT_FOUND, "no file with that name"),
                Err(e) => store_error_response(e),
            }
        }

        (&Method::GET, ["list"]) => {
            let prefix = query_value(&query, "prefix").unwrap_or_default();
            let limit = query_value(&query, "limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0usize);
            match ctx.store.list_by_prefix(&prefix, limit) {
                Ok(rows) => json_response(StatusCode::OK, &json!(rows)),
                Err(e) => store_error_response(e),
            }
        }

        (&Method::POST, ["chunk", "init"]) => {
            let filename = query_value(&query, "filename").unwrap_or_default();
            let chunks = query_value(&query, "chunks").and_then(|v| v.parse().ok());
            let total_size = query_value(&query, "total_size")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0u64);
            let chunks = match chunks {
                Some(n) if n > 0 => n,
                _ => return error_response(StatusCode::BAD_REQUEST, "invalid chunks parameter"),
            };
            match ctx.chunks.init_upload(&filename, chunks, total_size) {
                Ok(upload_id) => json_response(StatusCode::OK, &json!({"upload_id": upload_id})),
                Err(e) => chunk_error_response(e),
            }
        }

        (&Method::GET, ["chunk", "uploads"]) => {
            json_response(StatusCode::OK, &json!(ctx.chunks.list_uploads()))
        }

        (&Method::GET, ["chunk", upload_id, "progress"]) => {
            match ctx.chunks.progress(upload_id) {
                Ok((uploaded, total)) => json_response(
                    StatusCode::OK,
                    &json!({"uploaded": uploaded, "total": total}),
                ),
                Err(e) => chunk_error_response(e),
            }
        }

        (&Method::POST, ["chunk", upload_id, "complete"]) => {
            let mime = query_value(&query, "mime").unwrap_or_default();
            let (data, filename) = match ctx.chunks.merge(upload_id) {
                Ok(merged) => merged,
                Err(e) => return chunk_error_response(e),
            };
            match ctx.store.write(&data, &filename, &mime) {
                Ok(id) => {
                    if let Err(e) = ctx.chunks.cleanup(upload_id) {
                        tracing::warn!("failed to clean up upload {}: {}", upload_id, e);
                    }
                    json_response(StatusCode::OK, &json!({"id": id, "size": data.len()}))
                }
                Err(e) => store_error_response(e),
            }
        }

        (&Method::POST, ["chunk", upload_id, index]) => match index.parse::<usize>() {
            Ok(index) => match ctx.chunks.upload_chunk(upload_id, index, &body) {
                Ok(()) => json_response(StatusCode::OK, &json!({"received": index})),
                Err(e) => chunk_error_response(e),
            },
            Err(_) => error_response(StatusCode::BAD_REQUEST, "invalid chunk index"),
        },

        _ => error_response(StatusCode::NOT_FOUND, "no such route"),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response")
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({"error": message}))
}

fn store_error_response(err: StoreError) -> Response<Full<Bytes>> {
    match &err {
        StoreError::NeedleNotFound(_) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
        StoreError::ReadOnly => error_response(StatusCode::FORBIDDEN, &err.to_string()),
        _ => {
            tracing::warn!("request failed: {}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn chunk_error_response(err: needlestore_storage::chunk::ChunkError) -> Response<Full<Bytes>> {
    use needlestore_storage::chunk::ChunkError;
    match &err {
        ChunkError::UploadNotFound(_) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
        ChunkError::IndexOutOfRange { .. } | ChunkError::Incomplete { .. } => {
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        ChunkError::Io(_) => {
            tracing::warn!("chunk request failed: {}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

fn parse_id(raw: &str) -> Option<u64> {
    raw.parse().ok()
}

/// Split a query string into key/value pairs, percent-decoding values.
fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn query_value(query: &[(String, String)], key: &str) -> Option<String> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Minimal percent-decoding: `%XX` escapes and `+` as space. Malformed
/// escapes pass through verbatim.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if let (Some(h), Some(l)) = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    out.push((h * 16 + l) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
