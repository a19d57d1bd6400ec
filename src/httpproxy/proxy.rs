/**
 * Copyright (c) 2024-2025 MAAS Developers.
 *
 * This file is part of MAAS Agent
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HOST};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::{CacheError, FileCache};
use crate::httpproxy::rewrite::{extract_key, CacheRule, Rewriter};
use crate::httpproxy::target::{TargetError, TargetSelector};

/// Identity stamped into the `Server` response header.
pub const SERVER_IDENT: &str = "maas-agent";

// upstream requests are abandoned after this long
const DEFAULT_ORIGIN_TIMEOUT: Duration = Duration::from_secs(3 * 60);

// frames buffered between the upstream pump and the client stream
const STREAM_BUFFER_FRAMES: usize = 16;

const COPY_CHUNK: usize = 64 * 1024;

pub type ProxyBody = BoxBody<Bytes, io::Error>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Targets(#[from] TargetError),
    #[error("invalid upstream url: {0}")]
    InvalidTarget(String),
}

/// A cache store paired with the ordered key-extraction rules that decide
/// which request paths it serves.
pub struct Cacher {
    pub store: Arc<FileCache>,
    pub rules: Vec<CacheRule>,
}

impl Cacher {
    pub fn new(store: Arc<FileCache>, rules: Vec<CacheRule>) -> Self {
        Cacher { store, rules }
    }
}

/// Caching reverse proxy over a pool of region-controller endpoints.
///
/// Requests are path-rewritten, served from the on-disk cache when a key
/// rule matches a stored entry, and otherwise forwarded to a selected
/// upstream. Successful 200 responses are teed into the cache while they
/// stream to the client. Failing upstreams are retried against the
/// remaining targets.
pub struct Proxy {
    targets: TargetSelector,
    rewriter: Rewriter,
    cacher: Option<Cacher>,
    client: Client<HttpConnector, Full<Bytes>>,
    origin_timeout: Duration,
}

impl Proxy {
    pub fn new(
        targets: Vec<String>,
        rewriter: Rewriter,
        cacher: Option<Cacher>,
    ) -> Result<Self, ProxyError> {
        for target in &targets {
            let uri: Uri = target
                .parse()
                .map_err(|_| ProxyError::InvalidTarget(target.clone()))?;
            if uri.authority().is_none() {
                return Err(ProxyError::InvalidTarget(target.clone()));
            }
        }
        Ok(Proxy {
            targets: TargetSelector::new(targets)?,
            rewriter,
            cacher,
            client: Client::builder(TokioExecutor::new()).build_http(),
            origin_timeout: DEFAULT_ORIGIN_TIMEOUT,
        })
    }

    pub fn with_origin_timeout(mut self, timeout: Duration) -> Self {
        self.origin_timeout = timeout;
        self
    }

    pub fn targets(&self) -> &TargetSelector {
        &self.targets
    }

    /// Runs one request through the full proxy lifecycle. Never fails;
    /// errors surface as HTTP status responses.
    pub async fn handle(
        &self,
        req: Request<ProxyBody>,
        peer: Option<SocketAddr>,
    ) -> Response<ProxyBody> {
        let method = req.method().clone();
        let allowed = [
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::DELETE,
        ];
        if !allowed.contains(&method) {
            return finalize(
                status_response(StatusCode::METHOD_NOT_ALLOWED),
                &method,
                false,
            );
        }

        let (mut parts, body) = req.into_parts();
        let original_pq = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        // phase one: path rewriting, first matching rule wins
        if let Some(rewritten) = self.rewriter.rewrite(parts.uri.path()) {
            match replace_path(&parts.uri, &rewritten) {
                Ok(uri) => {
                    if let Ok(value) = HeaderValue::from_str(&original_pq) {
                        parts.headers.insert("x-original-uri", value);
                    }
                    debug!(from = %original_pq, to = %uri, "rewrote request path");
                    parts.uri = uri;
                }
                Err(_) => {
                    return finalize(status_response(StatusCode::BAD_REQUEST), &method, false)
                }
            }
        }

        // phase two: cache lookup
        let cacher_enabled = self.cacher.is_some();
        let mut cache_key: Option<String> = None;
        if let Some(cacher) = &self.cacher {
            if let Some(key) = extract_key(&cacher.rules, parts.uri.path()) {
                match cacher.store.get(&key).await {
                    Ok(file) => {
                        let resp = serve_cached(file, &parts.headers).await;
                        return finalize(resp, &method, cacher_enabled);
                    }
                    Err(CacheError::KeyNotFound) => cache_key = Some(key),
                    Err(err) => {
                        warn!(key = %key, error = %err, "cache lookup failed, proxying instead");
                        cache_key = Some(key);
                    }
                }
            }
        }

        // the request body is buffered so the request can be reissued
        // against another target
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return finalize(status_response(StatusCode::BAD_REQUEST), &method, false),
        };

        // phase three: upstream selection, proxying, and retry across
        // the remaining targets on failure
        let mut tried: Vec<String> = Vec::new();
        let mut last_resp: Option<Response<Incoming>> = None;
        loop {
            let target = match self.targets.select(&tried) {
                Some(target) => target,
                None => break,
            };
            let outbound = match build_upstream_request(&target, &parts, body_bytes.clone(), peer) {
                Ok(req) => req,
                Err(err) => {
                    warn!(error = %err, "could not build upstream request");
                    return finalize(
                        status_response(StatusCode::BAD_GATEWAY),
                        &method,
                        cacher_enabled,
                    );
                }
            };
            match tokio::time::timeout(self.origin_timeout, self.client.request(outbound)).await {
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    if status.is_success() {
                        self.targets.record_success(&target);
                        let resp = if status == StatusCode::OK {
                            self.forward_with_cache(resp, cache_key.take())
                        } else {
                            // 206 and other success codes stream through
                            // untouched and are never cached
                            forward(resp)
                        };
                        return finalize(resp, &method, cacher_enabled);
                    }
                    if status == StatusCode::NOT_FOUND {
                        debug!(target = %target, "upstream returned 404, not retrying");
                        return finalize(forward(resp), &method, cacher_enabled);
                    }
                    if status.is_server_error() {
                        warn!(%status, target = %target, "upstream failed, selecting another target");
                        self.targets.record_failure(&target);
                        tried.push(target);
                        last_resp = Some(resp);
                        continue;
                    }
                    return finalize(forward(resp), &method, cacher_enabled);
                }
                Ok(Err(err)) => {
                    warn!(error = %err, target = %target, "upstream transport error");
                    self.targets.record_failure(&target);
                    tried.push(target);
                }
                Err(_) => {
                    warn!(target = %target, "upstream request timed out");
                    self.targets.record_failure(&target);
                    tried.push(target);
                }
            }
        }

        // every target has been tried: answer with the last upstream
        // status seen, or 503 when none of them ever responded
        match last_resp {
            Some(resp) => finalize(forward(resp), &method, cacher_enabled),
            None => finalize(
                status_response(StatusCode::SERVICE_UNAVAILABLE),
                &method,
                cacher_enabled,
            ),
        }
    }

    // stream the upstream body to the client while teeing it into the
    // cache, when a key was derived and the length is known
    fn forward_with_cache(
        &self,
        resp: Response<Incoming>,
        cache_key: Option<String>,
    ) -> Response<ProxyBody> {
        let (cacher, key) = match (&self.cacher, cache_key) {
            (Some(cacher), Some(key)) => (cacher, key),
            _ => return forward(resp),
        };
        let (parts, body) = resp.into_parts();
        let declared = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());
        let declared = match declared {
            Some(len) => len,
            // unknown length cannot be accounted against the cache budget
            None => return Response::from_parts(parts, incoming_body(body)),
        };

        let (cache_writer, cache_reader) = tokio::io::duplex(COPY_CHUNK);
        let store = cacher.store.clone();
        let insert_key = key.clone();
        tokio::spawn(async move {
            match store.set(&insert_key, cache_reader, declared).await {
                Ok(()) => debug!(key = %insert_key, "cached upstream response"),
                Err(CacheError::SetInProgress) => {
                    debug!(key = %insert_key, "another writer owns this key")
                }
                Err(err) => warn!(key = %insert_key, error = %err, "cache insert failed"),
            }
        });

        let (tx, rx) = mpsc::channel(STREAM_BUFFER_FRAMES);
        tokio::spawn(async move {
            let mut body = body;
            let mut cache_writer = Some(cache_writer);
            loop {
                match body.frame().await {
                    None => break,
                    Some(Ok(frame)) => {
                        if let Some(data) = frame.data_ref() {
                            if let Some(writer) = cache_writer.as_mut() {
                                if writer.write_all(data).await.is_err() {
                                    // cache side gave up, keep serving the client
                                    cache_writer = None;
                                }
                            }
                        }
                        if tx.send(Ok(frame)).await.is_err() {
                            // client went away, the dropped writer aborts
                            // the cache insert as a short write
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(io::Error::other(err))).await;
                        break;
                    }
                }
            }
        });
        Response::from_parts(parts, channel_body(rx))
    }
}

// body backed by an mpsc channel fed from a pump task
struct ChannelBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, io::Error>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

fn channel_body(rx: mpsc::Receiver<Result<Frame<Bytes>, io::Error>>) -> ProxyBody {
    ChannelBody { rx }.boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn incoming_body(body: Incoming) -> ProxyBody {
    body.map_err(io::Error::other).boxed()
}

// stream an async reader as a response body via a small pump task
fn reader_body<R>(mut reader: R) -> ProxyBody
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER_FRAMES);
    tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let frame = Frame::data(Bytes::copy_from_slice(&buf[..n]));
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });
    channel_body(rx)
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

fn build_or_error(builder: http::response::Builder, body: ProxyBody) -> Response<ProxyBody> {
    builder
        .body(body)
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

// last response-shaping step shared by every exit path
fn finalize(
    mut resp: Response<ProxyBody>,
    method: &Method,
    cacher_enabled: bool,
) -> Response<ProxyBody> {
    let headers = resp.headers_mut();
    headers.insert(http::header::SERVER, HeaderValue::from_static(SERVER_IDENT));
    if cacher_enabled && !headers.contains_key("x-cache") {
        headers.insert("x-cache", HeaderValue::from_static("MISS"));
    }
    if *method == Method::HEAD {
        *resp.body_mut() = empty_body();
    }
    resp
}

fn forward(resp: Response<Incoming>) -> Response<ProxyBody> {
    let (parts, body) = resp.into_parts();
    Response::from_parts(parts, incoming_body(body))
}

enum RangeSpec {
    Whole,
    Satisfiable(u64, u64),
    Unsatisfiable,
}

// single-range `bytes=` parsing; multi-range requests fall back to the
// first listed range
fn parse_range(headers: &HeaderMap, len: u64) -> RangeSpec {
    let raw = match headers.get(http::header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(raw) => raw.trim(),
        None => return RangeSpec::Whole,
    };
    let spec = match raw.strip_prefix("bytes=") {
        Some(spec) => spec.split(',').next().unwrap_or("").trim(),
        None => return RangeSpec::Unsatisfiable,
    };
    let (start_str, end_str) = match spec.split_once('-') {
        Some(parts) => parts,
        None => return RangeSpec::Unsatisfiable,
    };
    if start_str.is_empty() {
        // suffix range: the final n bytes
        let n: u64 = match end_str.parse() {
            Ok(n) if n > 0 => n,
            _ => return RangeSpec::Unsatisfiable,
        };
        if len == 0 {
            return RangeSpec::Unsatisfiable;
        }
        let start = len.saturating_sub(n);
        return RangeSpec::Satisfiable(start, len - 1);
    }
    let start: u64 = match start_str.parse() {
        Ok(start) => start,
        Err(_) => return RangeSpec::Unsatisfiable,
    };
    if start >= len {
        return RangeSpec::Unsatisfiable;
    }
    let end = if end_str.is_empty() {
        len - 1
    } else {
        match end_str.parse::<u64>() {
            Ok(end) if end >= start => end.min(len - 1),
            _ => return RangeSpec::Unsatisfiable,
        }
    };
    RangeSpec::Satisfiable(start, end)
}

// serve a cache hit, honoring single-range requests with 206 responses
async fn serve_cached(mut file: tokio::fs::File, req_headers: &HeaderMap) -> Response<ProxyBody> {
    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(err) => {
            warn!(error = %err, "could not stat cached entry");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let builder = Response::builder()
        .header("x-cache", "HIT")
        .header(CONTENT_TYPE, "application/octet-stream")
        .header("accept-ranges", "bytes");
    match parse_range(req_headers, len) {
        RangeSpec::Whole => build_or_error(
            builder.status(StatusCode::OK).header(CONTENT_LENGTH, len),
            reader_body(file),
        ),
        RangeSpec::Satisfiable(start, end) => {
            if let Err(err) = file.seek(SeekFrom::Start(start)).await {
                warn!(error = %err, "could not seek cached entry");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
            build_or_error(
                builder
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
                    .header(CONTENT_LENGTH, end - start + 1),
                reader_body(file.take(end - start + 1)),
            )
        }
        RangeSpec::Unsatisfiable => build_or_error(
            builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(CONTENT_RANGE, format!("bytes */{len}")),
            empty_body(),
        ),
    }
}

// headers that only describe the connection they arrived on
fn is_hop_by_hop(name: &http::header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

// port the inbound request onto the chosen target: scheme and authority
// come from the target, paths are joined, query strings merged
fn build_upstream_request(
    target: &str,
    parts: &http::request::Parts,
    body: Bytes,
    peer: Option<SocketAddr>,
) -> Result<Request<Full<Bytes>>, ProxyError> {
    let invalid = || ProxyError::InvalidTarget(target.to_string());
    let target_uri: Uri = target.parse().map_err(|_| invalid())?;
    let authority = target_uri.authority().ok_or_else(invalid)?.clone();
    let scheme = target_uri.scheme_str().unwrap_or("http").to_string();

    let path = join_paths(target_uri.path(), parts.uri.path());
    let query = match (target_uri.query(), parts.uri.query()) {
        (Some(a), Some(b)) => Some(format!("{a}&{b}")),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    };
    let path_and_query = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let uri = Uri::builder()
        .scheme(scheme.as_str())
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|_| invalid())?;

    let mut req = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Full::new(body))
        .map_err(|_| invalid())?;

    let headers = req.headers_mut();
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || name == &HOST {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Some(peer) = peer {
        let client_ip = peer.ip().to_string();
        let forwarded_for = match headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) => format!("{prior}, {client_ip}"),
            None => client_ip.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("for={client_ip}")) {
            headers.insert("forwarded", value);
        }
    }
    Ok(req)
}

// single joining slash between a target base path and the request path
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn replace_path(uri: &Uri, new_path: &str) -> Result<Uri, http::Error> {
    let path_and_query = if new_path.contains('?') {
        new_path.to_string()
    } else if let Some(query) = uri.query() {
        format!("{new_path}?{query}")
    } else {
        new_path.to_string()
    };
    Uri::builder().path_and_query(path_and_query).build()
}
