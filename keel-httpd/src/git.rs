//! Git smart-HTTP endpoints.
//!
//! `GET /:repo/info/refs` advertises references; `POST /:repo/:service`
//! runs the service. Fetches go straight through the git driver; pushes
//! go through the push pipeline, which reverts the repository and
//! reports errors on the side-band.

use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, RawQuery, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use flate2::read::GzDecoder;

use keel::git::serve::{self, Service};
use keel::storage::RepoName;

use crate::error::Error;
use crate::Context;

pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/:repo/info/refs", get(info_refs))
        .route("/:repo/:service", post(service))
        .with_state(ctx)
}

/// Standard headers for smart-HTTP responses.
fn headers(content_type: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    headers.insert(
        HeaderName::from_static("content-type"),
        HeaderValue::from_str(content_type).expect("content type is a valid header value"),
    );
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
    headers.insert(
        HeaderName::from_static("pragma"),
        HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("connection"),
        HeaderValue::from_static("Keep-Alive"),
    );
    headers
}

fn repo_name(param: &str) -> Result<RepoName, Error> {
    let name = param.strip_suffix(".git").unwrap_or(param);

    Ok(RepoName::from_str(name)?)
}

/// The `Git-Protocol` header value, forwarded to the subprocess
/// environment.
fn protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
}

/// Decode the request body, honoring `Content-Encoding: gzip`.
fn body_bytes(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>, Error> {
    let gzip = matches!(
        headers.get("Content-Encoding").map(|h| h.to_str()),
        Some(Ok("gzip"))
    );
    if !gzip {
        return Ok(body.to_vec());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(body.as_ref()).read_to_end(&mut decoded)?;

    Ok(decoded)
}

async fn info_refs(
    State(ctx): State<Arc<Context>>,
    AxumPath(repo): AxumPath<String>,
    headers_in: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<impl IntoResponse, Error> {
    let query = query.unwrap_or_default();
    let service = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("service="))
        .ok_or(Error::BadRequest("missing service parameter"))?;
    let service =
        Service::from_str(service).map_err(|_| Error::UnknownService(service.to_owned()))?;
    let name = repo_name(&repo)?;
    let repository = ctx.storage.repository(&name)?;
    let protocol = protocol(&headers_in);
    let v2 = protocol.as_deref() == Some("version=2");

    let advertisement = serve::advertise(&repository, service, protocol.as_deref())?;
    let mut body = Vec::with_capacity(advertisement.len() + 64);

    // Protocol v2 advertises capabilities without the service prelude.
    if !v2 {
        keel::pktline::service_prelude(&mut body, service.name())?;
    }
    body.extend_from_slice(&advertisement);

    Ok((
        StatusCode::OK,
        headers(&format!(
            "application/x-{}-advertisement",
            service.name()
        )),
        body,
    ))
}

async fn service(
    State(ctx): State<Arc<Context>>,
    AxumPath((repo, service)): AxumPath<(String, String)>,
    headers_in: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, Error> {
    let service =
        Service::from_str(&service).map_err(|_| Error::UnknownService(service.clone()))?;
    let name = repo_name(&repo)?;
    let protocol = protocol(&headers_in);
    let body = body_bytes(&headers_in, body)?;
    let mut out = Vec::new();

    match service {
        Service::UploadPack => {
            let repository = ctx.storage.repository(&name)?;

            serve::serve(
                &repository,
                service,
                protocol.as_deref(),
                &mut body.as_slice(),
                &mut out,
            )?;
        }
        Service::ReceivePack => {
            ctx.handler
                .handle(&name, protocol.as_deref(), &mut body.as_slice(), &mut out)?;
        }
    }

    Ok((
        StatusCode::OK,
        headers(&format!("application/x-{}-result", service.name())),
        out,
    ))
}
