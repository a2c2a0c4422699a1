//! Request forwarder
//!
//! Builds the upstream request for a matched gateway route and relays the
//! backend's response unchanged:
//!
//! - `:name` segments of the upstream template are replaced with the values
//!   captured from the gateway route.
//! - Caller-supplied trusted identity headers are always removed; verified
//!   identity is injected only when the route authenticated the caller.
//! - `X-Forwarded-Host` carries the original `Host`.
//! - Status, headers and body of the upstream response are relayed as-is
//!   (hop-by-hop headers excepted). Bodies are streamed, never interpreted.
//!
//! Failures never retry: unknown service is a 502 without any upstream call,
//! connection errors are 502, timeouts are 504.

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::FromRequest,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header, uri::Authority},
    response::Response,
};
use reqwest::Client;
use tracing::{debug, error, warn};
use url::Url;

use super::auth::IdentityClaims;
use super::routes::RouteTable;
use crate::error::GatewayError;
use crate::Result;

/// Trusted identity header: subject id
pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
/// Trusted identity header: email
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
/// Original `Host` of the inbound request
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers only the gateway may set
pub const TRUSTED_IDENTITY_HEADERS: [HeaderName; 2] = [X_USER_ID, X_USER_EMAIL];

/// Connection-scoped headers that must not cross the proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Reverse proxy to backend services
#[derive(Debug)]
pub struct Forwarder {
    client: Client,
    routes: RouteTable,
    max_body_size: usize,
}

impl Forwarder {
    /// Create a forwarder with a pooled HTTP client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(routes: RouteTable, timeout: Duration, max_body_size: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            // Redirects belong to the caller
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            routes,
            max_body_size,
        })
    }

    /// Largest inbound body relayed upstream
    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Route table consulted for every forward
    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Forward `request` to `service` at `template`, relaying the response
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] when the service is unknown, the inbound
    /// request cannot be relayed, or the backend cannot be reached in time.
    pub async fn forward(
        &self,
        service: &str,
        template: &str,
        params: &[(&str, &str)],
        request: Request<Body>,
        identity: Option<&IdentityClaims>,
    ) -> std::result::Result<Response, GatewayError> {
        let Some(base) = self.routes.resolve(service) else {
            error!(service, "Service not found in route table");
            return Err(GatewayError::RouteNotFound(service.to_string()));
        };

        let url = upstream_url(base, template, params, request.uri().query())?;

        if let Some(length) = content_length(request.headers())
            && length > self.max_body_size
        {
            return Err(GatewayError::PayloadTooLarge);
        }
        let method = request.method().clone();
        let headers = upstream_headers(request.headers(), request.uri().authority(), identity);

        // Streamed bodies are capped by the router's `DefaultBodyLimit`
        let body = Bytes::from_request(request, &()).await.map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                GatewayError::PayloadTooLarge
            } else {
                GatewayError::BadRequest(format!(
                    "unreadable request body: {}",
                    rejection.body_text()
                ))
            }
        })?;

        debug!(service, method = %method, upstream = %url, "Forwarding request");

        let upstream = self
            .client
            .request(method, url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    warn!(service, upstream = %url, error = %e, "Upstream timed out");
                    GatewayError::UpstreamTimeout(e.to_string())
                } else {
                    error!(service, upstream = %url, error = %e, "Upstream unreachable");
                    GatewayError::UpstreamUnreachable(e.to_string())
                }
            })?;

        Ok(relay(upstream))
    }
}

/// Substitute `:name` segments of `template` with captured `params`.
///
/// Every occurrence is replaced; placeholders without a captured value are
/// left verbatim.
#[must_use]
pub fn expand_path(template: &str, params: &[(&str, &str)]) -> String {
    template
        .split('/')
        .map(|segment| substitute(segment, params))
        .collect::<Vec<_>>()
        .join("/")
}

fn substitute<'a>(segment: &'a str, params: &[(&str, &'a str)]) -> &'a str {
    segment
        .strip_prefix(':')
        .and_then(|name| params.iter().find(|(key, _)| *key == name))
        .map_or(segment, |&(_, value)| value)
}

/// Join `base` with the expanded `template` and the inbound query string.
/// Substituted values are percent-encoded as single path segments.
fn upstream_url(
    base: &str,
    template: &str,
    params: &[(&str, &str)],
    query: Option<&str>,
) -> std::result::Result<Url, GatewayError> {
    let mut url = Url::parse(base)
        .map_err(|e| GatewayError::UpstreamUnreachable(format!("invalid base {base}: {e}")))?;

    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|()| GatewayError::UpstreamUnreachable(format!("invalid base {base}")))?;
        segments.pop_if_empty();
        segments.extend(
            template
                .trim_start_matches('/')
                .split('/')
                .map(|segment| substitute(segment, params)),
        );
    }

    url.set_query(query);
    Ok(url)
}

/// Headers for the upstream request.
///
/// Trusted identity headers from the caller are dropped and replaced (never
/// merged) with values from `identity` when present. `X-Forwarded-Host` comes
/// from `Host`, or from the request authority when there is none (HTTP/2).
#[must_use]
pub fn upstream_headers(
    inbound: &HeaderMap,
    authority: Option<&Authority>,
    identity: Option<&IdentityClaims>,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 3);

    for (name, value) in inbound {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || TRUSTED_IDENTITY_HEADERS.contains(name)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let forwarded_host = inbound.get(header::HOST).cloned().or_else(|| {
        authority.and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    });
    if let Some(host) = forwarded_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    if let Some(claims) = identity {
        headers.insert(X_USER_ID, HeaderValue::from(claims.subject_id));
        match HeaderValue::from_str(&claims.email) {
            Ok(email) => {
                headers.insert(X_USER_EMAIL, email);
            }
            Err(e) => warn!(client = claims.subject_id, error = %e, "Email claim is not a valid header value"),
        }
    }

    headers
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Turn the upstream response into ours without touching the body
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::with_capacity(upstream.headers().len());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
