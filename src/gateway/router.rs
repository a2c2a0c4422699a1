//! HTTP router and handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, RawPathParams, State},
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter, get},
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::auth::{CredentialValidator, IdentityClaims, auth_middleware};
use super::proxy::Forwarder;
use super::rate_limit::{AdmissionController, rate_limit_middleware};
use crate::config::RouteConfig;

/// Shared application state
#[derive(Debug)]
pub struct AppState {
    /// Bearer credential validator
    pub validator: CredentialValidator,
    /// Per-client admission control
    pub admission: Arc<AdmissionController>,
    /// Reverse proxy to backend services
    pub forwarder: Forwarder,
}

/// Create the router for `routes`.
///
/// Protected routes run credential validation, then admission control, then
/// forwarding. Public routes are forwarded directly.
pub fn create_router(state: Arc<AppState>, routes: &[RouteConfig]) -> Router {
    let (protected, public): (Vec<_>, Vec<_>) = routes.iter().partition(|r| r.protected);

    // route_layer: layers run outermost-last, so auth wraps admission
    let protected = method_routers(&protected)
        .into_iter()
        .fold(Router::new(), |router, (path, method_router)| {
            router.route(&path, method_router)
        })
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    let public = method_routers(&public)
        .into_iter()
        .fold(Router::new(), |router, (path, method_router)| {
            router.route(&path, method_router)
        });

    Router::new()
        .route("/health", get(health_handler))
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.forwarder.max_body_size()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(state)
}

/// Group routes by path so that one path may serve several methods
fn method_routers(routes: &[&RouteConfig]) -> BTreeMap<String, MethodRouter<Arc<AppState>>> {
    let mut grouped: BTreeMap<String, MethodRouter<Arc<AppState>>> = BTreeMap::new();

    for route in routes {
        let path = axum_path(&route.path);
        let filter = method_filter(&route.method);
        let route = Arc::new((*route).clone());
        let handler =
            move |State(state): State<Arc<AppState>>, params: RawPathParams, request: Request<Body>| {
                let route = Arc::clone(&route);
                async move { proxy_handler(&state, &route, &params, request).await }
            };

        let method_router = match grouped.remove(&path) {
            Some(existing) => existing.on(filter, handler),
            None => axum::routing::on(filter, handler),
        };
        grouped.insert(path, method_router);
    }

    grouped
}

/// Convert `:name` segments to axum's `{name}` capture syntax
#[must_use]
pub fn axum_path(path: &str) -> String {
    path.split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) => format!("{{{name}}}"),
            None => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn method_filter(method: &str) -> MethodFilter {
    match method.to_ascii_uppercase().as_str() {
        "POST" => MethodFilter::POST,
        "PUT" => MethodFilter::PUT,
        "PATCH" => MethodFilter::PATCH,
        "DELETE" => MethodFilter::DELETE,
        "HEAD" => MethodFilter::HEAD,
        "OPTIONS" => MethodFilter::OPTIONS,
        // Config validation only admits the methods above and GET
        _ => MethodFilter::GET,
    }
}

/// Forward to `route.service` at `route.upstream`, carrying verified identity
async fn proxy_handler(
    state: &AppState,
    route: &RouteConfig,
    params: &RawPathParams,
    request: Request<Body>,
) -> Response {
    let params: Vec<(&str, &str)> = params.iter().collect();
    let identity = request.extensions().get::<IdentityClaims>().cloned();

    state
        .forwarder
        .forward(
            &route.service,
            &route.upstream,
            &params,
            request,
            identity.as_ref(),
        )
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
