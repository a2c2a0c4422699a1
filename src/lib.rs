//! Storefront Gateway Library
//!
//! Single entry point in front of the storefront's auth, catalog, cart and
//! order services.
//!
//! # Features
//!
//! - **Credential validation**: HMAC-signed JWT bearer tokens become trusted
//!   `X-User-ID` / `X-User-Email` headers; caller-supplied copies are stripped
//! - **Admission control**: per-client token buckets with lazy refill and a
//!   periodic idle sweep
//! - **Reverse proxy**: path template expansion and transparent relay of
//!   status, headers and body
//! - **Production Ready**: request ids, tracing, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;

pub use error::{Error, GatewayError, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
