//! Route table: logical service name -> backend base address

use std::collections::HashMap;

use tracing::warn;
use url::Url;

use crate::config::RouteConfig;
use crate::{Error, Result};

/// Read-only mapping from logical service name to backend base address
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    services: HashMap<String, String>,
}

impl RouteTable {
    /// Build the table, validating every address as an absolute http(s) URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an address that does not parse or uses
    /// another scheme.
    pub fn new(services: &HashMap<String, String>) -> Result<Self> {
        let services = services
            .iter()
            .map(|(name, address)| {
                let url = Url::parse(address).map_err(|e| {
                    Error::Config(format!("Invalid address for service '{name}': {address} ({e})"))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::Config(format!(
                        "Service '{name}' must use http or https: {address}"
                    )));
                }
                Ok((name.clone(), address.trim_end_matches('/').to_string()))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self { services })
    }

    /// Base address for `service`
    #[must_use]
    pub fn resolve(&self, service: &str) -> Option<&str> {
        self.services.get(service).map(String::as_str)
    }

    /// Registered services, sorted by name
    #[must_use]
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self
            .services
            .iter()
            .map(|(name, address)| (name.as_str(), address.as_str()))
            .collect();
        entries.sort_unstable();
        entries
    }

    /// Log routes whose service is missing; they answer 502 at request time
    pub fn warn_unresolved(&self, routes: &[RouteConfig]) {
        for route in routes {
            if self.resolve(&route.service).is_none() {
                warn!(
                    path = %route.path,
                    service = %route.service,
                    "Route references unknown service"
                );
            }
        }
    }
}
