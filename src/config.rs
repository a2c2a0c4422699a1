//! Configuration management

use std::{
    collections::{HashMap, HashSet},
    env,
    path::Path,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Paths support ~ expansion. Loaded in order; missing files are skipped.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Credential validation configuration
    pub auth: AuthConfig,
    /// Per-client admission control
    pub rate_limit: RateLimitConfig,
    /// Route table: logical service name -> backend base address
    pub services: HashMap<String, String>,
    /// Gateway routes forwarded to backend services
    pub routes: Vec<RouteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: vec![".env".to_string()],
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            services: default_services(),
            routes: default_routes(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or holds values the gateway cannot run with.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // STOREFRONT_GATEWAY_SERVER__PORT=9000 -> server.port
        figment = figment.merge(Env::prefixed("STOREFRONT_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in service addresses
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .expect("static env var pattern is valid");

        for address in self.services.values_mut() {
            *address = expand_string(&re, address);
        }
    }

    /// Reject values that would make admission control or routing meaningless
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value found.
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut protection: HashMap<String, bool> = HashMap::new();
        let mut captures: HashMap<String, &str> = HashMap::new();
        for route in &self.routes {
            route.validate()?;

            // Capture names must agree wherever two routes share a prefix
            let mut prefix = String::new();
            for segment in route.path.split('/').skip(1) {
                prefix.push('/');
                if let Some(name) = segment.strip_prefix(':') {
                    match captures.get(prefix.as_str()) {
                        Some(&existing) if existing != name => {
                            return Err(Error::Config(format!(
                                "Route {} captures :{name} where another route captures :{existing}",
                                route.path
                            )));
                        }
                        Some(_) => {}
                        None => {
                            captures.insert(prefix.clone(), name);
                        }
                    }
                    prefix.push(':');
                } else {
                    prefix.push_str(segment);
                }
            }

            let shape = route_shape(&route.path);
            if shape == "/health" {
                return Err(Error::Config(
                    "/health is served by the gateway itself".to_string(),
                ));
            }

            let key = (route.method.to_ascii_uppercase(), shape.clone());
            if !seen.insert(key) {
                return Err(Error::Config(format!(
                    "Duplicate route: {} {}",
                    route.method, route.path
                )));
            }
            // One path cannot be public for one method and protected for another
            if let Some(&protected) = protection.get(&shape)
                && protected != route.protected
            {
                return Err(Error::Config(format!(
                    "Route {} mixes public and protected methods",
                    route.path
                )));
            }
            protection.insert(shape, route.protected);
        }
        Ok(())
    }
}

/// Route path with every capture name replaced by a bare `:`
fn route_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| if segment.starts_with(':') { ":" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Upstream request timeout; exceeding it yields 504
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum inbound request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Credential validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC signing secret. Supports a literal value or `env:VAR_NAME`.
    pub jwt_secret: String,
    /// Clock leeway applied to `exp`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "env:JWT_SECRET_KEY".to_string(),
            leeway: Duration::ZERO,
        }
    }
}

impl AuthConfig {
    /// Resolve the signing secret (expand `env:` references)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the referenced variable is unset or the
    /// resolved secret is empty.
    pub fn resolve_secret(&self) -> Result<Vec<u8>> {
        let secret = if let Some(var_name) = self.jwt_secret.strip_prefix("env:") {
            env::var(var_name)
                .map_err(|_| Error::Config(format!("{var_name} not found in environment")))?
        } else {
            self.jwt_secret.clone()
        };

        if secret.is_empty() {
            return Err(Error::Config("JWT signing secret is empty".to_string()));
        }
        Ok(secret.into_bytes())
    }
}

/// Token-bucket admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable per-client admission control
    pub enabled: bool,
    /// Bucket capacity (maximum burst)
    pub capacity: f64,
    /// Refill rate in tokens per second
    pub refill_rate: f64,
    /// How often idle buckets are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Buckets untouched for longer than this are evicted by the sweep
    #[serde(with = "humantime_serde")]
    pub idle_threshold: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 5.0,
            refill_rate: 5.0 / 60.0, // 5 tokens per minute
            sweep_interval: Duration::from_secs(10 * 60),
            idle_threshold: Duration::from_secs(30 * 60),
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<()> {
        if !(self.capacity.is_finite() && self.capacity >= 1.0) {
            return Err(Error::Config(format!(
                "rate_limit.capacity must be at least 1, got {}",
                self.capacity
            )));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(Error::Config(format!(
                "rate_limit.refill_rate must be positive, got {}",
                self.refill_rate
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config(
                "rate_limit.sweep_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A gateway route forwarded to a backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE)
    pub method: String,
    /// Public path; `:name` segments capture path parameters
    pub path: String,
    /// Logical service name resolved through `services`
    pub service: String,
    /// Upstream path template; `:name` segments are substituted
    pub upstream: String,
    /// Require a bearer credential and apply admission control
    #[serde(default)]
    pub protected: bool,
}

/// Methods a route may be registered for
pub const SUPPORTED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

impl RouteConfig {
    /// Shorthand used by the default route list and tests
    #[must_use]
    pub fn new(method: &str, path: &str, service: &str, upstream: &str, protected: bool) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            service: service.to_string(),
            upstream: upstream.to_string(),
            protected,
        }
    }

    fn validate(&self) -> Result<()> {
        if !SUPPORTED_METHODS.contains(&self.method.to_ascii_uppercase().as_str()) {
            return Err(Error::Config(format!(
                "Unsupported method '{}' for route {}",
                self.method, self.path
            )));
        }
        if !self.path.starts_with('/') || !self.upstream.starts_with('/') {
            return Err(Error::Config(format!(
                "Route paths must start with '/': {} -> {}",
                self.path, self.upstream
            )));
        }
        Ok(())
    }
}

fn default_services() -> HashMap<String, String> {
    [
        ("auth", "http://localhost:8081"),
        ("products", "http://localhost:8082"),
        ("cart", "http://localhost:8083"),
        ("orders", "http://localhost:8084"),
    ]
    .into_iter()
    .map(|(name, url)| (name.to_string(), url.to_string()))
    .collect()
}

/// The storefront's route registry
#[must_use]
pub fn default_routes() -> Vec<RouteConfig> {
    vec![
        // Public
        RouteConfig::new("POST", "/api/register", "auth", "/register", false),
        RouteConfig::new("POST", "/api/login", "auth", "/login", false),
        RouteConfig::new("GET", "/api/products", "products", "/products", false),
        RouteConfig::new("GET", "/api/products/:id", "products", "/products/:id", false),
        // Products
        RouteConfig::new("POST", "/api/add-product", "products", "/add-product", true),
        RouteConfig::new("PUT", "/api/update-product/:id", "products", "/update-product/:id", true),
        RouteConfig::new("DELETE", "/api/delete-product/:id", "products", "/delete-product/:id", true),
        // Cart
        RouteConfig::new("POST", "/api/cart/:productId", "cart", "/cart/:productId", true),
        RouteConfig::new("GET", "/api/cart", "cart", "/cart", true),
        RouteConfig::new("DELETE", "/api/cart/:productId", "cart", "/cart/:productId", true),
        // Orders
        RouteConfig::new("POST", "/api/create-order", "orders", "/create-order", true),
        RouteConfig::new("POST", "/api/orders/send-otp", "orders", "/orders/send-otp", true),
        RouteConfig::new("POST", "/api/orders/verify-otp", "orders", "/orders/verify-otp", true),
        RouteConfig::new("POST", "/api/orders/payment", "orders", "/orders/payment", true),
        RouteConfig::new("PUT", "/api/orders/:orderId/status", "orders", "/orders/:orderId/status", true),
        RouteConfig::new("GET", "/api/orders", "orders", "/orders", true),
    ]
}

/// Humantime-style serde adapter for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "250ms", "30s", "10m", "1h" or bare seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
