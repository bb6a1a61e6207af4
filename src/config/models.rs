//! Configuration data structures for h2core.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! Once loaded, a [`ServerConfig`] is immutable and shared by `Arc` with every stream.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Media types offered during content negotiation, in server preference order.
pub const DEFAULT_SUPPORTED_MEDIA_TYPES: [&str; 5] = [
    "application/json",
    "application/xml",
    "text/plain",
    "text/event-stream",
    "message/http",
];

/// Only the identity coding is produced by the bundled responder.
pub const DEFAULT_SUPPORTED_ENCODINGS: [&str; 1] = ["identity"];

pub const DEFAULT_SUPPORTED_LANGUAGES: [&str; 2] = ["en-US", "en"];

fn default_listen_addr() -> String {
    "[::]:8443".to_string()
}

fn default_ipv6_only() -> bool {
    true
}

fn default_shutdown_timeout() -> String {
    "30s".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Refuse IPv4-mapped peers on an IPv6 listen address
    #[serde(default = "default_ipv6_only")]
    pub ipv6_only: bool,
    /// Name this server advertises; falls back to the negotiated SNI
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub forwarded: TrustPolicy,
    #[serde(default)]
    pub cors: CorsPolicy,
    #[serde(default)]
    pub negotiation: NegotiationPolicy,
    /// Answer TRACE requests with a message/http echo
    #[serde(default)]
    pub allow_trace: bool,
    /// Parsed by humantime, e.g. "30s", "2m"
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Shutdown drain timeout, falling back to 30 seconds on a malformed value
    /// (the validator reports malformed values before startup).
    pub fn shutdown_timeout(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Apply the process environment overrides for the trust and CORS policy.
    ///
    /// Recognised variables: `FORWARDED_REQUIRED`, `FORWARDED_SECRET`,
    /// `FORWARDED_SKIP_LIST`, `ALLOWED_ORIGINS`, `ALLOW_TRACE`. Boolean
    /// variables are true only when exactly `"true"`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(required) = lookup("FORWARDED_REQUIRED") {
            self.forwarded.required = required == "true";
        }
        if let Some(secret) = lookup("FORWARDED_SECRET") {
            self.forwarded.secret = Some(secret);
        }
        if let Some(skip_list) = lookup("FORWARDED_SKIP_LIST") {
            self.forwarded.skip_list = split_list(&skip_list);
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.cors.allowed_origins = split_list(&origins);
        }
        if let Some(trace) = lookup("ALLOW_TRACE") {
            self.allow_trace = trace == "true";
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ipv6_only: default_ipv6_only(),
            server_name: None,
            tls: TlsConfig::default(),
            forwarded: TrustPolicy::default(),
            cors: CorsPolicy::default(),
            negotiation: NegotiationPolicy::default(),
            allow_trace: false,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn ipv6_only(mut self, enabled: bool) -> Self {
        self.config.ipv6_only = enabled;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = Some(name.into());
        self
    }

    /// Directory holding `<name>-cert.pem` / `<name>-privkey.pem` pairs
    pub fn certificate_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.tls.certificate_dir = dir.into();
        self
    }

    /// Add an SNI credential identity
    pub fn credential(mut self, name: impl Into<String>) -> Self {
        self.config.tls.credentials.push(name.into());
        self
    }

    pub fn forwarded(mut self, policy: TrustPolicy) -> Self {
        self.config.forwarded = policy;
        self
    }

    pub fn allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.cors.allowed_origins.push(origin.into());
        self
    }

    pub fn negotiation(mut self, policy: NegotiationPolicy) -> Self {
        self.config.negotiation = policy;
        self
    }

    pub fn allow_trace(mut self, enabled: bool) -> Self {
        self.config.allow_trace = enabled;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.config.shutdown_timeout = timeout.into();
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        if self.config.listen_addr.is_empty() {
            return Err("listen_addr is required".to_string());
        }
        Ok(self.config)
    }
}

fn default_certificate_dir() -> String {
    "./certificates".to_string()
}

/// TLS credential table: one certificate/key pair per SNI identity.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_certificate_dir")]
    pub certificate_dir: String,
    /// SNI identities; each loads `<dir>/<name>-cert.pem` and `<dir>/<name>-privkey.pem`
    #[serde(default)]
    pub credentials: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            certificate_dir: default_certificate_dir(),
            credentials: Vec::new(),
        }
    }
}

/// `Forwarded` trust chain policy.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TrustPolicy {
    /// Reject requests without a usable `Forwarded` hop carrying `for`
    pub required: bool,
    /// Shared secret every selected hop must carry in its `secret` field
    pub secret: Option<String>,
    /// Hop identities (`for` values) dropped from the right of the chain
    pub skip_list: Vec<String>,
}

/// Cross-origin policy. An origin outside the list is denied by omission.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CorsPolicy {
    /// Exact origins, or `*` to reflect any origin
    pub allowed_origins: Vec<String>,
}

impl CorsPolicy {
    pub fn allows_any(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

/// Server-side support lists for content negotiation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NegotiationPolicy {
    pub media_types: Vec<String>,
    pub encodings: Vec<String>,
    pub languages: Vec<String>,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            media_types: DEFAULT_SUPPORTED_MEDIA_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            encodings: DEFAULT_SUPPORTED_ENCODINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            languages: DEFAULT_SUPPORTED_LANGUAGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
