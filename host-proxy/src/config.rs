//! Configuration for host-proxy

use axum::http::uri::{Authority, InvalidUri};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ProxyError, Result};

/// Environment variable overriding the certificate cache directory
pub const CERT_DIR_ENV: &str = "PROXY_CERT_DIR";

/// Main proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Listener addresses
    #[serde(default)]
    pub server: ServerConfig,
    /// Certificate manager settings
    pub tls: TlsConfig,
    /// Host -> canonical host
    #[serde(default)]
    pub redirects: HashMap<String, String>,
    /// Host -> backend `host:port`
    #[serde(default)]
    pub backends: HashMap<String, String>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for HTTPS
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// Listen address for the plaintext redirector
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Contact email handed to the certificate authority
    pub email: String,
    /// Directory holding cached certificates
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Host names certificates may be obtained for
    pub hosts: Vec<String>,
    /// Where certificates come from
    #[serde(default)]
    pub issuer: Issuer,
    /// ACME directory, Let's Encrypt production unless set
    #[serde(default = "default_directory_url")]
    pub directory_url: String,
}

/// Certificate source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Issuer {
    /// ACME certificate authority, validated over HTTP-01
    #[default]
    Acme,
    /// Locally generated self-signed certificates, for development
    SelfSigned,
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cert")
}

fn default_directory_url() -> String {
    instant_acme::LetsEncrypt::Production.url().to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            https_addr: default_https_addr(),
            http_addr: default_http_addr(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(CERT_DIR_ENV) {
            self.tls.cache_dir = PathBuf::from(dir);
        }
    }

    /// Validate configuration
    ///
    /// A host present in both `redirects` and `backends` is accepted: the
    /// redirect always wins and the backend entry is never consulted.
    pub fn validate(&self) -> Result<()> {
        if self.tls.hosts.is_empty() {
            return Err(ProxyError::Config("No TLS hosts configured".to_string()));
        }
        if self.tls.email.trim().is_empty() {
            return Err(ProxyError::Config("No contact email configured".to_string()));
        }
        if self.tls.issuer == Issuer::Acme && !self.tls.directory_url.starts_with("https://") {
            return Err(ProxyError::Config(format!(
                "ACME directory must be an https URL: '{}'",
                self.tls.directory_url
            )));
        }

        for (host, target) in &self.redirects {
            if target.is_empty() {
                return Err(ProxyError::Config(format!(
                    "Empty redirect target for '{}'",
                    host
                )));
            }
        }

        for (host, backend) in &self.backends {
            validate_backend_addr(backend).map_err(|e| {
                ProxyError::Config(format!("Invalid backend '{}' for '{}': {}", backend, host, e))
            })?;
        }

        Ok(())
    }
}

/// Backends are plain `host:port` pairs, no scheme and no path.
fn validate_backend_addr(addr: &str) -> std::result::Result<(), String> {
    if addr.contains('/') {
        return Err("expected host:port".to_string());
    }
    let authority: Authority = addr.parse().map_err(|e: InvalidUri| e.to_string())?;
    if authority.host().is_empty() {
        return Err("missing host".to_string());
    }
    if authority.port_u16().is_none() {
        return Err("missing port".to_string());
    }
    Ok(())
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let redirects = HashMap::from([("my.domain".to_string(), "www.my.domain".to_string())]);
        let backends = HashMap::from([
            ("www.my.domain".to_string(), "localhost:12345".to_string()),
            ("xyz.my.domain".to_string(), "localhost:22345".to_string()),
        ]);

        Self {
            server: ServerConfig::default(),
            tls: TlsConfig {
                email: "my@email.com".to_string(),
                cache_dir: default_cache_dir(),
                hosts: vec![
                    "my.domain".to_string(),
                    "www.my.domain".to_string(),
                    "xyz.my.domain".to_string(),
                ],
                issuer: Issuer::Acme,
                directory_url: default_directory_url(),
            },
            redirects,
            backends,
        }
    }
}
