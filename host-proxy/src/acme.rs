//! Certificate management
//!
//! Certificates are obtained from an ACME certificate authority (HTTP-01
//! validation, answered by the plaintext listener) or, in development,
//! generated locally. They are cached on disk per host and held in memory for
//! the TLS handshake. Only names on the host allow-list are ever served.
//!
//! Issuance runs in the background task started by
//! [`CertManager::start_renewal_task`]; the handshake path only reads memory.

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{Issuer, TlsConfig};
use crate::error::{ProxyError, Result};

/// Certificates expiring within this many days are reissued
const RENEW_BEFORE_DAYS: i64 = 30;

/// Interval of the background renewal check
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Order status polls before giving up on validation
const MAX_ORDER_POLLS: u32 = 30;

/// Account credentials file inside the cache directory
const ACCOUNT_FILE: &str = "acme_account.json";

/// Exact-match allow-list of server names
#[derive(Debug, Clone)]
pub struct HostPolicy {
    allowed: HashSet<String>,
}

impl HostPolicy {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn check(&self, host: &str) -> Result<()> {
        if self.allowed.contains(host) {
            Ok(())
        } else {
            Err(ProxyError::HostNotAllowed(host.to_string()))
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

/// Pending HTTP-01 key authorizations, by token
///
/// Shared between the certificate manager, which fills it while an order is
/// being validated, and the plaintext listener, which answers the
/// certificate authority from it.
#[derive(Debug, Clone, Default)]
pub struct Http01Challenges {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn insert(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), key_authorization.into());
    }

    pub fn remove(&self, token: &str) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }
}

/// Certificate storage paths
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    /// Directory holding the domain's files
    pub cert_dir: PathBuf,
    /// Certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Private key (PEM, PKCS#8)
    pub key_path: PathBuf,
}

impl CertificatePaths {
    /// Create certificate paths for a domain
    pub fn for_domain(base_dir: &Path, domain: &str) -> Self {
        let cert_dir = base_dir.join(domain);
        Self {
            cert_path: cert_dir.join("cert.pem"),
            key_path: cert_dir.join("key.pem"),
            cert_dir,
        }
    }

    /// Check if certificate files exist
    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }
}

/// PEM-encoded certificate chain and key
#[derive(Debug, Clone)]
pub struct CertificatePem {
    pub cert_pem: String,
    pub key_pem: String,
}

/// On-disk certificate cache, one directory per domain
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn paths(&self, domain: &str) -> CertificatePaths {
        CertificatePaths::for_domain(&self.dir, domain)
    }

    pub fn account_path(&self) -> PathBuf {
        self.dir.join(ACCOUNT_FILE)
    }

    /// Read a cached certificate, `None` when the domain has no entry
    pub async fn get(&self, domain: &str) -> Result<Option<CertificatePem>> {
        let paths = self.paths(domain);
        if !paths.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&paths.cert_path)
            .await
            .map_err(|e| ProxyError::Tls(format!("Failed to read certificate: {}", e)))?;
        let key_pem = fs::read_to_string(&paths.key_path)
            .await
            .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?;

        Ok(Some(CertificatePem { cert_pem, key_pem }))
    }

    /// Store a certificate. Each file is replaced atomically, so a reader
    /// never sees a partial write.
    pub async fn put(&self, domain: &str, pem: &CertificatePem) -> Result<()> {
        let paths = self.paths(domain);
        fs::create_dir_all(&paths.cert_dir)
            .await
            .map_err(|e| ProxyError::Tls(format!("Failed to create cert directory: {}", e)))?;

        write_atomic(&paths.key_path, pem.key_pem.as_bytes())
            .await
            .map_err(|e| ProxyError::Tls(format!("Failed to write private key: {}", e)))?;
        write_atomic(&paths.cert_path, pem.cert_pem.as_bytes())
            .await
            .map_err(|e| ProxyError::Tls(format!("Failed to write certificate: {}", e)))?;

        debug!("Cached certificate at {:?}", paths.cert_path);
        Ok(())
    }
}

/// Write to a sibling temporary file, then rename it over `path`
async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}

/// Certificate manager for the allowed hosts
pub struct CertManager {
    /// Contact email for the ACME account
    email: String,
    issuer: Issuer,
    directory_url: String,
    policy: HostPolicy,
    cache: DirCache,
    challenges: Http01Challenges,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    account: Mutex<Option<Account>>,
    /// Held while loading or issuing, one host at a time
    issuing: Mutex<()>,
}

impl CertManager {
    /// Create a manager, creating the cache directory if needed
    pub fn new(config: &TlsConfig, challenges: Http01Challenges) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir).map_err(|e| {
            ProxyError::Tls(format!(
                "Failed to create cache directory {:?}: {}",
                config.cache_dir, e
            ))
        })?;

        Ok(Self {
            email: config.email.clone(),
            issuer: config.issuer,
            directory_url: config.directory_url.clone(),
            policy: HostPolicy::new(config.hosts.iter().cloned()),
            cache: DirCache::new(&config.cache_dir),
            challenges,
            certs: RwLock::new(HashMap::new()),
            account: Mutex::new(None),
            issuing: Mutex::new(()),
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Certificate already loaded in memory for `server_name`
    pub fn loaded(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.certs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_name)
            .cloned()
    }

    /// Certificate for `server_name`: memory, then disk cache, then a fresh
    /// issuance written back to the cache
    pub async fn certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        self.policy.check(server_name)?;

        if let Some(key) = self.loaded(server_name) {
            return Ok(key);
        }

        let _issuing = self.issuing.lock().await;
        if let Some(key) = self.loaded(server_name) {
            return Ok(key);
        }
        self.load_or_issue(server_name).await
    }

    /// Load every allowed host's certificate, issuing missing ones and
    /// reissuing those close to expiry
    pub async fn renew_expiring(&self) {
        for host in self.policy.hosts() {
            let _issuing = self.issuing.lock().await;
            if let Err(e) = self.load_or_issue(host).await {
                error!("Certificate renewal failed for {}: {}", host, e);
            }
        }
    }

    /// Start the background task provisioning certificates now and then
    /// renewing them periodically
    pub fn start_renewal_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RENEWAL_INTERVAL);
            loop {
                interval.tick().await;
                self.renew_expiring().await;
            }
        });
    }

    /// Must be called with `issuing` held
    async fn load_or_issue(&self, domain: &str) -> Result<Arc<CertifiedKey>> {
        let pem = match self.cache.get(domain).await? {
            Some(pem) if !needs_renewal(&pem.cert_pem) => {
                debug!("Loaded cached certificate for {}", domain);
                pem
            }
            _ => self.issue(domain).await?,
        };

        let key = Arc::new(certified_key(&pem)?);
        self.certs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain.to_string(), key.clone());
        Ok(key)
    }

    /// Issue a certificate for `domain` and store it in the cache
    async fn issue(&self, domain: &str) -> Result<CertificatePem> {
        let pem = match self.issuer {
            Issuer::Acme => {
                info!("Ordering certificate for {} from {}", domain, self.directory_url);
                self.order(domain).await?
            }
            Issuer::SelfSigned => {
                info!("Generating self-signed certificate for {}", domain);
                self_signed(domain)?
            }
        };

        self.cache.put(domain, &pem).await?;
        Ok(pem)
    }

    /// ACME account, loaded from the cache or registered with `email` as
    /// contact
    async fn account(&self) -> Result<Account> {
        let mut slot = self.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok(account.clone());
        }

        let path = self.cache.account_path();
        let account = match fs::read_to_string(&path).await {
            Ok(json) => {
                debug!("Loading ACME account from {:?}", path);
                let credentials: AccountCredentials = serde_json::from_str(&json)
                    .map_err(|e| ProxyError::Tls(format!("Invalid ACME account file: {}", e)))?;
                Account::builder()?.from_credentials(credentials).await?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Creating ACME account for {}", self.email);
                let contact = format!("mailto:{}", self.email);
                let (account, credentials) = Account::builder()?
                    .create(
                        &NewAccount {
                            contact: &[&contact],
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        self.directory_url.clone(),
                        None,
                    )
                    .await?;

                let json = serde_json::to_string_pretty(&credentials)
                    .map_err(|e| ProxyError::Tls(format!("Failed to encode ACME account: {}", e)))?;
                write_atomic(&path, json.as_bytes()).await?;
                account
            }
            Err(e) => return Err(e.into()),
        };

        *slot = Some(account.clone());
        Ok(account)
    }

    /// Run an ACME order for `domain` through HTTP-01 validation
    async fn order(&self, domain: &str) -> Result<CertificatePem> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut tokens = Vec::new();
        let validated = self.validate(&mut order, &mut tokens).await;
        for token in &tokens {
            self.challenges.remove(token);
        }
        validated?;

        let key_pem = order.finalize().await?;
        let cert_pem = loop {
            match order.certificate().await? {
                Some(cert_pem) => break cert_pem,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        info!("Obtained certificate for {}", domain);
        Ok(CertificatePem { cert_pem, key_pem })
    }

    /// Publish the HTTP-01 answers of every pending authorization and wait
    /// for the order to become ready. Published tokens are pushed to
    /// `tokens` so the caller can withdraw them.
    async fn validate(&self, order: &mut Order, tokens: &mut Vec<String>) -> Result<()> {
        {
            let mut authorizations = order.authorizations();
            while let Some(authz) = authorizations.next().await {
                let mut authz = authz?;
                match &authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(ProxyError::Tls(format!(
                            "Unexpected authorization status: {:?}",
                            status
                        )))
                    }
                }

                let mut challenge = authz
                    .challenge(ChallengeType::Http01)
                    .ok_or_else(|| ProxyError::Tls("No HTTP-01 challenge offered".to_string()))?;

                let token = challenge.token.clone();
                self.challenges
                    .insert(token.clone(), challenge.key_authorization().as_str());
                tokens.push(token);

                challenge.set_ready().await?;
            }
        }

        let mut polls = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            order.refresh().await?;

            match &order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(ProxyError::Tls(format!(
                        "Order validation failed: {:?}",
                        order.state().error
                    )))
                }
                status => debug!("Order status: {:?}", status),
            }

            polls += 1;
            if polls >= MAX_ORDER_POLLS {
                return Err(ProxyError::Tls("Order validation timed out".to_string()));
            }
        }
    }
}

impl ResolvesServerCert for CertManager {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            debug!("TLS handshake without SNI");
            return None;
        };

        if let Err(e) = self.policy.check(server_name) {
            warn!("Refusing handshake: {}", e);
            return None;
        }

        let key = self.loaded(server_name);
        if key.is_none() {
            warn!("No certificate for {} yet", server_name);
        }
        key
    }
}

/// Self-signed certificate for `domain`
fn self_signed(domain: &str) -> Result<CertificatePem> {
    let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()])
        .map_err(|e| ProxyError::Tls(format!("Failed to generate certificate: {}", e)))?;
    Ok(CertificatePem {
        cert_pem: cert.cert.pem(),
        key_pem: cert.key_pair.serialize_pem(),
    })
}

/// Decode PEM material into a rustls certified key
fn certified_key(pem: &CertificatePem) -> Result<CertifiedKey> {
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut pem.cert_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificates: {}", e)))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
        return Err(ProxyError::Tls("No certificates found".to_string()));
    }

    let keys = rustls_pemfile::pkcs8_private_keys(&mut pem.key_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("Failed to read PKCS8 keys: {}", e)))?;
    let key = keys
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| ProxyError::Tls("No private key found".to_string()))?;

    let signing_key = sign::any_supported_type(&key)
        .map_err(|e| ProxyError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Whether the first certificate in `cert_pem` expires within
/// [`RENEW_BEFORE_DAYS`]. Unparseable certificates count as expiring.
fn needs_renewal(cert_pem: &str) -> bool {
    let der = match rustls_pemfile::certs(&mut cert_pem.as_bytes()) {
        Ok(certs) => match certs.into_iter().next() {
            Some(der) => der,
            None => return true,
        },
        Err(_) => return true,
    };

    match x509_parser::parse_x509_certificate(&der) {
        Ok((_, cert)) => match cert.validity().time_to_expiration() {
            Some(remaining) => remaining.whole_days() < RENEW_BEFORE_DAYS,
            None => true,
        },
        Err(e) => {
            warn!("Failed to parse cached certificate: {}", e);
            true
        }
    }
}
