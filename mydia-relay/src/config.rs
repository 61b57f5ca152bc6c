use core::fmt;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use camino::{Utf8Path, Utf8PathBuf};
use rand::RngCore as _;
use rand::rngs::OsRng;
use tap::prelude::*;

use crate::listener::ListenerUrls;

const DEFAULT_STALE_AFTER_SECS: u64 = 120;
const DEFAULT_CLAIM_TTL_SECS: u64 = 300;
const MAX_CLAIM_TTL_SECS: u64 = 86_400;
const DEFAULT_FORWARD_CEILING_SECS: u64 = 30;
const DEFAULT_TUNNEL_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
const DEFAULT_REDEEM_RATE_LIMIT: u32 = 30;

/// Secrets must carry at least this much material.
const MIN_SECRET_LEN: usize = 32;

#[derive(Clone)]
pub struct Tls {
    pub acceptor: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for Tls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tls").finish_non_exhaustive()
    }
}

impl Tls {
    fn init(certificate_file: &Utf8Path, private_key_file: &Utf8Path) -> anyhow::Result<Self> {
        let tls_server_config =
            crate::tls::build_server_config(certificate_file, private_key_file).context("failed to build TLS config")?;

        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_server_config));

        Ok(Self { acceptor })
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub hostname: String,
    pub listeners: Vec<ListenerUrls>,
    pub tls: Option<Tls>,
    pub log_file: Utf8PathBuf,
    pub log_directive: Option<String>,
    pub database_path: Utf8PathBuf,
    /// Process-wide secret for rendezvous namespace derivation; read-only
    /// after startup.
    pub master_pepper: Vec<u8>,
    /// Key for instance-token digests; rotating it invalidates every token.
    pub token_secret: Vec<u8>,
    pub stale_after: Duration,
    pub claim_ttl_default: Duration,
    pub claim_ttl_max: Duration,
    pub forward_ceiling: Duration,
    pub tunnel_idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub redeem_rate_limit: u32,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let hostname = conf_file.hostname.clone().unwrap_or_else(|| "localhost".to_owned());

        let mut listeners = Vec::new();

        for (idx, listener) in conf_file.listeners.iter().enumerate() {
            let listener_urls = crate::listener::to_listener_urls(listener, &hostname)
                .with_context(|| format!("listener at position {idx}"))?;
            listeners.push(listener_urls);
        }

        anyhow::ensure!(!listeners.is_empty(), "at least one listener is required");

        let has_https_listener = listeners.iter().any(|l| l.internal_url.scheme() == "https");

        let tls = match (&conf_file.tls_certificate_file, &conf_file.tls_private_key_file) {
            (Some(certificate_file), Some(private_key_file)) => {
                Tls::init(certificate_file, private_key_file)?.pipe(Some)
            }
            (None, None) => None,
            _ => anyhow::bail!("TlsCertificateFile and TlsPrivateKeyFile must be provided together"),
        };

        anyhow::ensure!(
            !has_https_listener || tls.is_some(),
            "an HTTPS listener requires a TLS certificate and private key"
        );

        let master_pepper = read_secret(
            "MYDIA_RELAY_MASTER_PEPPER",
            conf_file.master_pepper.as_deref(),
            "MasterPepper",
        )?;
        let token_secret = read_secret(
            "MYDIA_RELAY_TOKEN_SECRET",
            conf_file.token_secret.as_deref(),
            "TokenSecret",
        )?;

        let data_dir = get_data_dir();

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| data_dir.join("mydia-relay.log"));

        let database_path = conf_file
            .database_path
            .clone()
            .unwrap_or_else(|| data_dir.join("relay.db"));

        let claim_ttl_max = conf_file
            .claim_ttl_max_secs
            .unwrap_or(MAX_CLAIM_TTL_SECS)
            .min(MAX_CLAIM_TTL_SECS);

        Ok(Conf {
            hostname,
            listeners,
            tls,
            log_file,
            log_directive: conf_file.log_directive.clone(),
            database_path,
            master_pepper,
            token_secret,
            stale_after: Duration::from_secs(conf_file.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS)),
            claim_ttl_default: Duration::from_secs(
                conf_file
                    .claim_ttl_default_secs
                    .unwrap_or(DEFAULT_CLAIM_TTL_SECS)
                    .min(claim_ttl_max),
            ),
            claim_ttl_max: Duration::from_secs(claim_ttl_max),
            forward_ceiling: Duration::from_secs(
                conf_file.forward_ceiling_secs.unwrap_or(DEFAULT_FORWARD_CEILING_SECS),
            ),
            tunnel_idle_timeout: Duration::from_secs(
                conf_file
                    .tunnel_idle_timeout_secs
                    .unwrap_or(DEFAULT_TUNNEL_IDLE_TIMEOUT_SECS),
            ),
            cleanup_interval: Duration::from_secs(
                conf_file.cleanup_interval_secs.unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS),
            ),
            redeem_rate_limit: conf_file.redeem_rate_limit.unwrap_or(DEFAULT_REDEEM_RATE_LIMIT),
        })
    }
}

/// Secrets may come from the environment (preferred in containerized
/// deployments) or inline from the configuration file, base64-encoded.
fn read_secret(env_key: &str, conf_value: Option<&str>, conf_key: &str) -> anyhow::Result<Vec<u8>> {
    let encoded = match env::var(env_key) {
        Ok(value) => value,
        Err(_) => conf_value
            .map(str::to_owned)
            .with_context(|| format!("{conf_key} is missing (set it in the config file or via {env_key})"))?,
    };

    let secret = BASE64
        .decode(encoded.trim())
        .with_context(|| format!("{conf_key} is not valid base64"))?;

    anyhow::ensure!(
        secret.len() >= MIN_SECRET_LEN,
        "{conf_key} must be at least {MIN_SECRET_LEN} bytes once decoded"
    );

    Ok(secret)
}

/// Configuration handle, source of truth for current configuration state.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<parking_lot::RwLock<Arc<Conf>>>,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        Self::init_with_path(None)
    }

    /// Same as [`init`](Self::init), with an explicit configuration path
    /// taking precedence over `MYDIA_RELAY_CONFIG_PATH`.
    pub fn init_with_path(conf_path: Option<&Utf8Path>) -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new(conf_path)?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(parking_lot::RwLock::new(Arc::new(conf))),
        })
    }

    #[doc(hidden)]
    pub fn mock(json_config: &str) -> anyhow::Result<Self> {
        let conf_file = serde_json::from_str::<dto::ConfFile>(json_config).context("invalid JSON config")?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(parking_lot::RwLock::new(Arc::new(conf))),
        })
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated).
    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.read().clone()
    }
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(data_dir) = env::var("MYDIA_RELAY_DATA_PATH") {
        Utf8PathBuf::from(data_dir)
    } else if cfg!(target_os = "windows") {
        let program_data = env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
        Utf8PathBuf::from(program_data).join("Mydia").join("Relay")
    } else {
        Utf8PathBuf::from("/var/lib/mydia-relay")
    }
}

fn get_conf_file_path(path_override: Option<&Utf8Path>) -> Utf8PathBuf {
    let path = match path_override {
        Some(path) => path.to_owned(),
        None => match env::var("MYDIA_RELAY_CONFIG_PATH") {
            Ok(path) => Utf8PathBuf::from(path),
            Err(_) => return get_data_dir().join("relay.json"),
        },
    };

    if path.extension().is_some() {
        path
    } else {
        path.join("relay.json")
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    if !conf_path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(conf_path).with_context(|| format!("couldn't read {conf_path}"))?;
    let conf_file = serde_json::from_str(&content).with_context(|| format!("invalid config file at {conf_path}"))?;

    Ok(Some(conf_file))
}

pub fn load_conf_file_or_generate_new(path_override: Option<&Utf8Path>) -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path(path_override);

    match load_conf_file(&conf_file_path)? {
        Some(conf_file) => Ok(conf_file),
        None => {
            let conf_file = dto::ConfFile::generate_new();

            if let Some(parent) = conf_file_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
            }

            let json = serde_json::to_string_pretty(&conf_file).context("couldn't serialize configuration")?;
            std::fs::write(&conf_file_path, json).with_context(|| format!("couldn't write {conf_file_path}"))?;

            info!(path = %conf_file_path, "Generated a new configuration file");

            Ok(conf_file)
        }
    }
}

pub mod dto {
    use serde::{Deserialize, Serialize};

    use super::*;

    /// Source of truth for relay configuration.
    ///
    /// This struct represents the JSON file used for configuration as close
    /// as possible and is not trying to be too smart.
    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// This relay's hostname (e.g.: relay.mydia.example)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub hostname: Option<String>,

        /// Listeners to launch at startup
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub listeners: Vec<ListenerConf>,

        /// Certificate to use for TLS
        #[serde(skip_serializing_if = "Option::is_none")]
        pub tls_certificate_file: Option<Utf8PathBuf>,
        /// Private key to use for TLS
        #[serde(skip_serializing_if = "Option::is_none")]
        pub tls_private_key_file: Option<Utf8PathBuf>,

        /// Base64 master pepper for rendezvous namespace derivation
        ///
        /// Prefer `MYDIA_RELAY_MASTER_PEPPER` in deployments where the
        /// config file is not secret.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub master_pepper: Option<String>,
        /// Base64 secret keying instance-token digests
        #[serde(skip_serializing_if = "Option::is_none")]
        pub token_secret: Option<String>,

        /// Path to the libSQL database file
        #[serde(skip_serializing_if = "Option::is_none")]
        pub database_path: Option<Utf8PathBuf>,

        /// Folder and prefix for log files
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        /// Log filtering directives (tracing syntax)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_directive: Option<String>,

        /// Seconds without presence before an instance is considered stale
        #[serde(skip_serializing_if = "Option::is_none")]
        pub stale_after_secs: Option<u64>,
        /// Default claim TTL in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        pub claim_ttl_default_secs: Option<u64>,
        /// Maximum claim TTL in seconds (capped at 24 hours)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub claim_ttl_max_secs: Option<u64>,
        /// Server-enforced ceiling for a blocking forward, in seconds
        #[serde(skip_serializing_if = "Option::is_none")]
        pub forward_ceiling_secs: Option<u64>,
        /// Seconds without any frame before an instance tunnel is dropped
        #[serde(skip_serializing_if = "Option::is_none")]
        pub tunnel_idle_timeout_secs: Option<u64>,
        /// Seconds between cleanup sweeps
        #[serde(skip_serializing_if = "Option::is_none")]
        pub cleanup_interval_secs: Option<u64>,
        /// Redeem attempts allowed per IP per minute
        #[serde(skip_serializing_if = "Option::is_none")]
        pub redeem_rate_limit: Option<u32>,

        // Other unofficial options.
        // This field is useful so that we can deserialize
        // and then losslessly serialize back all root keys of the config file.
        #[serde(flatten)]
        pub rest: serde_json::Map<String, serde_json::Value>,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self {
                hostname: None,
                listeners: vec![ListenerConf {
                    internal_url: "http://*:10256".to_owned(),
                    external_url: "http://*:10256".to_owned(),
                }],
                tls_certificate_file: None,
                tls_private_key_file: None,
                master_pepper: Some(generate_secret()),
                token_secret: Some(generate_secret()),
                database_path: None,
                log_file: None,
                log_directive: None,
                stale_after_secs: None,
                claim_ttl_default_secs: None,
                claim_ttl_max_secs: None,
                forward_ceiling_secs: None,
                tunnel_idle_timeout_secs: None,
                cleanup_interval_secs: None,
                redeem_rate_limit: None,
                rest: serde_json::Map::new(),
            }
        }
    }

    fn generate_secret() -> String {
        let mut bytes = [0u8; MIN_SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        BASE64.encode(bytes)
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ListenerConf {
        /// URL to bind on, `http` or `https`; `*` binds every interface
        pub internal_url: String,
        /// URL advertised to clients
        pub external_url: String,
    }
}
