//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call mydia_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build an [`AppConfig`] without touching the global slot (tests).
pub fn load() -> Result<AppConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8096)?
        .set_default("server.gateway_port", 8097)?
        .set_default("server.direct_urls", Vec::<String>::new())?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 5)?
        .set_default("auth.issuer", "mydia")?
        .set_default("auth.access_token_ttl_secs", 900)? // 15 min
        .set_default("auth.media_token_ttl_secs", 600)? // 10 min
        .set_default("pairing.claim_code_ttl_mins", 10)?
        .set_default("pairing.claim_code_length", 8)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (MYDIA__SERVER__HOST, MYDIA__DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("MYDIA")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub pairing: PairingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub gateway_port: u16,
    /// URLs on which this server is directly reachable from outside
    /// (advertised to clients at pairing and through the relay tunnel).
    pub direct_urls: Vec<String>,
    /// Stable identifier clients use to request a relay tunnel to this
    /// installation. Optional; without it only direct access works.
    pub instance_id: Option<String>,
    /// SHA-256 fingerprint of the TLS leaf certificate fronting this server,
    /// handed to clients at pairing for certificate pinning.
    pub cert_fingerprint: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL or SQLite connection URL
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Symmetric signing secret (HS256) for user and media tokens —
    /// should be 256+ bits of entropy. Deployment configuration, never stored
    /// in the database.
    pub token_secret: String,
    /// Application secret under which the server's static private key is
    /// sealed at rest.
    pub app_secret: String,
    /// `iss` claim stamped into every token.
    pub issuer: String,
    /// User access token TTL in seconds
    pub access_token_ttl_secs: u64,
    /// Media access token TTL in seconds
    pub media_token_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PairingConfig {
    /// Minutes before an unused claim code expires.
    pub claim_code_ttl_mins: i64,
    /// Printable characters per claim code.
    pub claim_code_length: usize,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RelayConfig {
    /// Shared secret between the co-located relay-exit process and the API,
    /// used to sign the `x-relay-*` header set. Optional; without it relay
    /// headers are never honored.
    pub header_secret: Option<String>,
}
