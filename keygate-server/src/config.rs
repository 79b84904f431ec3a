//! Server configuration module
//!
//! Handles loading configuration from environment variables with sensible defaults.

use std::net::SocketAddr;
use std::str::FromStr;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 8080)
    pub port: u16,
    /// Server host (default: 127.0.0.1)
    pub host: [u8; 4],
    /// Allowed CORS origins, comma-separated (default: allow all in dev)
    pub allowed_origins: Option<Vec<String>>,
    /// Request body limit in MB (default: 2)
    pub body_limit_mb: usize,
    /// Request timeout in seconds (default: 60; must not undercut the upstream timeout)
    pub timeout_secs: u64,
    /// Enable rate limiting (default: false for tests, true when loaded from env)
    pub rate_limit_enabled: bool,
    /// Rate limit: requests per second (default: 10)
    pub rate_limit_per_sec: u64,
    /// Rate limit: burst size (default: 20)
    pub rate_limit_burst: u32,
    /// Debug mode: upstream error bodies are returned verbatim instead of redacted
    pub debug: bool,

    /// Development team identifier the attested keys must be bound to
    pub app_team_id: String,
    /// Application bundle identifier the attested keys must be bound to
    pub app_bundle_id: String,
    /// Require production-environment device keys
    pub attest_production: bool,
    /// Honor the `use-test-root` header (non-production deployments only)
    pub attest_allow_test_root: bool,
    /// Skip certificate chain verification entirely (tests only)
    pub attest_insecure_chain: bool,
    /// Path to the production root CA certificate (PEM)
    pub attest_root_ca_path: Option<String>,
    /// Path to the test root CA certificate (PEM)
    pub attest_test_root_ca_path: Option<String>,
    /// Challenge validity window in seconds (default: 300)
    pub challenge_ttl_secs: i64,

    /// PostgreSQL connection URL; in-memory storage is used when unset
    pub database_url: Option<String>,
    /// Database connection pool maximum connections (default: 10)
    pub database_max_connections: u32,
    /// Database connection pool minimum connections (default: 1)
    pub database_min_connections: u32,
    /// Per-connection prepared statement cache size (default: 100)
    pub statement_cache_capacity: usize,

    /// Completion backend base URL
    pub upstream_api_base: String,
    /// Budget-enforcing virtual key sent to the completion backend
    pub upstream_virtual_key: String,
    /// Upstream request timeout in seconds (default: 30)
    pub upstream_timeout_secs: u64,

    /// OAuth token introspection endpoint
    pub oauth_verify_url: String,
    /// Scope the introspected token must carry (empty disables the check)
    pub oauth_required_scope: String,

    /// Platform integrity token decode endpoint
    pub integrity_decode_url: String,
    /// Credential for the integrity decode endpoint
    pub integrity_api_key: String,
    /// Package name the integrity verdict must name
    pub integrity_package_name: String,

    /// HMAC secret for locally issued access tokens
    pub access_token_secret: String,
    /// Lifetime of locally issued access tokens in seconds (default: 3600)
    pub access_token_ttl_secs: u64,

    /// Valid request classes for the `service-type` header (default: ai, s2s)
    pub service_types: Vec<String>,
    /// Default completion model
    pub default_model: String,
    /// Default sampling temperature
    pub default_temperature: f32,
    /// Default completion token budget
    pub default_max_completion_tokens: u32,
    /// Default nucleus sampling parameter
    pub default_top_p: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            host: [127, 0, 0, 1],
            allowed_origins: None, // None = allow all (dev mode)
            body_limit_mb: 2,
            timeout_secs: 60,
            rate_limit_enabled: false, // Disabled by default (for tests)
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
            debug: true, // Enabled by default for tests; from_env() defaults to false
            app_team_id: "TEAMID1234".to_string(),
            app_bundle_id: "org.example.app".to_string(),
            attest_production: false,
            attest_allow_test_root: true,
            attest_insecure_chain: true, // Tests only; from_env() defaults to false
            attest_root_ca_path: None,
            attest_test_root_ca_path: None,
            challenge_ttl_secs: 300,
            database_url: None, // None = in-memory storage
            database_max_connections: 10,
            database_min_connections: 1,
            statement_cache_capacity: 100,
            upstream_api_base: "http://localhost:4000".to_string(),
            upstream_virtual_key: "sk-virtual".to_string(),
            upstream_timeout_secs: 30,
            oauth_verify_url: "http://localhost:9090/v1/verify".to_string(),
            oauth_required_scope: String::new(),
            integrity_decode_url: "http://localhost:9091/v1/integrity:decode".to_string(),
            integrity_api_key: String::new(),
            integrity_package_name: "org.example.app".to_string(),
            access_token_secret: "insecure-test-secret".to_string(),
            access_token_ttl_secs: 3600,
            service_types: vec!["ai".to_string(), "s2s".to_string()],
            default_model: "openai/gpt-4o".to_string(),
            default_temperature: 0.1,
            default_max_completion_tokens: 1024,
            default_top_p: 0.01,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = std::env::var("HOST")
            .ok()
            .map(|h| {
                if h == "0.0.0.0" {
                    [0, 0, 0, 0]
                } else {
                    [127, 0, 0, 1]
                }
            })
            .unwrap_or([127, 0, 0, 1]);

        let allowed_origins = std::env::var("ALLOWED_ORIGINS").ok().map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        let service_types = std::env::var("SERVICE_TYPES")
            .ok()
            .map(|types| {
                types
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|types: &Vec<String>| !types.is_empty())
            .unwrap_or(defaults.service_types);

        Self {
            port: env_parse("PORT", defaults.port),
            host,
            allowed_origins,
            body_limit_mb: env_parse("BODY_LIMIT_MB", defaults.body_limit_mb),
            timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", defaults.timeout_secs),
            // Rate limiting enabled by default in production, can be disabled
            // with RATE_LIMIT_ENABLED=false
            rate_limit_enabled: env_flag("RATE_LIMIT_ENABLED", true),
            rate_limit_per_sec: env_parse("RATE_LIMIT_PER_SEC", defaults.rate_limit_per_sec),
            rate_limit_burst: env_parse("RATE_LIMIT_BURST", defaults.rate_limit_burst),
            debug: env_flag("KEYGATE_DEBUG", false),
            app_team_id: env_string("APP_TEAM_ID", &defaults.app_team_id),
            app_bundle_id: env_string("APP_BUNDLE_ID", &defaults.app_bundle_id),
            attest_production: env_flag("ATTEST_PRODUCTION", false),
            attest_allow_test_root: env_flag("ATTEST_ALLOW_TEST_ROOT", false),
            attest_insecure_chain: env_flag("ATTEST_INSECURE_CHAIN", false),
            attest_root_ca_path: std::env::var("ATTEST_ROOT_CA_PATH").ok(),
            attest_test_root_ca_path: std::env::var("ATTEST_TEST_ROOT_CA_PATH").ok(),
            challenge_ttl_secs: env_parse("CHALLENGE_TTL_SECS", defaults.challenge_ttl_secs),
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            database_max_connections: env_parse(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            database_min_connections: env_parse(
                "DATABASE_MIN_CONNECTIONS",
                defaults.database_min_connections,
            ),
            statement_cache_capacity: env_parse(
                "STATEMENT_CACHE_CAPACITY",
                defaults.statement_cache_capacity,
            ),
            upstream_api_base: env_string("UPSTREAM_API_BASE", &defaults.upstream_api_base),
            upstream_virtual_key: env_string("UPSTREAM_VIRTUAL_KEY", &defaults.upstream_virtual_key),
            upstream_timeout_secs: env_parse(
                "UPSTREAM_TIMEOUT_SECS",
                defaults.upstream_timeout_secs,
            ),
            oauth_verify_url: env_string("OAUTH_VERIFY_URL", &defaults.oauth_verify_url),
            oauth_required_scope: env_string("OAUTH_REQUIRED_SCOPE", &defaults.oauth_required_scope),
            integrity_decode_url: env_string("INTEGRITY_DECODE_URL", &defaults.integrity_decode_url),
            integrity_api_key: env_string("INTEGRITY_API_KEY", &defaults.integrity_api_key),
            integrity_package_name: env_string(
                "INTEGRITY_PACKAGE_NAME",
                &defaults.integrity_package_name,
            ),
            access_token_secret: env_string("ACCESS_TOKEN_SECRET", &defaults.access_token_secret),
            access_token_ttl_secs: env_parse(
                "ACCESS_TOKEN_TTL_SECS",
                defaults.access_token_ttl_secs,
            ),
            service_types,
            default_model: env_string("MODEL_NAME", &defaults.default_model),
            default_temperature: env_parse("TEMPERATURE", defaults.default_temperature),
            default_max_completion_tokens: env_parse(
                "MAX_COMPLETION_TOKENS",
                defaults.default_max_completion_tokens,
            ),
            default_top_p: env_parse("TOP_P", defaults.default_top_p),
        }
    }

    /// Get socket address from config
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }

    /// Application identity attested keys must be bound to (`team.bundle`)
    pub fn app_identity(&self) -> String {
        format!("{}.{}", self.app_team_id, self.app_bundle_id)
    }

    /// Completion backend endpoint
    pub fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.upstream_api_base)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            if default {
                v.to_lowercase() != "false"
            } else {
                v.to_lowercase() == "true"
            }
        }
        Err(_) => default,
    }
}
