use std::{env, fmt::Display, str::FromStr, time::Duration};

use bitmarket_common::{parse_boolean_flag, Secret};
use bitmarket_engine::MissRetryPolicy;
use log::*;

const DEFAULT_BMK_HOST: &str = "127.0.0.1";
const DEFAULT_BMK_PORT: u16 = 8370;
const DEFAULT_DATABASE_URL: &str = "sqlite://data/bitmarket.db";
const DEFAULT_LND_REST_URL: &str = "https://127.0.0.1:8080";
const DEFAULT_PROVIDER_NAME: &str = "lnd";
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 15;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_MISS_RETRIES: u32 = 5;
const DEFAULT_MISS_DELAY_MS: u64 = 1_000;
const DEFAULT_INVOICE_EXPIRY_SECS: i64 = 3_600;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// If true, pending database migrations are applied when the server starts.
    pub auto_migrate: bool,
    /// How long an invoice stays payable on the node.
    pub invoice_expiry: chrono::Duration,
    pub lnd: LndConfig,
    pub listener: ListenerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BMK_HOST.to_string(),
            port: DEFAULT_BMK_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            auto_migrate: true,
            invoice_expiry: chrono::Duration::seconds(DEFAULT_INVOICE_EXPIRY_SECS),
            lnd: LndConfig::default(),
            listener: ListenerConfig::default(),
        }
    }
}

/// Connection details for the LND REST interface.
#[derive(Clone, Debug)]
pub struct LndConfig {
    /// The base URL of the REST interface, e.g. "https://127.0.0.1:8080"
    pub rest_url: String,
    /// The hex-encoded admin (or invoice) macaroon.
    pub macaroon: Secret<String>,
    /// LND nodes usually present a self-signed certificate. **DANGER** when pointed at a remote node.
    pub accept_invalid_certs: bool,
    /// How long to wait for the node to answer an invoice or payment request.
    pub timeout: Duration,
    /// The provider name recorded against every payment.
    pub provider_name: String,
}

impl Default for LndConfig {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_LND_REST_URL.to_string(),
            macaroon: Secret::default(),
            accept_invalid_certs: false,
            timeout: Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS),
            provider_name: DEFAULT_PROVIDER_NAME.to_string(),
        }
    }
}

/// Tuning for the settlement listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub miss_retry: MissRetryPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            miss_retry: MissRetryPolicy {
                retries: DEFAULT_MISS_RETRIES,
                delay: Duration::from_millis(DEFAULT_MISS_DELAY_MS),
            },
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_string(), port, ..Default::default() }
    }

    /// Pending payments older than this are checked against the node by the expiry worker. The invoice expiry is
    /// extended by the longest time the settlement listener can take to apply a settlement the node has already sent.
    pub fn expiry_cutoff(&self) -> chrono::Duration {
        let retry = self.listener.miss_retry;
        let grace = self.listener.backoff_max + retry.delay.saturating_mul(retry.retries);
        self.invoice_expiry + chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Missing or invalid values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where F: Fn(&str) -> Option<String> {
        let host = lookup("BMK_HOST").unwrap_or_else(|| DEFAULT_BMK_HOST.into());
        let port = parse_or_default(&lookup, "BMK_PORT", DEFAULT_BMK_PORT);
        let database_url = lookup("BMK_DATABASE_URL").unwrap_or_else(|| {
            warn!("🪛️ BMK_DATABASE_URL is not set. Using the default, {DEFAULT_DATABASE_URL}");
            DEFAULT_DATABASE_URL.to_string()
        });
        let auto_migrate = parse_boolean_flag(lookup("BMK_AUTO_MIGRATE"), true);
        let expiry_secs = parse_or_default(&lookup, "BMK_INVOICE_EXPIRY", DEFAULT_INVOICE_EXPIRY_SECS);
        let invoice_expiry = if expiry_secs > 0 {
            chrono::Duration::seconds(expiry_secs)
        } else {
            warn!("🪛️ BMK_INVOICE_EXPIRY must be positive. Using the default, {DEFAULT_INVOICE_EXPIRY_SECS}s");
            chrono::Duration::seconds(DEFAULT_INVOICE_EXPIRY_SECS)
        };
        let lnd = LndConfig::from_lookup(&lookup);
        let listener = ListenerConfig::from_lookup(&lookup);
        Self { host, port, database_url, auto_migrate, invoice_expiry, lnd, listener }
    }
}

impl LndConfig {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where F: Fn(&str) -> Option<String> {
        let rest_url = lookup("BMK_LND_REST_URL").unwrap_or_else(|| {
            info!("🪛️ BMK_LND_REST_URL is not set. Using the default, {DEFAULT_LND_REST_URL}");
            DEFAULT_LND_REST_URL.to_string()
        });
        let macaroon = lookup("BMK_LND_MACAROON_HEX").unwrap_or_else(|| {
            error!(
                "🪛️ BMK_LND_MACAROON_HEX is not set. Please set it to the hex-encoded macaroon for your LND node. Calls \
                 to the node will be rejected without it."
            );
            String::default()
        });
        let accept_invalid_certs = parse_boolean_flag(lookup("BMK_LND_ACCEPT_INVALID_CERTS"), false);
        if accept_invalid_certs {
            warn!("🚨️ TLS certificate checks for the LND node are disabled. Only do this for a node on localhost.");
        }
        let timeout =
            Duration::from_secs(parse_or_default(lookup, "BMK_GATEWAY_TIMEOUT_SECS", DEFAULT_GATEWAY_TIMEOUT_SECS));
        let provider_name = lookup("BMK_PROVIDER_NAME").unwrap_or_else(|| DEFAULT_PROVIDER_NAME.to_string());
        Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            macaroon: Secret::new(macaroon),
            accept_invalid_certs,
            timeout,
            provider_name,
        }
    }
}

impl ListenerConfig {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where F: Fn(&str) -> Option<String> {
        let initial = parse_or_default(lookup, "BMK_LISTENER_BACKOFF_INITIAL_MS", DEFAULT_BACKOFF_INITIAL_MS);
        let max = parse_or_default(lookup, "BMK_LISTENER_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS);
        let max = if max < initial {
            warn!("🪛️ BMK_LISTENER_BACKOFF_MAX_MS ({max}) is less than the initial backoff ({initial}). Using {initial}.");
            initial
        } else {
            max
        };
        let retries = parse_or_default(lookup, "BMK_SETTLEMENT_MISS_RETRIES", DEFAULT_MISS_RETRIES);
        let delay = parse_or_default(lookup, "BMK_SETTLEMENT_MISS_DELAY_MS", DEFAULT_MISS_DELAY_MS);
        Self {
            backoff_initial: Duration::from_millis(initial),
            backoff_max: Duration::from_millis(max),
            miss_retry: MissRetryPolicy { retries, delay: Duration::from_millis(delay) },
        }
    }
}

fn parse_or_default<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(name) {
        Some(s) => s.trim().parse::<T>().unwrap_or_else(|e| {
            error!("🪛️ {s} is not a valid value for {name}. {e} Using the default, {default}, instead.");
            default
        }),
        None => default,
    }
}
