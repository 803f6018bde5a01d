//! Configuration loading from `.env` files and the process environment.

use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Which Lightning backend the service drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LnBackendType {
    Alby,
    Lnd,
}

impl LnBackendType {
    fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ALBY" => Ok(LnBackendType::Alby),
            "LND" => Ok(LnBackendType::Lnd),
            other => bail!("unsupported LN_BACKEND_TYPE: {}", other),
        }
    }
}

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Service identity secret key, 64 hex chars.
    pub nostr_privkey: [u8; 32],
    /// Relay URL, e.g. `wss://relay.getalby.com/v1`.
    pub relay: String,
    /// SQLite database path.
    pub database_uri: String,
    /// Selected Lightning backend.
    pub ln_backend: LnBackendType,
    /// Alby API base URL.
    pub alby_api_url: String,
    /// Alby API access token.
    pub alby_access_token: Option<String>,
    /// LND REST endpoint, e.g. `https://localhost:8080`.
    pub lnd_address: Option<String>,
    /// Path to the LND TLS certificate (PEM).
    pub lnd_cert_file: Option<String>,
    /// Path to the LND macaroon file.
    pub lnd_macaroon_file: Option<String>,
    /// Handler worker pool size.
    pub handler_concurrency: usize,
    /// How far behind startup the initial subscription reaches, in seconds.
    pub subscription_grace_secs: u64,
    /// Upper bound on a single Lightning backend call, in seconds.
    pub ln_timeout_secs: u64,
}

impl Settings {
    /// Load settings, reading the given `.env` file first when it exists.
    pub fn from_env(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path).context("reading env file")?;
        }

        let privkey_hex = env::var("NOSTR_PRIVKEY").context("NOSTR_PRIVKEY is required")?;
        let privkey_bytes = hex::decode(privkey_hex.trim()).context("NOSTR_PRIVKEY must be hex")?;
        let nostr_privkey: [u8; 32] = privkey_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("NOSTR_PRIVKEY must be 32 bytes of hex"))?;

        let relay = env::var("RELAY").unwrap_or_else(|_| "wss://relay.getalby.com/v1".to_string());
        let database_uri = env::var("DATABASE_URI").unwrap_or_else(|_| "nwcd.db".to_string());

        let ln_backend =
            LnBackendType::parse(&env::var("LN_BACKEND_TYPE").unwrap_or_else(|_| "ALBY".into()))?;

        let alby_api_url =
            env::var("ALBY_API_URL").unwrap_or_else(|_| "https://api.getalby.com".to_string());
        let alby_access_token = env::var("ALBY_ACCESS_TOKEN").ok().filter(|s| !s.is_empty());
        let lnd_address = env::var("LND_ADDRESS").ok().filter(|s| !s.is_empty());
        let lnd_cert_file = env::var("LND_CERT_FILE").ok().filter(|s| !s.is_empty());
        let lnd_macaroon_file = env::var("LND_MACAROON_FILE").ok().filter(|s| !s.is_empty());

        let handler_concurrency = env::var("HANDLER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);
        let subscription_grace_secs = env::var("SUBSCRIPTION_GRACE_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        let ln_timeout_secs = env::var("LN_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let settings = Self {
            nostr_privkey,
            relay,
            database_uri,
            ln_backend,
            alby_api_url,
            alby_access_token,
            lnd_address,
            lnd_cert_file,
            lnd_macaroon_file,
            handler_concurrency,
            subscription_grace_secs,
            ln_timeout_secs,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        match self.ln_backend {
            LnBackendType::Alby => {
                if self.alby_access_token.is_none() {
                    bail!("ALBY_ACCESS_TOKEN is required for the ALBY backend");
                }
            }
            LnBackendType::Lnd => {
                if self.lnd_address.is_none() {
                    bail!("LND_ADDRESS is required for the LND backend");
                }
                if self.lnd_macaroon_file.is_none() {
                    bail!("LND_MACAROON_FILE is required for the LND backend");
                }
            }
        }
        if self.handler_concurrency == 0 {
            bail!("HANDLER_CONCURRENCY must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "NOSTR_PRIVKEY",
        "RELAY",
        "DATABASE_URI",
        "LN_BACKEND_TYPE",
        "ALBY_API_URL",
        "ALBY_ACCESS_TOKEN",
        "LND_ADDRESS",
        "LND_CERT_FILE",
        "LND_MACAROON_FILE",
        "HANDLER_CONCURRENCY",
        "SUBSCRIPTION_GRACE_SECONDS",
        "LN_TIMEOUT_SECONDS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn loads_env_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            format!(
                "NOSTR_PRIVKEY={}\nRELAY=wss://relay.example.com\nALBY_ACCESS_TOKEN=token\nHANDLER_CONCURRENCY=4\n",
                "11".repeat(32)
            ),
        )
        .unwrap();

        let settings = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(settings.nostr_privkey, [0x11; 32]);
        assert_eq!(settings.relay, "wss://relay.example.com");
        assert_eq!(settings.ln_backend, LnBackendType::Alby);
        assert_eq!(settings.handler_concurrency, 4);
        assert_eq!(settings.subscription_grace_secs, 60);
    }

    #[test]
    fn missing_privkey_errors() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert!(Settings::from_env("/nonexistent/.env").is_err());
    }

    #[test]
    fn invalid_privkey_errors() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("NOSTR_PRIVKEY", "abcd");
        env::set_var("ALBY_ACCESS_TOKEN", "token");
        assert!(Settings::from_env("/nonexistent/.env").is_err());
        clear_env();
    }

    #[test]
    fn lnd_backend_requires_address() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("NOSTR_PRIVKEY", "22".repeat(32));
        env::set_var("LN_BACKEND_TYPE", "LND");
        assert!(Settings::from_env("/nonexistent/.env").is_err());

        env::set_var("LND_ADDRESS", "https://localhost:8080");
        env::set_var("LND_MACAROON_FILE", "/tmp/admin.macaroon");
        let settings = Settings::from_env("/nonexistent/.env").unwrap();
        assert_eq!(settings.ln_backend, LnBackendType::Lnd);
        clear_env();
    }
}
