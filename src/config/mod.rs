use anyhow::{bail, Result};

/// Process-level settings, loaded once at startup from the environment
/// (`.env` is honored via dotenvy in `main`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: String,
    pub api_secret: String,
    /// Testnet only supports SPOT trading; MARGIN/FUTURES bot starts are rejected.
    pub use_testnet: bool,
    pub database_url: String,
    pub web_port: u16,
    pub news_enabled: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let settings = Self {
            api_key: std::env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
            use_testnet: env_flag("BINANCE_TESTNET", false),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./cryptofleet.db".to_string()),
            web_port: std::env::var("WEB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            news_enabled: env_flag("NEWS_ENABLED", true),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            bail!("DATABASE_URL must not be empty");
        }
        if self.web_port == 0 {
            bail!("WEB_PORT must be a valid TCP port");
        }
        // Trading with only one half of a key pair is always a configuration mistake.
        if self.api_key.is_empty() != self.api_secret.is_empty() {
            bail!("BINANCE_API_KEY and BINANCE_API_SECRET must be set together");
        }
        Ok(())
    }

    /// True when order placement and balance lookups are possible.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
