use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_JWT_SECRET: &str = "un segreto meno bello";

#[derive(Debug, Clone)]
pub struct Config {
    /// Se assente il server usa lo store in memoria
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub server_host: String,
    pub server_port: u16,
    pub max_connections: u32,
    pub typing_timeout_ms: u64,
    pub typing_sweep_interval_ms: u64,
    pub message_page_size: usize,
    pub conversation_page_size: usize,
    pub max_page_size: usize,
    pub app_env: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 3000,
            max_connections: 100,
            typing_timeout_ms: 2000,
            typing_sweep_interval_ms: 250,
            message_page_size: 10,
            conversation_page_size: 15,
            max_page_size: 100,
            app_env: "development".to_string(),
        }
    }
}

/// Legge una variabile numerica, usando il default se non è impostata
fn parse_var<T: FromStr>(name: &str, default: T, hint: &str) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("Invalid {}: {}", name, hint)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Carica la configurazione dalle variabili d'ambiente
    /// Chiama dotenv() automaticamente
    pub fn from_env() -> Result<Self, String> {
        dotenv().ok();
        let defaults = Config::default();

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty());

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set, using default (not secure for production!)");
            DEFAULT_JWT_SECRET.to_string()
        });

        let server_host = env::var("SERVER_HOST").unwrap_or(defaults.server_host);

        let server_port = parse_var(
            "SERVER_PORT",
            defaults.server_port,
            "must be a number between 0-65535",
        )?;

        let max_connections = parse_var(
            "MAX_DB_CONNECTIONS",
            defaults.max_connections,
            "must be a positive number",
        )?;

        let typing_timeout_ms = parse_var(
            "TYPING_TIMEOUT_MS",
            defaults.typing_timeout_ms,
            "must be a positive number of milliseconds",
        )?;

        let typing_sweep_interval_ms = parse_var(
            "TYPING_SWEEP_INTERVAL_MS",
            defaults.typing_sweep_interval_ms,
            "must be a positive number of milliseconds",
        )?;

        let message_page_size = parse_var(
            "MESSAGE_PAGE_SIZE",
            defaults.message_page_size,
            "must be a positive number",
        )?;

        let conversation_page_size = parse_var(
            "CONVERSATION_PAGE_SIZE",
            defaults.conversation_page_size,
            "must be a positive number",
        )?;

        let max_page_size = parse_var(
            "MAX_PAGE_SIZE",
            defaults.max_page_size,
            "must be a positive number",
        )?;

        if typing_timeout_ms == 0 || typing_sweep_interval_ms == 0 {
            return Err("Typing timeouts must be greater than zero".to_string());
        }
        if message_page_size == 0 || conversation_page_size == 0 || max_page_size == 0 {
            return Err("Page sizes must be greater than zero".to_string());
        }

        let app_env = env::var("APP_ENV").unwrap_or(defaults.app_env);

        Ok(Config {
            database_url,
            jwt_secret,
            server_host,
            server_port,
            max_connections,
            typing_timeout_ms,
            typing_sweep_interval_ms,
            message_page_size,
            conversation_page_size,
            max_page_size,
            app_env,
        })
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_interval_ms)
    }

    /// Logga la configurazione (nascondendo i segreti)
    pub fn print_info(&self) {
        info!(environment = %self.app_env, "Server configuration");
        info!("Server address: {}:{}", self.server_host, self.server_port);
        match &self.database_url {
            Some(url) => info!(
                "Database: {} (max {} connections)",
                Self::mask_url(url),
                self.max_connections
            ),
            None => info!("Database: in-memory store"),
        }
        info!(
            typing_timeout_ms = self.typing_timeout_ms,
            sweep_interval_ms = self.typing_sweep_interval_ms,
            "Typing indicators"
        );
        info!(
            messages = self.message_page_size,
            conversations = self.conversation_page_size,
            max = self.max_page_size,
            "Page sizes"
        );
        if self.jwt_secret == DEFAULT_JWT_SECRET {
            warn!("JWT secret: USING DEFAULT (INSECURE!)");
        } else {
            info!("JWT secret: custom secret configured");
        }
    }

    /// Maschera l'URL del database per il logging
    fn mask_url(url: &str) -> String {
        if let Some(at_pos) = url.find('@') {
            if let Some(scheme_end) = url.find("://") {
                let scheme = &url[..scheme_end + 3];
                let after_at = &url[at_pos..];
                return format!("{}***{}", scheme, after_at);
            }
        }
        "***".to_string()
    }
}
