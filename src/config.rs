use std::path::PathBuf;

/// Development fallback for `SECRET_KEY`; refused in production.
pub const DEFAULT_SECRET_KEY: &str = "your-secret-key-for-development";

/// File extensions accepted for uploaded study data.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["csv", "json", "xlsx"];

/// Deployment environment the service runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Testing,
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "testing" | "test" => Ok(Environment::Testing),
            other => anyhow::bail!(
                "ENVIRONMENT must be development, production or testing (got '{}')",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub debug: bool,
    pub environment: Environment,
    pub database_url: String,
    pub port: u16,
    pub secret_key: String,
    /// Access token lifetime in seconds.
    pub jwt_expiration: u64,
    /// Refresh token lifetime in seconds.
    pub refresh_token_expiration: u64,
    pub bcrypt_cost: u32,
    /// Default cache TTL in seconds.
    pub cache_default_timeout: u64,
    /// Cache budget in bytes of keys plus stored payloads.
    pub cache_max_capacity: u64,
    pub rate_limit_per_minute: u32,
    pub login_max_attempts: u32,
    pub login_window_secs: u64,
    pub log_level: String,
    /// Request body limit in bytes.
    pub max_content_length: usize,
    pub backup_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "MindMap Pro".to_string(),
            debug: false,
            environment: Environment::Development,
            database_url: "sqlite://mindmap_pro.db".to_string(),
            port: 8501,
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            jwt_expiration: 3600,
            refresh_token_expiration: 2_592_000,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            cache_default_timeout: 300,
            cache_max_capacity: 64 * 1024 * 1024,
            rate_limit_per_minute: 60,
            login_max_attempts: 5,
            login_window_secs: 300,
            log_level: "info".to_string(),
            max_content_length: 16 * 1024 * 1024,
            backup_dir: PathBuf::from("backups"),
        }
    }
}

/// Reads an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => anyhow::bail!("{} cannot be empty", name),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number (got '{}')", name, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let environment = match std::env::var("ENVIRONMENT") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.environment,
        };

        let config = Self {
            app_name: std::env::var("APP_NAME")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.app_name),
            debug: std::env::var("DEBUG")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.debug),
            environment,
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .map(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("sqlite:") {
                        anyhow::bail!("DATABASE_URL must start with sqlite:");
                    }
                    Ok(url)
                })
                .unwrap_or(Ok(defaults.database_url))?,
            port: parse_var("PORT", defaults.port)?,
            secret_key: std::env::var("SECRET_KEY")
                .map(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("SECRET_KEY cannot be empty");
                    }
                    Ok(key)
                })
                .unwrap_or(Ok(defaults.secret_key))?,
            jwt_expiration: parse_var("JWT_EXPIRATION", defaults.jwt_expiration)?,
            refresh_token_expiration: parse_var(
                "REFRESH_TOKEN_EXPIRATION",
                defaults.refresh_token_expiration,
            )?,
            bcrypt_cost: parse_var("BCRYPT_COST", defaults.bcrypt_cost)?,
            cache_default_timeout: parse_var(
                "CACHE_DEFAULT_TIMEOUT",
                defaults.cache_default_timeout,
            )?,
            cache_max_capacity: parse_var("CACHE_MAX_CAPACITY", defaults.cache_max_capacity)?,
            rate_limit_per_minute: parse_var(
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            )?,
            login_max_attempts: parse_var("LOGIN_MAX_ATTEMPTS", defaults.login_max_attempts)?,
            login_window_secs: parse_var("LOGIN_WINDOW_SECS", defaults.login_window_secs)?,
            log_level: std::env::var("LOG_LEVEL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or(defaults.log_level),
            max_content_length: parse_var("MAX_CONTENT_LENGTH", defaults.max_content_length)?,
            backup_dir: std::env::var("BACKUP_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.backup_dir),
        };

        Ok(config)
    }

    /// Cross-field checks that cannot be expressed per variable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.is_production() && self.secret_key == DEFAULT_SECRET_KEY {
            anyhow::bail!("SECRET_KEY must be set in production");
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            anyhow::bail!("BCRYPT_COST must be between 4 and 31");
        }
        if self.rate_limit_per_minute == 0 {
            anyhow::bail!("RATE_LIMIT_PER_MINUTE must be greater than zero");
        }
        if self.login_max_attempts == 0 {
            anyhow::bail!("LOGIN_MAX_ATTEMPTS must be greater than zero");
        }
        if self.jwt_expiration == 0 || self.refresh_token_expiration == 0 {
            anyhow::bail!("token expirations must be greater than zero");
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn is_testing(&self) -> bool {
        self.environment == Environment::Testing
    }

    /// Whether `filename` carries one of the accepted upload extensions.
    pub fn is_allowed_upload(filename: &str) -> bool {
        std::path::Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                ALLOWED_EXTENSIONS
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}
