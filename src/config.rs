use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Proof-of-payment rules for onboarding submissions.
#[derive(Debug, Clone)]
pub struct OnboardingPolicy {
    /// When false every submission is allowed.
    pub strict: bool,
    /// Look-back window for "a recent payment from this email".
    pub window_days: i64,
    /// When a payment id is given, also require its payer email to match.
    pub require_payer_match: bool,
    /// One email may complete onboarding for a single site only.
    pub unique_email: bool,
}

impl Default for OnboardingPolicy {
    fn default() -> Self {
        Self {
            strict: true,
            window_days: 7,
            require_payer_match: false,
            unique_email: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    /// Development convenience: add undeclared columns on first write.
    pub schema_on_write: bool,
    pub redis_url: Option<String>,
    pub admin_token: String,
    pub host: String,
    pub port: u16,
    pub bcrypt_cost: u32,
    pub onboarding: OnboardingPolicy,
    pub app_base_url: String,
    // SMTP (optional)
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            database_url: None,
            schema_on_write: false,
            redis_url: None,
            admin_token: String::new(),
            host: "0.0.0.0".into(),
            port: 8080,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            onboarding: OnboardingPolicy::default(),
            app_base_url: "http://localhost".into(),
            smtp_host: None,
            smtp_port: None,
            smtp_username: None,
            smtp_password: None,
            smtp_from: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".into())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => anyhow::bail!("Unknown STORE_BACKEND: {other}"),
        };

        let database_url = match store_backend {
            StoreBackend::Postgres => Some(required("DATABASE_URL")?),
            StoreBackend::Memory => None,
        };

        Ok(Self {
            store_backend,
            database_url,
            schema_on_write: flag("STORE_SCHEMA_ON_WRITE", false),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            admin_token: required("ADMIN_TOKEN")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            bcrypt_cost: env::var("BCRYPT_COST")
                .unwrap_or_else(|_| "12".into())
                .parse()?,
            onboarding: OnboardingPolicy {
                strict: flag("ONBOARDING_STRICT", true),
                window_days: env::var("ONBOARDING_WINDOW_DAYS")
                    .unwrap_or_else(|_| "7".into())
                    .parse()?,
                require_payer_match: flag("ONBOARDING_REQUIRE_PAYER_MATCH", false),
                unique_email: flag("ONBOARDING_UNIQUE_EMAIL", false),
            },
            app_base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost".into()),
            smtp_host: env::var("SMTP_HOST").ok().filter(|s| !s.is_empty()),
            smtp_port: env::var("SMTP_PORT").ok().and_then(|v| v.parse().ok()),
            smtp_username: env::var("SMTP_USERNAME").ok().filter(|s| !s.is_empty()),
            smtp_password: env::var("SMTP_PASSWORD").ok().filter(|s| !s.is_empty()),
            smtp_from: env::var("SMTP_FROM").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}
