//! Environment-driven configuration.
//!
//! Every knob comes from an environment variable with a typed default, so a
//! bare `storekeeper-server` starts against a local cluster with no setup.
//! Malformed values fall back to the default with a warning rather than
//! aborting startup.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default provisioning deadline.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(600);

/// Default cap on concurrently existing (active) stores.
pub const DEFAULT_MAX_STORES: u32 = 10;

/// Control plane configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port (`PORT`).
    pub port: u16,
    /// Deployment environment name (`NODE_ENV`), e.g. `development` or
    /// `production`. Controls error detail in 500 responses.
    pub environment: String,
    /// Path to the `SQLite` database file (`DB_PATH`).
    pub db_path: PathBuf,
    /// Path to the WooCommerce Helm chart (`HELM_CHART_PATH`).
    pub helm_chart_path: PathBuf,
    /// Kubeconfig path (`KUBECONFIG`). `None` (empty var) means in-cluster
    /// configuration; the flag is simply omitted from tool invocations.
    pub kubeconfig: Option<PathBuf>,
    /// Base domain for store ingress hosts (`BASE_DOMAIN`).
    pub base_domain: String,
    /// Creation quota: maximum number of active stores (`MAX_STORES`).
    pub max_stores: u32,
    /// Whole-workflow provisioning deadline (`PROVISION_TIMEOUT_MS`).
    pub provision_timeout: Duration,
    /// Rate limit sliding window (`RATE_LIMIT_WINDOW_MS`).
    pub rate_limit_window: Duration,
    /// General API requests allowed per window per IP
    /// (`RATE_LIMIT_MAX_REQUESTS`).
    pub rate_limit_max_requests: u32,
    /// Store creations allowed per window per IP (`RATE_LIMIT_MAX_CREATES`).
    pub rate_limit_max_creates: u32,
    /// WordPress admin account name (`WP_ADMIN_USER`).
    pub wp_admin_user: String,
    /// WordPress admin account email (`WP_ADMIN_EMAIL`).
    pub wp_admin_email: String,
}

impl Config {
    /// Resolves configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            environment: env_string("NODE_ENV", "development"),
            db_path: PathBuf::from(env_string("DB_PATH", "storekeeper.db")),
            helm_chart_path: PathBuf::from(env_string(
                "HELM_CHART_PATH",
                "./charts/woocommerce",
            )),
            kubeconfig: std::env::var("KUBECONFIG")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            base_domain: env_string("BASE_DOMAIN", "127.0.0.1.nip.io"),
            max_stores: env_parse("MAX_STORES", DEFAULT_MAX_STORES),
            provision_timeout: Duration::from_millis(env_parse(
                "PROVISION_TIMEOUT_MS",
                600_000_u64,
            )),
            rate_limit_window: Duration::from_millis(env_parse(
                "RATE_LIMIT_WINDOW_MS",
                60_000_u64,
            )),
            rate_limit_max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", 30),
            rate_limit_max_creates: env_parse("RATE_LIMIT_MAX_CREATES", 5),
            wp_admin_user: env_string("WP_ADMIN_USER", "admin"),
            wp_admin_email: env_string("WP_ADMIN_EMAIL", "admin@example.com"),
        }
    }

    /// Whether the control plane runs in production mode.
    ///
    /// Production 500 responses carry a fixed message and no stack detail.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            environment: "development".to_string(),
            db_path: PathBuf::from("storekeeper.db"),
            helm_chart_path: PathBuf::from("./charts/woocommerce"),
            kubeconfig: None,
            base_domain: "127.0.0.1.nip.io".to_string(),
            max_stores: DEFAULT_MAX_STORES,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_requests: 30,
            rate_limit_max_creates: 5,
            wp_admin_user: "admin".to_string(),
            wp_admin_email: "admin@example.com".to_string(),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, fallback = %default, "malformed value, using default");
            default
        }),
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_stores, 10);
        assert_eq!(config.provision_timeout, Duration::from_secs(600));
        assert_eq!(config.rate_limit_max_requests, 30);
        assert_eq!(config.rate_limit_max_creates, 5);
        assert!(!config.is_production());
    }

    #[test]
    fn production_detection() {
        let config = Config {
            environment: "production".to_string(),
            ..Config::default()
        };
        assert!(config.is_production());
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // No env manipulation here: exercise the parse path directly.
        assert_eq!("not-a-number".parse::<u16>().ok(), None);
        assert_eq!(env_parse("STOREKEEPER_TEST_UNSET_VAR", 42_u32), 42);
    }
}
