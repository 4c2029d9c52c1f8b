//! Engine strategies: per-engine chart parameterization.
//!
//! An engine knows how to turn a store identity into chart values and
//! public URLs for one e-commerce stack. Engines are resolved once at
//! startup into an [`EngineRegistry`]; adding an engine is one registry
//! entry plus one value-builder.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

use crate::config::Config;
use crate::store::EngineKind;

/// Generated password length for the MySQL root and application users.
pub const MYSQL_PASSWORD_LEN: usize = 16;

/// Generated password length for the WordPress admin user.
pub const ADMIN_PASSWORD_LEN: usize = 12;

/// Public URLs of a provisioned store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUrls {
    /// Storefront URL.
    pub store_url: String,
    /// Admin panel URL.
    pub admin_url: String,
}

/// Result of an engine availability check.
#[derive(Debug, Clone)]
pub struct EngineValidation {
    /// Whether stores can be created with this engine.
    pub valid: bool,
    /// Why not, when `valid` is false.
    pub error: Option<String>,
}

impl EngineValidation {
    /// An available engine.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    /// An unavailable engine with a reason.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
        }
    }
}

/// Strategy describing how to parameterize the chart for one stack.
pub trait Engine: Send + Sync {
    /// Engine tag, e.g. `woocommerce`.
    fn name(&self) -> &'static str;

    /// Path to the chart this engine deploys.
    fn chart_path(&self) -> &Path;

    /// Chart values for a store. Called once per install; generated
    /// passwords are fresh on every call.
    fn values(&self, store_id: &str) -> BTreeMap<String, String>;

    /// Public URLs for a store.
    fn urls(&self, store_id: &str) -> StoreUrls;

    /// Availability check, surfaced at the API boundary before creation.
    fn validate(&self) -> EngineValidation;
}

/// WordPress + WooCommerce on MySQL, exposed through an nginx ingress.
pub struct WooCommerceEngine {
    chart_path: PathBuf,
    base_domain: String,
    admin_user: String,
    admin_email: String,
}

impl WooCommerceEngine {
    /// Builds the engine from configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            chart_path: config.helm_chart_path.clone(),
            base_domain: config.base_domain.clone(),
            admin_user: config.wp_admin_user.clone(),
            admin_email: config.wp_admin_email.clone(),
        }
    }

    fn domain(&self, store_id: &str) -> String {
        format!("{store_id}.{}", self.base_domain)
    }
}

impl Engine for WooCommerceEngine {
    fn name(&self) -> &'static str {
        EngineKind::Woocommerce.as_str()
    }

    fn chart_path(&self) -> &Path {
        &self.chart_path
    }

    fn values(&self, store_id: &str) -> BTreeMap<String, String> {
        let domain = self.domain(store_id);
        let mut values = BTreeMap::new();
        values.insert("storeId".to_string(), store_id.to_string());
        values.insert("wordpressUsername".to_string(), self.admin_user.clone());
        values.insert("wordpressEmail".to_string(), self.admin_email.clone());
        values.insert(
            "wordpressPassword".to_string(),
            generate_password(ADMIN_PASSWORD_LEN),
        );
        values.insert("wordpressBlogName".to_string(), store_id.to_string());
        values.insert(
            "mysql.auth.rootPassword".to_string(),
            generate_password(MYSQL_PASSWORD_LEN),
        );
        values.insert("mysql.auth.database".to_string(), "wordpress".to_string());
        values.insert("mysql.auth.username".to_string(), "wordpress".to_string());
        values.insert(
            "mysql.auth.password".to_string(),
            generate_password(MYSQL_PASSWORD_LEN),
        );
        values.insert("ingress.enabled".to_string(), "true".to_string());
        values.insert("ingress.hostname".to_string(), domain);
        values.insert("ingress.ingressClassName".to_string(), "nginx".to_string());
        values
    }

    fn urls(&self, store_id: &str) -> StoreUrls {
        let store_url = format!("http://{}", self.domain(store_id));
        let admin_url = format!("{store_url}/wp-admin");
        StoreUrls {
            store_url,
            admin_url,
        }
    }

    fn validate(&self) -> EngineValidation {
        if self.chart_path.exists() {
            EngineValidation::ok()
        } else {
            EngineValidation::unavailable(format!(
                "Helm chart not found at {}",
                self.chart_path.display()
            ))
        }
    }
}

/// Medusa. Registered so the tag parses, but not yet deployable.
pub struct MedusaEngine;

impl Engine for MedusaEngine {
    fn name(&self) -> &'static str {
        EngineKind::Medusa.as_str()
    }

    fn chart_path(&self) -> &Path {
        Path::new("")
    }

    fn values(&self, _store_id: &str) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn urls(&self, _store_id: &str) -> StoreUrls {
        StoreUrls {
            store_url: String::new(),
            admin_url: String::new(),
        }
    }

    fn validate(&self) -> EngineValidation {
        EngineValidation::unavailable("Medusa engine is not yet available")
    }
}

/// Map from engine tag to strategy, resolved once at startup.
pub struct EngineRegistry {
    engines: HashMap<EngineKind, Arc<dyn Engine>>,
}

impl EngineRegistry {
    /// Builds the registry with all known engines.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let mut engines: HashMap<EngineKind, Arc<dyn Engine>> = HashMap::new();
        engines.insert(
            EngineKind::Woocommerce,
            Arc::new(WooCommerceEngine::new(config)),
        );
        engines.insert(EngineKind::Medusa, Arc::new(MedusaEngine));
        Self { engines }
    }

    /// Resolves a strategy by tag.
    #[must_use]
    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn Engine>> {
        self.engines.get(&kind).map(Arc::clone)
    }
}

/// Draws a password from the OS random source: base64url without padding,
/// truncated to `len`.
#[must_use]
pub fn generate_password(len: usize) -> String {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut encoded = URL_SAFE_NO_PAD.encode(bytes);
    encoded.truncate(len);
    encoded
}
