//! Request-independent state shared by all handlers.

use uuid::Uuid;

use crate::{
    credentials::Issuer,
    mailer::DeliveryQueue,
    users::Store,
    verification::Engine,
};

const DEFAULT_AUDIENCE: &str = "authenticated";
const DEFAULT_ADMIN_ROLE: &str = "admin";
const DEFAULT_SITE_URL: &str = "http://localhost:3000";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    instance_id: Uuid,
    audience: String,
    site_url: String,
    autoconfirm: bool,
    admin_role: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::nil(),
            audience: DEFAULT_AUDIENCE.to_string(),
            site_url: DEFAULT_SITE_URL.to_string(),
            autoconfirm: false,
            admin_role: DEFAULT_ADMIN_ROLE.to_string(),
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new(site_url: String) -> Self {
        Self {
            site_url,
            ..Self::default()
        }
    }

    /// Instance used when a request carries no instance header.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Audience used when a request carries no audience header.
    #[must_use]
    pub fn with_audience(mut self, audience: String) -> Self {
        self.audience = audience;
        self
    }

    /// Confirm accounts at signup and let unconfirmed users sign in.
    #[must_use]
    pub fn with_autoconfirm(mut self, autoconfirm: bool) -> Self {
        self.autoconfirm = autoconfirm;
        self
    }

    #[must_use]
    pub fn with_admin_role(mut self, role: String) -> Self {
        self.admin_role = role;
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    pub fn autoconfirm(&self) -> bool {
        self.autoconfirm
    }

    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }
}

pub struct AuthState {
    config: AuthConfig,
    engine: Engine<Store>,
    issuer: Issuer,
    delivery: DeliveryQueue,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        engine: Engine<Store>,
        issuer: Issuer,
        delivery: DeliveryQueue,
    ) -> Self {
        Self {
            config,
            engine,
            issuer,
            delivery,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine<Store> {
        &self.engine
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn delivery(&self) -> &DeliveryQueue {
        &self.delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let instance = Uuid::new_v4();
        let config = AuthConfig::new("https://app.example.com".into())
            .with_instance_id(instance)
            .with_audience("web".into())
            .with_autoconfirm(true);
        assert_eq!(config.instance_id(), instance);
        assert_eq!(config.audience(), "web");
        assert!(config.autoconfirm());
        assert_eq!(config.admin_role(), "admin");
        assert_eq!(config.site_url(), "https://app.example.com");
    }
}
