//! Identity context: the current authenticated identity and store client.
//!
//! [`IdentityProvider`] is the sole writer of authentication state. It
//! connects to the auth provider once, keeps a single identity listener for
//! its lifetime, and publishes a fresh [`IdentityContext`] on every
//! notification. A failed initialization leaves the default (empty) context
//! in place; signed out is a normal steady state, not an error.

use crate::broadcast::{Channel, ChannelConfig, Reader};
use crate::error::{Result, SyncError};
use crate::remote::{AuthProvider, IdentityCallback, StoreClient};
use crate::subscription::Subscription;
use crate::types::{Identity, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration handed to the auth provider.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Application name registered with the provider.
    pub app_name: String,

    /// Provider-specific options, passed through untouched.
    pub options: serde_json::Value,

    /// Point-of-sale flag, carried into every published context.
    pub point_of_sale: bool,

    /// Reader notification buffer of the identity channel.
    #[serde(skip)]
    pub channel: ChannelConfig,
}

impl ProviderConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProviderConfig = serde_json::from_str(json)?;
        if config.app_name.trim().is_empty() && !config.app_name.is_empty() {
            return Err(SyncError::InvalidConfig("app_name is blank".to_string()));
        }
        Ok(config)
    }
}

/// The value broadcast to every dependent. Replaced wholesale on each change.
#[derive(Clone, Default)]
pub struct IdentityContext {
    pub client: Option<StoreClient>,
    pub identity: Option<Arc<Identity>>,
    pub point_of_sale: bool,
}

impl IdentityContext {
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn identity_id(&self) -> Option<&str> {
        self.identity.as_deref().map(|identity| identity.id.as_str())
    }
}

impl std::fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityContext")
            .field("client", &self.client)
            .field("identity", &self.identity)
            .field("is_authenticated", &self.is_authenticated())
            .field("point_of_sale", &self.point_of_sale)
            .finish()
    }
}

/// Owns the identity listener and the identity channel.
pub struct IdentityProvider {
    channel: Arc<Channel<IdentityContext>>,
    listener: Option<Subscription>,
    init_error: Option<SyncError>,
}

impl IdentityProvider {
    /// Connect to `auth` and start following identity changes.
    pub fn start<A: AuthProvider + ?Sized>(auth: &A, config: &ProviderConfig) -> Self {
        let channel = Channel::with_config(IdentityContext::default(), config.channel.clone());

        let client = match auth.initialize(config) {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(app = %config.app_name, error = %err, "auth provider initialization failed");
                return Self::failed(channel, err);
            }
        };

        let listener = Subscription::pending(SubscriptionId(0), "identity");
        let guard = listener.guard();
        let weak = Arc::downgrade(&channel);
        let point_of_sale = config.point_of_sale;
        let listener_client = client.clone();

        let callback: IdentityCallback = Arc::new(move |identity: Option<Identity>| {
            if !guard.is_live() {
                return;
            }
            let Some(channel) = weak.upgrade() else {
                return;
            };
            tracing::debug!(identity = ?identity, "identity changed");
            let context = IdentityContext {
                client: Some(listener_client.clone()),
                identity: identity.map(Arc::new),
                point_of_sale,
            };
            if let Err(err) = channel.publish(context) {
                tracing::debug!(error = %err, "identity change after shutdown");
            }
        });

        match auth.on_identity_change(&client, callback) {
            Ok(registration) => {
                listener.attach(registration);
                Self {
                    channel,
                    listener: Some(listener),
                    init_error: None,
                }
            }
            Err(err) => {
                tracing::error!(app = %config.app_name, error = %err, "identity listener registration failed");
                listener.release();
                // Anything published while registering is discarded with the listener.
                let channel = Channel::with_config(IdentityContext::default(), config.channel.clone());
                Self::failed(channel, SyncError::ProviderInit(err.to_string()))
            }
        }
    }

    /// A provider that never connected. Its context stays empty.
    pub fn detached() -> Self {
        Self {
            channel: Channel::new(IdentityContext::default()),
            listener: None,
            init_error: None,
        }
    }

    fn failed(channel: Arc<Channel<IdentityContext>>, err: SyncError) -> Self {
        let err = match err {
            SyncError::ProviderInit(msg) => SyncError::ProviderInit(msg),
            other => SyncError::ProviderInit(other.to_string()),
        };
        Self {
            channel,
            listener: None,
            init_error: Some(err),
        }
    }

    /// The current identity context.
    pub fn context(&self) -> Arc<IdentityContext> {
        self.channel.current()
    }

    /// A read-only view of the identity context.
    pub fn reader(&self) -> Reader<IdentityContext> {
        self.channel.reader()
    }

    /// The identity channel, for dependents that follow it.
    pub fn channel(&self) -> &Arc<Channel<IdentityContext>> {
        &self.channel
    }

    /// Why initialization failed, if it did.
    pub fn init_error(&self) -> Option<&SyncError> {
        self.init_error.as_ref()
    }

    /// Whether the identity listener is registered.
    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(Subscription::is_live)
    }
}

impl Drop for IdentityProvider {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.release();
        }
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAuth;

    #[test]
    fn test_config_from_json() {
        let config =
            ProviderConfig::from_json(r#"{"app_name": "shop", "point_of_sale": true}"#).unwrap();
        assert_eq!(config.app_name, "shop");
        assert!(config.point_of_sale);
        assert!(config.options.is_null());

        assert!(matches!(
            ProviderConfig::from_json("not json"),
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(matches!(
            ProviderConfig::from_json(r#"{"app_name": "  "}"#),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_publishes_on_every_change() {
        let auth = MemoryAuth::new();
        let provider = IdentityProvider::start(&auth, &ProviderConfig::default());

        let initial = provider.context();
        assert!(initial.client.is_some());
        assert!(!initial.is_authenticated());

        auth.sign_in("alice");
        let signed_in = provider.context();
        assert_eq!(signed_in.identity_id(), Some("alice"));
        assert!(signed_in.is_authenticated());

        auth.sign_out();
        assert!(!provider.context().is_authenticated());
        assert!(provider.context().client.is_some());
    }

    #[test]
    fn test_point_of_sale_passes_through() {
        let auth = MemoryAuth::new();
        let config = ProviderConfig {
            point_of_sale: true,
            ..Default::default()
        };
        let provider = IdentityProvider::start(&auth, &config);
        auth.sign_in("till-1");
        assert!(provider.context().point_of_sale);
    }

    #[test]
    fn test_init_failure_keeps_empty_context() {
        let auth = MemoryAuth::failing("bad api key");
        let provider = IdentityProvider::start(&auth, &ProviderConfig::default());

        let context = provider.context();
        assert!(context.client.is_none());
        assert!(context.identity.is_none());
        assert!(matches!(provider.init_error(), Some(SyncError::ProviderInit(_))));
        assert!(!provider.is_listening());
    }

    #[test]
    fn test_drop_releases_listener() {
        let auth = MemoryAuth::new();
        let provider = IdentityProvider::start(&auth, &ProviderConfig::default());
        assert_eq!(auth.listener_count(), 1);

        drop(provider);
        assert_eq!(auth.listener_count(), 0);
        // Notifications after shutdown go nowhere.
        auth.sign_in("bob");
    }
}
