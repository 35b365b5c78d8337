//! Warp account provisioning
//!
//! The registration call itself belongs to a [`WarpProvisioner`] supplied by
//! the host. The controller generates the WireGuard key pair, hands the
//! public half to the provisioner, and shapes the reply.

use crate::controller::Controller;
use crate::error::{CoreError, Result};
use crate::security::{KeyPair, PublicKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Credentials supplied by the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarpRequest {
    /// License key to attach to the account
    pub license_key: String,
    /// Existing account id (empty to register a new account)
    pub account_id: String,
    /// Access token of the existing account
    pub access_token: String,
}

/// What the provisioner returns after registering a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarpRegistration {
    /// Account id
    pub account_id: String,
    /// Access token
    pub access_token: String,
    /// Interface IPv4 address
    pub local_address_ipv4: String,
    /// Interface IPv6 address
    pub local_address_ipv6: String,
    /// Public key of the Warp endpoint
    pub peer_public_key: String,
    /// Client id used in the reserved field
    pub client_id: String,
    /// Free-text registration log
    pub log: String,
}

/// Registers devices with the Warp service
#[async_trait]
pub trait WarpProvisioner: Send + Sync {
    /// Register `public_key` for the account described by `request`
    async fn register(&self, request: &WarpRequest, public_key: &PublicKey)
        -> Result<WarpRegistration>;
}

/// Account part of the reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpAccount {
    /// Account id
    #[serde(rename = "account-id")]
    pub account_id: String,
    /// Access token
    #[serde(rename = "access-token")]
    pub access_token: String,
}

/// WireGuard part of the reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WarpWireguardConfig {
    /// Base64 private key of the generated pair
    pub private_key: String,
    /// Interface IPv4 address
    pub local_address_ipv4: String,
    /// Interface IPv6 address
    pub local_address_ipv6: String,
    /// Public key of the Warp endpoint
    pub peer_public_key: String,
    /// Client id
    pub client_id: String,
}

/// Reply of `GenerateWarpConfig`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpConfigResponse {
    /// Account credentials
    pub account: WarpAccount,
    /// Registration log
    pub log: String,
    /// WireGuard parameters
    pub config: WarpWireguardConfig,
}

impl Controller {
    /// Register a fresh key pair with Warp and return the resulting account
    /// and WireGuard parameters
    pub async fn generate_warp_config(&self, request: WarpRequest) -> Result<WarpConfigResponse> {
        let provisioner = self
            .inner
            .warp
            .as_ref()
            .ok_or_else(|| CoreError::Generate("no Warp provisioner configured".to_string()))?;

        let pair = KeyPair::generate();
        let registration = provisioner
            .register(&request, &pair.public)
            .await
            .map_err(|e| CoreError::Generate(format!("Warp registration failed: {}", e)))?;
        info!("Warp device registered for account {}", registration.account_id);

        Ok(WarpConfigResponse {
            account: WarpAccount {
                account_id: registration.account_id,
                access_token: registration.access_token,
            },
            log: registration.log,
            config: WarpWireguardConfig {
                private_key: pair.private.to_base64(),
                local_address_ipv4: registration.local_address_ipv4,
                local_address_ipv6: registration.local_address_ipv6,
                peer_public_key: registration.peer_public_key,
                client_id: registration.client_id,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::PrivateKey;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingProvisioner {
        seen: Mutex<Option<PublicKey>>,
    }

    #[async_trait]
    impl WarpProvisioner for RecordingProvisioner {
        async fn register(
            &self,
            request: &WarpRequest,
            public_key: &PublicKey,
        ) -> Result<WarpRegistration> {
            if request.license_key == "revoked" {
                return Err(CoreError::Unexpected("license revoked".to_string()));
            }
            *self.seen.lock().unwrap() = Some(*public_key);
            Ok(WarpRegistration {
                account_id: "acc-1".to_string(),
                access_token: "tok".to_string(),
                local_address_ipv4: "172.16.0.2/32".to_string(),
                local_address_ipv6: "2606:4700::2/128".to_string(),
                peer_public_key: "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=".to_string(),
                client_id: "abcd".to_string(),
                log: "registered".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_generate_warp_config() {
        let provisioner = Arc::new(RecordingProvisioner::default());
        let controller = Controller::builder()
            .warp_provisioner(provisioner.clone())
            .build();

        let response = controller
            .generate_warp_config(WarpRequest::default())
            .await
            .unwrap();
        assert_eq!(response.account.account_id, "acc-1");

        // The provisioner saw the public half of the returned private key
        let private = PrivateKey::from_base64(&response.config.private_key).unwrap();
        let seen = provisioner.seen.lock().unwrap().unwrap();
        assert_eq!(private.public_key(), seen);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["account"]["account-id"], "acc-1");
        assert_eq!(json["config"]["local-address-ipv4"], "172.16.0.2/32");
    }

    #[tokio::test]
    async fn test_provisioner_failure() {
        let controller = Controller::builder()
            .warp_provisioner(Arc::new(RecordingProvisioner::default()))
            .build();
        let request = WarpRequest {
            license_key: "revoked".to_string(),
            ..WarpRequest::default()
        };
        assert!(matches!(
            controller.generate_warp_config(request).await,
            Err(CoreError::Generate(_))
        ));
    }

    #[tokio::test]
    async fn test_without_provisioner() {
        let controller = Controller::default();
        assert!(matches!(
            controller.generate_warp_config(WarpRequest::default()).await,
            Err(CoreError::Generate(_))
        ));
    }
}
