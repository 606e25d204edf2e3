//! Upstream identity provider client
//!
//! Every IdP interaction goes through [`IdpClient`]. The production
//! implementation is [`zitadel::ZitadelClient`]; tests substitute their
//! own fakes.

pub mod zitadel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use zitadel::ZitadelClient;

/// A role to create upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInput {
    /// Role key
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub desc: String,
}

/// Transport to the identity provider
#[async_trait]
pub trait IdpClient: Send + Sync {
    /// Create several roles, returning the created role keys
    async fn create_roles(&self, roles: &[RoleInput]) -> Result<Vec<String>>;

    /// Create a single role, returning its key
    async fn create_role(&self, name: &str, desc: &str) -> Result<String> {
        let keys = self
            .create_roles(&[RoleInput {
                name: name.to_string(),
                desc: desc.to_string(),
            }])
            .await?;
        Ok(keys.into_iter().next().unwrap_or_default())
    }

    /// Grant roles to a user; a no-op on an empty list
    async fn assign_roles_to_user(&self, user_id: &str, role_keys: &[String]) -> Result<()>;

    /// Grant a single role to a user
    async fn assign_role_to_user(&self, role_key: &str, user_id: &str) -> Result<()> {
        self.assign_roles_to_user(user_id, &[role_key.to_string()])
            .await
    }

    /// Delete a role from the project
    async fn delete_role(&self, role_key: &str) -> Result<()>;

    /// Revoke a role from a user by locating and deleting the grant that
    /// carries it
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] when the user has no grant
    /// containing the role.
    async fn remove_role_from_user(&self, role_key: &str, user_id: &str) -> Result<()>;

    /// All role keys granted to a user, flattened across grants.
    ///
    /// Duplicate keys appearing in several grants are returned as-is.
    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<String>>;
}
