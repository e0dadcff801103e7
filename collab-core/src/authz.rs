//! Threat-model role lookup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::AuthzError;
use crate::identity::{Role, User};

/// Resolves the role a user holds on a threat model.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Role of `user` on `threat_model_id`, or `None` if the user has no access.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthzError`] if the lookup fails.
    async fn role_for(&self, user: &User, threat_model_id: &str)
        -> Result<Option<Role>, AuthzError>;
}

/// Grants file layout.
///
/// ```json
/// {
///   "default_role": "reader",
///   "threat_models": {
///     "tm-1": { "alice-id": "owner", "bob@example.com": "writer" }
///   }
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
struct GrantsFile {
    #[serde(default)]
    default_role: Option<Role>,
    #[serde(default)]
    threat_models: HashMap<String, HashMap<String, Role>>,
}

/// In-memory role grants keyed by threat model and principal.
///
/// A principal is either a provider id or an email address (compared
/// case-insensitively). When both match, the higher role wins.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorization {
    grants: Arc<RwLock<HashMap<String, HashMap<String, Role>>>>,
    default_role: Option<Role>,
}

impl StaticAuthorization {
    /// Create an empty grant table. Unknown users have no access.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant table where every authenticated user holds `role` unless granted more.
    #[must_use]
    pub fn open(role: Role) -> Self {
        Self {
            grants: Arc::default(),
            default_role: Some(role),
        }
    }

    /// Load grants from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`AuthzError::Io`] if the file cannot be read and
    /// [`AuthzError::InvalidGrants`] if it cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AuthzError> {
        let contents = std::fs::read_to_string(path)?;
        let file: GrantsFile =
            serde_json::from_str(&contents).map_err(|e| AuthzError::InvalidGrants(e.to_string()))?;
        let grants = file
            .threat_models
            .into_iter()
            .map(|(tm, principals)| {
                let principals = principals
                    .into_iter()
                    .map(|(principal, role)| (normalize(&principal), role))
                    .collect();
                (tm, principals)
            })
            .collect();
        Ok(Self {
            grants: Arc::new(RwLock::new(grants)),
            default_role: file.default_role,
        })
    }

    /// Grant `role` on `threat_model_id` to a provider id or email.
    pub fn grant(&self, threat_model_id: &str, principal: &str, role: Role) {
        let mut grants = self
            .grants
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        grants
            .entry(threat_model_id.to_string())
            .or_default()
            .insert(normalize(principal), role);
    }

    /// Remove every grant `principal` holds on `threat_model_id`.
    pub fn revoke(&self, threat_model_id: &str, principal: &str) {
        let mut grants = self
            .grants
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(principals) = grants.get_mut(threat_model_id) {
            principals.remove(&normalize(principal));
        }
    }

    fn lookup(&self, user: &User, threat_model_id: &str) -> Option<Role> {
        let grants = self
            .grants
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let explicit = grants.get(threat_model_id).and_then(|principals| {
            let by_id = principals.get(&normalize(&user.provider_id));
            let by_email = if user.email.is_empty() {
                None
            } else {
                principals.get(&normalize(&user.email))
            };
            by_id.into_iter().chain(by_email).copied().max()
        });
        explicit.into_iter().chain(self.default_role).max()
    }
}

#[async_trait]
impl AuthorizationService for StaticAuthorization {
    async fn role_for(
        &self,
        user: &User,
        threat_model_id: &str,
    ) -> Result<Option<Role>, AuthzError> {
        if user.is_anonymous() {
            return Ok(None);
        }
        Ok(self.lookup(user, threat_model_id))
    }
}

fn normalize(principal: &str) -> String {
    if principal.contains('@') {
        principal.to_ascii_lowercase()
    } else {
        principal.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bob() -> User {
        User::new("bob-id").with_email("Bob@Example.com")
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_role() {
        let authz = StaticAuthorization::new();
        assert_eq!(authz.role_for(&bob(), "tm1").await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn test_grant_by_email_and_id_takes_highest() {
        let authz = StaticAuthorization::new();
        authz.grant("tm1", "bob@example.com", Role::Reader);
        assert_eq!(authz.role_for(&bob(), "tm1").await.expect("lookup"), Some(Role::Reader));

        authz.grant("tm1", "bob-id", Role::Writer);
        assert_eq!(authz.role_for(&bob(), "tm1").await.expect("lookup"), Some(Role::Writer));
        assert_eq!(authz.role_for(&bob(), "tm2").await.expect("lookup"), None);

        authz.revoke("tm1", "bob-id");
        assert_eq!(authz.role_for(&bob(), "tm1").await.expect("lookup"), Some(Role::Reader));
    }

    #[tokio::test]
    async fn test_open_grants_default_role() {
        let authz = StaticAuthorization::open(Role::Writer);
        assert_eq!(authz.role_for(&bob(), "any").await.expect("lookup"), Some(Role::Writer));
        assert_eq!(
            authz.role_for(&User::default(), "any").await.expect("lookup"),
            None
        );
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"threat_models": {{"tm1": {{"bob-id": "owner"}}}}, "default_role": "reader"}}"#
        )
        .expect("write");

        let authz = StaticAuthorization::from_file(file.path()).expect("load");
        assert_eq!(authz.role_for(&bob(), "tm1").await.expect("lookup"), Some(Role::Owner));
        assert_eq!(authz.role_for(&bob(), "tm9").await.expect("lookup"), Some(Role::Reader));
    }

    #[test]
    fn test_from_file_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "not json").expect("write");
        assert!(matches!(
            StaticAuthorization::from_file(file.path()),
            Err(AuthzError::InvalidGrants(_))
        ));
    }
}
