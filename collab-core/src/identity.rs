//! User identities and the identity resolver collaborator.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A user as seen on the wire.
///
/// `provider_id` is the canonical key for host, presenter and deny-list
/// comparisons. Empty fields in a request body mean "not asserted".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    /// Identity provider name.
    #[serde(default)]
    pub provider: String,
    /// Stable user id at the provider.
    #[serde(default)]
    pub provider_id: String,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
}

impl User {
    /// Create a user from its canonical id.
    #[must_use]
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Self::default()
        }
    }

    /// Set the identity provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Set the email address.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// The canonical identity key.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.provider_id
    }

    /// Whether the user carries no canonical id.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.provider_id.is_empty()
    }

    /// Check every non-empty field of `claim` against this identity.
    ///
    /// Provider id, email and display name are compared. Email comparison
    /// ignores ASCII case. The provider name is not part of the check.
    #[must_use]
    pub fn satisfies(&self, claim: &User) -> bool {
        (claim.provider_id.is_empty() || claim.provider_id == self.provider_id)
            && (claim.email.is_empty() || claim.email.eq_ignore_ascii_case(&self.email))
            && (claim.display_name.is_empty() || claim.display_name == self.display_name)
    }
}

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.email.is_empty() {
            write!(f, "{}", self.provider_id)
        } else {
            write!(f, "{} <{}>", self.provider_id, self.email)
        }
    }
}

/// Role a user holds on a threat model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May view.
    Reader,
    /// May edit.
    Writer,
    /// May edit and administer.
    Owner,
}

impl Role {
    /// Whether the role may mutate diagrams.
    #[must_use]
    pub fn can_mutate(self) -> bool {
        self >= Self::Writer
    }

    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reader => "reader",
            Self::Writer => "writer",
            Self::Owner => "owner",
        }
    }
}

/// Resolves users known to the system by email.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Find the user registered with `email`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the lookup itself fails.
    async fn resolve_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Note a user seen on a connection. Directories that learn users from
    /// traffic record it; others ignore it.
    fn observe(&self, _user: &User) {}
}

/// In-memory user directory keyed by lower-cased email.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityDirectory {
    users: Arc<RwLock<HashMap<String, User>>>,
}

impl MemoryIdentityDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user. Users without an email or canonical id are ignored.
    pub fn remember(&self, user: &User) {
        if user.email.is_empty() || user.is_anonymous() {
            return;
        }
        let mut users = self
            .users
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        users.insert(user.email.to_ascii_lowercase(), user.clone());
    }

    /// Number of known users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no users are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdentityResolver for MemoryIdentityDirectory {
    async fn resolve_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let users = self
            .users
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(users.get(&email.to_ascii_lowercase()).cloned())
    }

    fn observe(&self, user: &User) {
        self.remember(user);
    }
}
