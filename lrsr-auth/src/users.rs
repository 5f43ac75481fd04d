//! Local user accounts, owned by an external collaborator.

use crate::error::{Error, Result};
use crate::upstream::UpstreamProfile;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalUser {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    #[serde(skip)]
    pub external_id: Option<String>,
}

/// Lookup and creation of local users.
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<LocalUser>>;

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<LocalUser>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<LocalUser>>;

    /// Create a user from an upstream profile, linked to its external id
    async fn create(&self, profile: &UpstreamProfile) -> Result<LocalUser>;

    /// Attach an external id to an existing, unlinked user
    async fn link_external_id(&self, user_id: i64, external_id: &str) -> Result<()>;
}

/// Map an upstream profile onto a local user.
///
/// Matches by external id first, then by email. An email match is linked to
/// the external id only when the user has none yet; an existing user's email
/// is never rewritten.
pub async fn resolve_or_create(users: &dyn UserLookup, profile: &UpstreamProfile) -> Result<LocalUser> {
    if let Some(user) = users.find_by_external_id(&profile.external_id).await? {
        return Ok(user);
    }

    let profile = UpstreamProfile {
        email: profile.email.trim().to_lowercase(),
        ..profile.clone()
    };

    match users.find_by_email(&profile.email).await? {
        Some(user) => match user.external_id.as_deref() {
            None => {
                users.link_external_id(user.id, &profile.external_id).await?;
                tracing::info!("linked upstream identity to existing user {}", user.id);
                Ok(LocalUser {
                    external_id: Some(profile.external_id.clone()),
                    ..user
                })
            }
            Some(_) => {
                tracing::warn!(
                    "email of user {} is already bound to another upstream identity",
                    user.id
                );
                Err(Error::Internal(
                    "email is bound to a different identity".to_string(),
                ))
            }
        },
        None => {
            let user = users.create(&profile).await?;
            tracing::info!("created user {} from upstream profile", user.id);
            Ok(user)
        }
    }
}

/// In-memory [`UserLookup`].
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<Mutex<HashMap<i64, LocalUser>>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user directly, returning its id.
    pub fn insert(&self, email: &str, name: Option<&str>, external_id: Option<&str>) -> Result<i64> {
        let mut users = self.lock()?;
        let id = users.keys().max().copied().unwrap_or(0) + 1;
        users.insert(
            id,
            LocalUser {
                id,
                email: email.to_string(),
                name: name.map(String::from),
                external_id: external_id.map(String::from),
            },
        );
        Ok(id)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, LocalUser>>> {
        self.users
            .lock()
            .map_err(|_| Error::Storage("user store lock poisoned".to_string()))
    }
}

#[async_trait]
impl UserLookup for MemoryUserStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<LocalUser>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<LocalUser>> {
        Ok(self
            .lock()?
            .values()
            .find(|u| u.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<LocalUser>> {
        Ok(self
            .lock()?
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create(&self, profile: &UpstreamProfile) -> Result<LocalUser> {
        let id = self.insert(
            &profile.email,
            profile.name.as_deref(),
            Some(&profile.external_id),
        )?;
        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::Storage("created user vanished".to_string()))
    }

    async fn link_external_id(&self, user_id: i64, external_id: &str) -> Result<()> {
        let mut users = self.lock()?;
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| Error::Storage(format!("no user {}", user_id)))?;
        user.external_id = Some(external_id.to_string());
        Ok(())
    }
}
