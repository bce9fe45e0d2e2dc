// In-process collaborators backed by DashMaps, for tests and local wiring

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    AnonymousCounter, AuthError, AuthProvider, CollaboratorError, ProfileStore, UserIdentity,
    UserProfile,
};

pub const DEFAULT_ANONYMOUS_LIMIT: u32 = 2;

#[derive(Default)]
pub struct MemoryAuth {
    tokens: DashMap<String, UserIdentity>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, token: &str, id: &str, email: Option<&str>) -> Self {
        self.tokens.insert(
            token.to_string(),
            UserIdentity {
                id: id.to_string(),
                email: email.map(str::to_string),
            },
        );
        self
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn verify_token(&self, bearer: &str) -> Result<UserIdentity, AuthError> {
        self.tokens
            .get(bearer)
            .map(|identity| identity.clone())
            .ok_or(AuthError::InvalidToken)
    }
}

#[derive(Default)]
pub struct MemoryProfiles {
    profiles: DashMap<String, UserProfile>,
    increments: AtomicUsize,
}

impl MemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, user_id: &str, is_premium: bool, readings_count: u32) -> Self {
        self.profiles.insert(
            user_id.to_string(),
            UserProfile {
                is_premium,
                readings_count,
            },
        );
        self
    }

    pub fn readings_count(&self, user_id: &str) -> Option<u32> {
        self.profiles.get(user_id).map(|p| p.readings_count)
    }

    // successful increments only
    pub fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfiles {
    async fn get_profile(&self, user_id: &str) -> Result<UserProfile, CollaboratorError> {
        self.profiles
            .get(user_id)
            .map(|p| p.clone())
            .ok_or_else(|| CollaboratorError::profile_not_found(user_id))
    }

    async fn increment_reading_count(
        &self,
        user_id: &str,
        ceiling: u32,
    ) -> Result<Option<u32>, CollaboratorError> {
        // the shard lock makes check and write one step
        let mut profile = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| CollaboratorError::profile_not_found(user_id))?;

        if profile.readings_count >= ceiling {
            return Ok(None);
        }

        profile.readings_count += 1;
        self.increments.fetch_add(1, Ordering::SeqCst);
        Ok(Some(profile.readings_count))
    }

    async fn refund_reading(&self, user_id: &str) -> Result<(), CollaboratorError> {
        let mut profile = self
            .profiles
            .get_mut(user_id)
            .ok_or_else(|| CollaboratorError::profile_not_found(user_id))?;
        profile.readings_count = profile.readings_count.saturating_sub(1);
        Ok(())
    }
}

pub struct MemoryAnonymousCounter {
    counts: DashMap<String, u32>,
    limit: u32,
}

impl MemoryAnonymousCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            counts: DashMap::new(),
            limit,
        }
    }

    pub fn count(&self, device_id: &str) -> u32 {
        self.counts.get(device_id).map(|c| *c).unwrap_or(0)
    }
}

impl Default for MemoryAnonymousCounter {
    fn default() -> Self {
        Self::new(DEFAULT_ANONYMOUS_LIMIT)
    }
}

#[async_trait]
impl AnonymousCounter for MemoryAnonymousCounter {
    async fn validate_reading_limit(&self, device_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self.count(device_id) < self.limit)
    }

    async fn increment_anonymous_count(&self, device_id: &str) -> Result<(), CollaboratorError> {
        *self.counts.entry(device_id.to_string()).or_insert(0) += 1;
        Ok(())
    }
}
