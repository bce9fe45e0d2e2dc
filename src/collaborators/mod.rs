// External services: hosted auth, profile/usage store, LLM provider

use async_trait::async_trait;
use thiserror::Error;

use crate::fingerprint::fingerprint;
use crate::readings::Prompt;

pub mod memory;
pub mod openai;
pub mod supabase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub is_premium: bool,
    pub readings_count: u32,
}

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("request to {service} failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned status {status}")]
    Status { service: &'static str, status: u16 },

    // holds the user's fingerprint, never the raw id
    #[error("profile not found for user {0}")]
    ProfileNotFound(String),

    #[error("unexpected response from {service}: {message}")]
    Unexpected {
        service: &'static str,
        message: String,
    },
}

impl CollaboratorError {
    pub fn profile_not_found(user_id: &str) -> Self {
        CollaboratorError::ProfileNotFound(fingerprint(user_id))
    }

    // query strings carry user ids, so the url is dropped before it can be logged
    pub fn transport(service: &'static str, source: reqwest::Error) -> Self {
        CollaboratorError::Transport {
            service,
            source: source.without_url(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,

    #[error(transparent)]
    Upstream(#[from] CollaboratorError),
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("generation timed out after {0} seconds")]
    Timeout(u64),

    #[error("generation returned an empty reading")]
    Empty,

    #[error("generation failed: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify_token(&self, bearer: &str) -> Result<UserIdentity, AuthError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<UserProfile, CollaboratorError>;

    /// Atomically increments `readings_count` only while it is below `ceiling`.
    ///
    /// Returns the new count, or `None` when the ceiling was already reached
    /// and nothing changed.
    async fn increment_reading_count(
        &self,
        user_id: &str,
        ceiling: u32,
    ) -> Result<Option<u32>, CollaboratorError>;

    /// Gives back a reading taken by `increment_reading_count`. Never goes below zero.
    async fn refund_reading(&self, user_id: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait AnonymousCounter: Send + Sync {
    // true while the device is still under its anonymous quota
    async fn validate_reading_limit(&self, device_id: &str) -> Result<bool, CollaboratorError>;

    async fn increment_anonymous_count(&self, device_id: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, prompt: &Prompt) -> Result<String, GenerationError>;
}
