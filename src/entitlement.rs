// Entitlement resolution for reading requests. Nothing is cached between requests.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::collaborators::{
    AnonymousCounter, AuthError, AuthProvider, CollaboratorError, ProfileStore, UserIdentity,
    UserProfile,
};
use crate::fingerprint::fingerprint;
use crate::readings::ReadingType;

pub const DEFAULT_FREE_READINGS_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Unauthenticated,
    TrialEnded,
    LimitExceeded,
    PremiumRequired,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::TrialEnded => "trial_ended",
            DenyReason::LimitExceeded => "limit_exceeded",
            DenyReason::PremiumRequired => "premium_required",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "Authentication required",
            DenyReason::TrialEnded => "Your free readings are used up. Upgrade to continue.",
            DenyReason::LimitExceeded => {
                "Free reading limit reached. Sign up to get more readings."
            }
            DenyReason::PremiumRequired => "This reading type requires a premium subscription",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readings left after the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Limited(u32),
    Unbounded,
    // anonymous callers are not told their remaining count
    Unreported,
}

impl Remaining {
    pub fn as_count(&self) -> Option<u32> {
        match self {
            Remaining::Limited(n) => Some(*n),
            Remaining::Unbounded | Remaining::Unreported => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow(Remaining),
    Deny(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Anonymous,
    Free,
    Premium,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Subject {
    Device(String),
    User(String),
}

/// Per-request view of who is asking and what they have used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementContext {
    subject: Subject,
    pub is_premium: bool,
    pub is_admin: bool,
    pub readings_used: u32,
    /// Free-tier ceiling for authenticated users; `None` for premium and admin.
    /// Anonymous contexts also carry `None`: their quota lives in the external
    /// device counter and is checked during resolution.
    pub readings_limit: Option<u32>,
}

impl EntitlementContext {
    pub fn anonymous(device_id: &str) -> Self {
        Self {
            subject: Subject::Device(device_id.to_string()),
            is_premium: false,
            is_admin: false,
            readings_used: 0,
            readings_limit: None,
        }
    }

    pub fn authenticated(
        user_id: &str,
        profile: &UserProfile,
        is_admin: bool,
        free_limit: u32,
    ) -> Self {
        let unbounded = profile.is_premium || is_admin;
        Self {
            subject: Subject::User(user_id.to_string()),
            is_premium: profile.is_premium,
            is_admin,
            readings_used: profile.readings_count,
            readings_limit: (!unbounded).then_some(free_limit),
        }
    }

    pub fn identity_kind(&self) -> IdentityKind {
        match self.subject {
            Subject::Device(_) => IdentityKind::Anonymous,
            Subject::User(_) => IdentityKind::Authenticated,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match &self.subject {
            Subject::Device(id) => Some(id),
            Subject::User(_) => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.subject {
            Subject::User(id) => Some(id),
            Subject::Device(_) => None,
        }
    }

    pub fn tier(&self) -> AccessTier {
        match self.identity_kind() {
            IdentityKind::Anonymous => AccessTier::Anonymous,
            IdentityKind::Authenticated if self.is_admin => AccessTier::Admin,
            IdentityKind::Authenticated if self.is_premium => AccessTier::Premium,
            IdentityKind::Authenticated => AccessTier::Free,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntitlementPolicy {
    pub free_readings_limit: u32,
    pub admin_email: Option<String>,
    /// Deny premium-only types to anonymous callers too.
    pub gate_anonymous_premium: bool,
}

impl Default for EntitlementPolicy {
    fn default() -> Self {
        Self {
            free_readings_limit: DEFAULT_FREE_READINGS_LIMIT,
            admin_email: None,
            gate_anonymous_premium: false,
        }
    }
}

impl EntitlementPolicy {
    pub fn is_admin(&self, identity: &UserIdentity) -> bool {
        match (&self.admin_email, &identity.email) {
            (Some(admin), Some(email)) => admin == email,
            _ => false,
        }
    }
}

/// Applies quota and premium-type rules to an already resolved context.
///
/// The anonymous device quota is enforced during resolution, not here.
pub fn evaluate(
    context: &EntitlementContext,
    reading_type: ReadingType,
    policy: &EntitlementPolicy,
) -> Decision {
    match context.identity_kind() {
        IdentityKind::Anonymous => {
            if policy.gate_anonymous_premium && reading_type.is_premium() {
                return Decision::Deny(DenyReason::PremiumRequired);
            }
            Decision::Allow(Remaining::Unreported)
        }
        IdentityKind::Authenticated => {
            let Some(limit) = context.readings_limit else {
                return Decision::Allow(Remaining::Unbounded);
            };

            if context.readings_used >= limit {
                return Decision::Deny(DenyReason::TrialEnded);
            }

            let free_remaining = limit - context.readings_used;
            if reading_type.is_premium() && free_remaining == 0 {
                return Decision::Deny(DenyReason::PremiumRequired);
            }

            Decision::Allow(Remaining::Limited(free_remaining - 1))
        }
    }
}

/// How the caller identified itself.
#[derive(Debug, Clone, Copy)]
pub enum Credentials<'a> {
    Device(&'a str),
    Bearer(Option<&'a str>),
}

/// An allowed request, carried through generation to bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub context: EntitlementContext,
    pub reading_type: ReadingType,
    pub remaining: Remaining,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("request denied: {0}")]
    Denied(DenyReason),

    #[error(transparent)]
    Dependency(#[from] CollaboratorError),
}

/// A free reading taken ahead of generation.
///
/// Dropping it without calling [`keep`](Self::keep) refunds the reading on
/// the runtime, so a request cancelled mid-generation is not charged.
pub struct Reservation {
    remaining: Remaining,
    refund: Option<(Arc<dyn ProfileStore>, String)>,
}

impl Reservation {
    fn unmetered(remaining: Remaining) -> Self {
        Self {
            remaining,
            refund: None,
        }
    }

    pub fn remaining(&self) -> Remaining {
        self.remaining
    }

    /// The reading was delivered; the count stays taken.
    pub fn keep(mut self) -> Remaining {
        self.refund = None;
        self.remaining
    }

    /// Refunds now and waits for the store to answer.
    pub async fn release(mut self) {
        if let Some((profiles, user_id)) = self.refund.take() {
            // spawned so the refund still lands if this future is dropped
            if let Err(e) = tokio::spawn(refund(profiles, user_id)).await {
                warn!(error = %e, "Refund task failed");
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some((profiles, user_id)) = self.refund.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(user = %fingerprint(&user_id), "Reservation dropped, refunding");
                handle.spawn(refund(profiles, user_id));
            }
            Err(_) => {
                warn!(user = %fingerprint(&user_id), "No runtime to refund dropped reservation");
            }
        }
    }
}

async fn refund(profiles: Arc<dyn ProfileStore>, user_id: String) {
    if let Err(e) = profiles.refund_reading(&user_id).await {
        warn!(user = %fingerprint(&user_id), error = %e, "Failed to refund reading");
    }
}

pub struct EntitlementResolver {
    auth: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileStore>,
    anonymous: Arc<dyn AnonymousCounter>,
    policy: EntitlementPolicy,
}

impl EntitlementResolver {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        profiles: Arc<dyn ProfileStore>,
        anonymous: Arc<dyn AnonymousCounter>,
        policy: EntitlementPolicy,
    ) -> Self {
        Self {
            auth,
            profiles,
            anonymous,
            policy,
        }
    }

    /// Decides whether a reading of `reading_type` may be generated.
    ///
    /// Lookup failures are returned as [`ResolveError::Dependency`]; they are
    /// never turned into anonymous or free access.
    pub async fn resolve(
        &self,
        credentials: Credentials<'_>,
        reading_type: ReadingType,
    ) -> Result<Grant, ResolveError> {
        let context = match credentials {
            Credentials::Device(device_id) => {
                if !self.anonymous.validate_reading_limit(device_id).await? {
                    debug!(device = %fingerprint(device_id), "Anonymous quota exhausted");
                    return Err(ResolveError::Denied(DenyReason::LimitExceeded));
                }
                EntitlementContext::anonymous(device_id)
            }
            Credentials::Bearer(None) => {
                return Err(ResolveError::Denied(DenyReason::Unauthenticated));
            }
            Credentials::Bearer(Some(token)) => {
                let identity = match self.auth.verify_token(token).await {
                    Ok(identity) => identity,
                    Err(AuthError::InvalidToken) => {
                        return Err(ResolveError::Denied(DenyReason::Unauthenticated));
                    }
                    Err(AuthError::Upstream(e)) => return Err(e.into()),
                };

                let profile = self.profiles.get_profile(&identity.id).await?;
                EntitlementContext::authenticated(
                    &identity.id,
                    &profile,
                    self.policy.is_admin(&identity),
                    self.policy.free_readings_limit,
                )
            }
        };

        match evaluate(&context, reading_type, &self.policy) {
            Decision::Allow(remaining) => Ok(Grant {
                context,
                reading_type,
                remaining,
            }),
            Decision::Deny(reason) => Err(ResolveError::Denied(reason)),
        }
    }

    /// Takes one free reading for metered users. Others pass through unchanged.
    ///
    /// The returned [`Reservation`] hands the reading back when dropped, unless
    /// [`Reservation::keep`] was called after a successful generation.
    pub async fn reserve(&self, grant: &Grant) -> Result<Reservation, ResolveError> {
        let (Some(user_id), Some(limit)) =
            (grant.context.user_id(), grant.context.readings_limit)
        else {
            return Ok(Reservation::unmetered(grant.remaining));
        };

        match self.profiles.increment_reading_count(user_id, limit).await? {
            Some(count) => Ok(Reservation {
                remaining: Remaining::Limited(limit.saturating_sub(count)),
                refund: Some((self.profiles.clone(), user_id.to_string())),
            }),
            None => {
                // lost a race against another request for the last reading
                debug!(user = %fingerprint(user_id), "Quota reached between check and reserve");
                Err(ResolveError::Denied(DenyReason::TrialEnded))
            }
        }
    }

    /// Post-generation bookkeeping for anonymous devices. Best-effort.
    pub async fn commit(&self, grant: &Grant) {
        let Some(device_id) = grant.context.device_id() else {
            return;
        };

        if let Err(e) = self.anonymous.increment_anonymous_count(device_id).await {
            warn!(device = %fingerprint(device_id), error = %e, "Failed to increment anonymous reading count");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{MemoryAnonymousCounter, MemoryAuth, MemoryProfiles};
    use async_trait::async_trait;

    const ADMIN: &str = "admin@example.com";

    fn policy() -> EntitlementPolicy {
        EntitlementPolicy {
            free_readings_limit: 5,
            admin_email: Some(ADMIN.to_string()),
            gate_anonymous_premium: false,
        }
    }

    fn free_user(count: u32) -> EntitlementContext {
        let profile = UserProfile {
            is_premium: false,
            readings_count: count,
        };
        EntitlementContext::authenticated("u1", &profile, false, 5)
    }

    fn resolver(profiles: Arc<MemoryProfiles>) -> EntitlementResolver {
        let auth = MemoryAuth::new()
            .with_token("free-token", "u1", Some("user@example.com"))
            .with_token("premium-token", "u2", Some("vip@example.com"))
            .with_token("admin-token", "u3", Some(ADMIN))
            .with_token("orphan-token", "u4", None);
        EntitlementResolver::new(
            Arc::new(auth),
            profiles,
            Arc::new(MemoryAnonymousCounter::default()),
            policy(),
        )
    }

    fn profiles(free_count: u32) -> Arc<MemoryProfiles> {
        Arc::new(
            MemoryProfiles::new()
                .with_profile("u1", false, free_count)
                .with_profile("u2", true, 40)
                .with_profile("u3", false, 12),
        )
    }

    #[test]
    fn test_context_has_exactly_one_subject() {
        let anon = EntitlementContext::anonymous("dev-1");
        assert_eq!(anon.device_id(), Some("dev-1"));
        assert_eq!(anon.user_id(), None);
        assert_eq!(anon.identity_kind(), IdentityKind::Anonymous);

        let user = free_user(0);
        assert_eq!(user.user_id(), Some("u1"));
        assert_eq!(user.device_id(), None);
        assert_eq!(user.tier(), AccessTier::Free);
    }

    #[test]
    fn test_trial_ended_regardless_of_type() {
        for reading_type in ReadingType::ALL {
            assert_eq!(
                evaluate(&free_user(5), reading_type, &policy()),
                Decision::Deny(DenyReason::TrialEnded)
            );
        }
        assert_eq!(
            evaluate(&free_user(9), ReadingType::Tarot, &policy()),
            Decision::Deny(DenyReason::TrialEnded)
        );
    }

    #[test]
    fn test_free_user_remaining_counts_this_reading() {
        assert_eq!(
            evaluate(&free_user(4), ReadingType::Tarot, &policy()),
            Decision::Allow(Remaining::Limited(0))
        );
        assert_eq!(
            evaluate(&free_user(0), ReadingType::Oracle, &policy()),
            Decision::Allow(Remaining::Limited(4))
        );
    }

    #[test]
    fn test_admin_never_premium_required() {
        let profile = UserProfile {
            is_premium: false,
            readings_count: 50,
        };
        let admin = EntitlementContext::authenticated("u3", &profile, true, 5);
        assert_eq!(admin.tier(), AccessTier::Admin);

        for reading_type in ReadingType::ALL {
            assert_eq!(
                evaluate(&admin, reading_type, &policy()),
                Decision::Allow(Remaining::Unbounded)
            );
        }
    }

    #[test]
    fn test_premium_is_unbounded() {
        let profile = UserProfile {
            is_premium: true,
            readings_count: 500,
        };
        let premium = EntitlementContext::authenticated("u2", &profile, false, 5);
        assert_eq!(premium.readings_limit, None);
        assert_eq!(
            evaluate(&premium, ReadingType::PastLife, &policy()),
            Decision::Allow(Remaining::Unbounded)
        );
    }

    #[test]
    fn test_anonymous_premium_gate_is_opt_in() {
        let anon = EntitlementContext::anonymous("dev-1");
        assert_eq!(
            evaluate(&anon, ReadingType::Astrology, &policy()),
            Decision::Allow(Remaining::Unreported)
        );

        let gated = EntitlementPolicy {
            gate_anonymous_premium: true,
            ..policy()
        };
        assert_eq!(
            evaluate(&anon, ReadingType::Astrology, &gated),
            Decision::Deny(DenyReason::PremiumRequired)
        );
        assert_eq!(
            evaluate(&anon, ReadingType::Tarot, &gated),
            Decision::Allow(Remaining::Unreported)
        );
    }

    #[test]
    fn test_admin_match_is_exact() {
        let policy = policy();
        let identity = |email: Option<&str>| UserIdentity {
            id: "x".to_string(),
            email: email.map(str::to_string),
        };
        assert!(policy.is_admin(&identity(Some(ADMIN))));
        assert!(!policy.is_admin(&identity(Some("Admin@example.com"))));
        assert!(!policy.is_admin(&identity(None)));
        assert!(!EntitlementPolicy::default().is_admin(&identity(Some(ADMIN))));
    }

    #[tokio::test]
    async fn test_missing_bearer_is_unauthenticated() {
        let resolver = resolver(profiles(0));
        let err = resolver
            .resolve(Credentials::Bearer(None), ReadingType::Tarot)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Denied(DenyReason::Unauthenticated)));

        let err = resolver
            .resolve(Credentials::Bearer(Some("forged")), ReadingType::Tarot)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Denied(DenyReason::Unauthenticated)));
    }

    #[test]
    fn test_anonymous_limit_is_external() {
        let anon = EntitlementContext::anonymous("dev-1");
        assert_eq!(anon.readings_limit, None);
        assert_eq!(anon.tier(), AccessTier::Anonymous);
    }

    #[tokio::test]
    async fn test_missing_profile_fails_closed() {
        let resolver = resolver(profiles(0));
        let err = resolver
            .resolve(Credentials::Bearer(Some("orphan-token")), ReadingType::Tarot)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Dependency(CollaboratorError::ProfileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_admin_by_email() {
        let resolver = resolver(profiles(0));
        let grant = resolver
            .resolve(Credentials::Bearer(Some("admin-token")), ReadingType::Oracle)
            .await
            .unwrap();
        assert_eq!(grant.context.tier(), AccessTier::Admin);
        assert_eq!(grant.remaining, Remaining::Unbounded);
    }

    #[tokio::test]
    async fn test_reserve_and_release_free_reading() {
        let store = profiles(4);
        let resolver = resolver(store.clone());

        let grant = resolver
            .resolve(Credentials::Bearer(Some("free-token")), ReadingType::Tarot)
            .await
            .unwrap();
        assert_eq!(grant.remaining, Remaining::Limited(0));

        let reservation = resolver.reserve(&grant).await.unwrap();
        assert_eq!(reservation.remaining(), Remaining::Limited(0));
        assert_eq!(store.readings_count("u1"), Some(5));

        reservation.release().await;
        assert_eq!(store.readings_count("u1"), Some(4));
    }

    #[tokio::test]
    async fn test_kept_reservation_stays_counted() {
        let store = profiles(1);
        let resolver = resolver(store.clone());

        let grant = resolver
            .resolve(Credentials::Bearer(Some("free-token")), ReadingType::Tarot)
            .await
            .unwrap();
        let reservation = resolver.reserve(&grant).await.unwrap();
        assert_eq!(reservation.keep(), Remaining::Limited(3));

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.readings_count("u1"), Some(2));
    }

    #[tokio::test]
    async fn test_dropped_reservation_is_refunded() {
        let store = profiles(2);
        let resolver = resolver(store.clone());

        let grant = resolver
            .resolve(Credentials::Bearer(Some("free-token")), ReadingType::Tarot)
            .await
            .unwrap();
        let reservation = resolver.reserve(&grant).await.unwrap();
        assert_eq!(store.readings_count("u1"), Some(3));

        drop(reservation);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.readings_count("u1"), Some(2));
    }

    #[tokio::test]
    async fn test_reserve_loses_race_for_last_reading() {
        let store = profiles(4);
        let resolver = resolver(store.clone());

        let first = resolver
            .resolve(Credentials::Bearer(Some("free-token")), ReadingType::Tarot)
            .await
            .unwrap();
        let second = resolver
            .resolve(Credentials::Bearer(Some("free-token")), ReadingType::Tarot)
            .await
            .unwrap();

        let held = resolver.reserve(&first).await.unwrap();
        let err = resolver.reserve(&second).await.err().unwrap();
        assert!(matches!(err, ResolveError::Denied(DenyReason::TrialEnded)));
        assert_eq!(held.keep(), Remaining::Limited(0));
        assert_eq!(store.readings_count("u1"), Some(5));
    }

    #[tokio::test]
    async fn test_premium_is_never_counted() {
        let store = profiles(0);
        let resolver = resolver(store.clone());

        let grant = resolver
            .resolve(Credentials::Bearer(Some("premium-token")), ReadingType::Astrology)
            .await
            .unwrap();
        let reservation = resolver.reserve(&grant).await.unwrap();
        assert_eq!(reservation.remaining(), Remaining::Unbounded);
        drop(reservation);
        resolver.commit(&grant).await;
        assert_eq!(store.readings_count("u2"), Some(40));
        assert_eq!(store.increments(), 0);
    }

    #[tokio::test]
    async fn test_anonymous_commit_counts_device() {
        let anonymous = Arc::new(MemoryAnonymousCounter::default());
        let resolver = EntitlementResolver::new(
            Arc::new(MemoryAuth::new()),
            profiles(0),
            anonymous.clone(),
            policy(),
        );

        for _ in 0..2 {
            let grant = resolver
                .resolve(Credentials::Device("dev-1"), ReadingType::Tarot)
                .await
                .unwrap();
            assert_eq!(grant.remaining, Remaining::Unreported);
            resolver.commit(&grant).await;
        }
        assert_eq!(anonymous.count("dev-1"), 2);

        let err = resolver
            .resolve(Credentials::Device("dev-1"), ReadingType::Tarot)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Denied(DenyReason::LimitExceeded)));
    }

    struct BrokenCounter;

    #[async_trait]
    impl AnonymousCounter for BrokenCounter {
        async fn validate_reading_limit(&self, _: &str) -> Result<bool, CollaboratorError> {
            Err(CollaboratorError::Status {
                service: "test",
                status: 503,
            })
        }

        async fn increment_anonymous_count(&self, _: &str) -> Result<(), CollaboratorError> {
            Err(CollaboratorError::Status {
                service: "test",
                status: 503,
            })
        }
    }

    #[tokio::test]
    async fn test_anonymous_lookup_failure_is_not_allow() {
        let resolver = EntitlementResolver::new(
            Arc::new(MemoryAuth::new()),
            profiles(0),
            Arc::new(BrokenCounter),
            policy(),
        );
        let err = resolver
            .resolve(Credentials::Device("dev-1"), ReadingType::Tarot)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Dependency(_)));

        // a failed increment after generation is swallowed
        let grant = Grant {
            context: EntitlementContext::anonymous("dev-1"),
            reading_type: ReadingType::Tarot,
            remaining: Remaining::Unreported,
        };
        resolver.commit(&grant).await;
    }
}
