use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::GenerationService;
use crate::entitlement::EntitlementResolver;
use crate::rate_limit::RateLimiter;

// app's shared state

pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub resolver: EntitlementResolver,
    pub generator: Arc<dyn GenerationService>,
    pub generation_timeout: Duration, // deadline for a single generation
}

impl AppState {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        resolver: EntitlementResolver,
        generator: Arc<dyn GenerationService>,
        generation_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            rate_limiter,
            resolver,
            generator,
            generation_timeout,
        })
    }
}
