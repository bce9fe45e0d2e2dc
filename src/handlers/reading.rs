use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::collaborators::GenerationError;
use crate::entitlement::{AccessTier, Credentials, ResolveError};
use crate::error::AppError;
use crate::extract::{ClientIp, bearer_token};
use crate::fingerprint::fingerprint;
use crate::metrics::{
    DENIALS, GENERATION_FAILURES, GENERATION_LATENCY, RATE_LIMITED, READING_REQUESTS,
    READINGS_GENERATED,
};
use crate::readings::{Prompt, ReadingType, UnknownReadingType, build_prompt, validate_input};
use crate::state::AppState;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ReadingPayload {
    pub reading_type: String,
    #[serde(default)]
    pub user_input: HashMap<String, String>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ReadingResponse {
    pub reading: String,
    pub reading_type: String,
    pub tier: AccessTier,
    pub readings_remaining: Option<u32>,
}

fn record_denial(err: &ResolveError) {
    if let ResolveError::Denied(reason) = err {
        DENIALS.with_label_values(&[reason.as_str()]).inc();
        info!(%reason, "Reading denied");
    }
}

// Race the generator against the configured deadline
async fn generate(state: &AppState, prompt: &Prompt) -> Result<String, GenerationError> {
    let start_time = Instant::now();

    let result = match timeout(state.generation_timeout, state.generator.generate(prompt)).await {
        Ok(result) => result,
        Err(_) => Err(GenerationError::Timeout(state.generation_timeout.as_secs())),
    };

    GENERATION_LATENCY.observe(start_time.elapsed().as_secs_f64());
    result
}

pub async fn reading_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    payload: Result<Json<ReadingPayload>, JsonRejection>,
) -> Result<Json<ReadingResponse>, AppError> {
    READING_REQUESTS.inc();

    // throttle before looking at the body at all
    if state.rate_limiter.is_rate_limited(&ip) {
        RATE_LIMITED.inc();
        debug!(client = %fingerprint(&ip), "Rate limit exceeded");
        return Err(AppError::RateLimited {
            retry_after: state.rate_limiter.window().as_secs(),
        });
    }

    let Json(payload) = payload.map_err(|e| AppError::Validation(e.body_text()))?;

    let reading_type: ReadingType = payload
        .reading_type
        .parse()
        .map_err(|e: UnknownReadingType| AppError::Validation(e.to_string()))?;
    validate_input(reading_type, &payload.user_input).map_err(AppError::Validation)?;

    let credentials = if payload.is_anonymous {
        let device_id = payload
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AppError::Validation("deviceId is required for anonymous readings".to_string())
            })?;
        Credentials::Device(device_id)
    } else {
        Credentials::Bearer(bearer_token(&headers))
    };

    let grant = state
        .resolver
        .resolve(credentials, reading_type)
        .await
        .inspect_err(record_denial)?;
    // refunded on drop if the client goes away mid-generation
    let reservation = state
        .resolver
        .reserve(&grant)
        .await
        .inspect_err(record_denial)?;

    let prompt = build_prompt(reading_type, &payload.user_input);
    let reading = match generate(&state, &prompt).await {
        Ok(reading) => reading,
        Err(e) => {
            GENERATION_FAILURES.inc();
            reservation.release().await;
            return Err(e.into());
        }
    };

    let remaining = reservation.keep();
    state.resolver.commit(&grant).await;
    READINGS_GENERATED.inc();

    let tier = grant.context.tier();
    info!(%reading_type, ?tier, "Reading generated");

    Ok(Json(ReadingResponse {
        reading,
        reading_type: reading_type.to_string(),
        tier,
        readings_remaining: remaining.as_count(),
    }))
}
