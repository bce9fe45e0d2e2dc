use clap::Parser;
use std::time::Duration;

use crate::entitlement::{DEFAULT_FREE_READINGS_LIMIT, EntitlementPolicy};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "reading-gateway")]
#[command(about = "Rate-limited, quota-gated gateway for AI spiritual readings")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Rate limit max requests per window, per client IP
    #[arg(long, env = "RATE_LIMIT", default_value_t = 5)]
    pub rate_limit: u32,

    // Rate limit window in seconds (also the Retry-After hint)
    #[arg(long, env = "RATE_WINDOW", default_value_t = 60)]
    pub rate_window: u64,

    // Seconds between sweeps of expired rate limit entries
    #[arg(long, env = "RATE_CLEANUP_INTERVAL", default_value_t = 60)]
    pub cleanup_interval: u64,

    // Free readings per authenticated account
    #[arg(long, env = "FREE_READINGS_LIMIT", default_value_t = DEFAULT_FREE_READINGS_LIMIT)]
    pub free_readings_limit: u32,

    // Exact email of the admin account
    #[arg(long, env = "ADMIN_EMAIL")]
    pub admin_email: Option<String>,

    // Deny premium-only reading types to anonymous callers
    #[arg(long, env = "GATE_ANONYMOUS_PREMIUM")]
    pub gate_anonymous_premium: bool,

    // Generation deadline in seconds
    #[arg(long, env = "GENERATION_TIMEOUT", default_value_t = 30)]
    pub generation_timeout: u64,

    // OpenAI-compatible endpoint
    #[arg(long, env = "OPENAI_URL", default_value = "https://api.openai.com")]
    pub openai_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    pub openai_model: String,

    #[arg(long, env = "MAX_TOKENS", default_value_t = 1000)]
    pub max_tokens: u32,

    #[arg(long, env = "TEMPERATURE", default_value_t = 0.8)]
    pub temperature: f32,

    // Supabase project url and service role key
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: String,

    #[arg(long, env = "SUPABASE_SERVICE_KEY", hide_env_values = true)]
    pub supabase_key: String,
}

impl Args {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout)
    }

    pub fn policy(&self) -> EntitlementPolicy {
        EntitlementPolicy {
            free_readings_limit: self.free_readings_limit,
            admin_email: self.admin_email.clone(),
            gate_anonymous_premium: self.gate_anonymous_premium,
        }
    }
}
