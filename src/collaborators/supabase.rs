use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    AnonymousCounter, AuthError, AuthProvider, CollaboratorError, ProfileStore, UserIdentity,
    UserProfile,
};

const AUTH: &str = "supabase auth";
const REST: &str = "supabase rest";

/// Thin client over Supabase Auth, PostgREST and the usage RPCs.
#[derive(Clone)]
pub struct Supabase {
    client: Client,
    url: String,
    service_key: String,
}

#[derive(Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

#[derive(Deserialize)]
struct ProfileRow {
    #[serde(default)]
    is_premium: bool,
    #[serde(default)]
    readings_count: u32,
}

impl Supabase {
    pub fn new(client: Client, url: &str, service_key: &str) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        }
    }

    fn rest(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn send_rpc(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<Response, CollaboratorError> {
        let url = format!("{}/rest/v1/rpc/{}", self.url, function);
        let res = self
            .rest(self.client.post(url))
            .json(&args)
            .send()
            .await
            .map_err(|e| CollaboratorError::transport(REST, e))?;

        check(res, REST)
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<T, CollaboratorError> {
        decode(self.send_rpc(function, args).await?, REST).await
    }
}

fn check(res: Response, service: &'static str) -> Result<Response, CollaboratorError> {
    if res.status().is_success() {
        Ok(res)
    } else {
        Err(CollaboratorError::Status {
            service,
            status: res.status().as_u16(),
        })
    }
}

async fn decode<T: DeserializeOwned>(
    res: Response,
    service: &'static str,
) -> Result<T, CollaboratorError> {
    res.json::<T>()
        .await
        .map_err(|e| CollaboratorError::Unexpected {
            service,
            message: e.to_string(),
        })
}

#[async_trait]
impl AuthProvider for Supabase {
    async fn verify_token(&self, bearer: &str) -> Result<UserIdentity, AuthError> {
        let res = self
            .client
            .get(format!("{}/auth/v1/user", self.url))
            .header("apikey", &self.service_key)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| CollaboratorError::transport(AUTH, e))?;

        if matches!(res.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(AuthError::InvalidToken);
        }

        let user: AuthUser = decode(check(res, AUTH)?, AUTH).await?;
        Ok(UserIdentity {
            id: user.id,
            email: user.email,
        })
    }
}

#[async_trait]
impl ProfileStore for Supabase {
    async fn get_profile(&self, user_id: &str) -> Result<UserProfile, CollaboratorError> {
        let url = format!(
            "{}/rest/v1/profiles?id=eq.{}&select=is_premium,readings_count",
            self.url, user_id
        );
        let res = self
            .rest(self.client.get(url))
            .send()
            .await
            .map_err(|e| CollaboratorError::transport(REST, e))?;

        let rows: Vec<ProfileRow> = decode(check(res, REST)?, REST).await?;
        rows.into_iter()
            .next()
            .map(|row| UserProfile {
                is_premium: row.is_premium,
                readings_count: row.readings_count,
            })
            .ok_or_else(|| CollaboratorError::profile_not_found(user_id))
    }

    // consume_reading is a conditional UPDATE ... WHERE readings_count < p_limit RETURNING readings_count
    async fn increment_reading_count(
        &self,
        user_id: &str,
        ceiling: u32,
    ) -> Result<Option<u32>, CollaboratorError> {
        self.rpc(
            "consume_reading",
            json!({ "p_user_id": user_id, "p_limit": ceiling }),
        )
        .await
    }

    async fn refund_reading(&self, user_id: &str) -> Result<(), CollaboratorError> {
        self.send_rpc("refund_reading", json!({ "p_user_id": user_id }))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl AnonymousCounter for Supabase {
    async fn validate_reading_limit(&self, device_id: &str) -> Result<bool, CollaboratorError> {
        self.rpc(
            "validate_reading_limit",
            json!({ "p_device_id": device_id }),
        )
        .await
    }

    async fn increment_anonymous_count(&self, device_id: &str) -> Result<(), CollaboratorError> {
        self.send_rpc(
            "increment_anonymous_count",
            json!({ "p_device_id": device_id }),
        )
        .await
        .map(|_| ())
    }
}
