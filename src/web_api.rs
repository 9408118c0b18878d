use futures::future::BoxFuture;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::models::{Playback, PlayerResponse, TokenError, TokenGrant, TokenResponse};
use crate::storage::Secrets;
use crate::DeviceError;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Scopes requested at link time. Playback read/modify plus library read.
pub const SCOPES: &[&str] = &[
    "user-read-private",
    "user-read-email",
    "user-read-currently-playing",
    "user-read-playback-state",
    "user-read-playback-position",
    "user-modify-playback-state",
    "user-library-read",
];

/// The remote account service, as seen by the account manager.
///
/// Errors come back as values: `AuthRejected` for a refused code or refresh
/// token, `TokenExpired` when the API refuses the access token.
pub trait AccountApi: Send + Sync {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<String, DeviceError>;

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, DeviceError>>;

    fn refresh<'a>(&'a self, refresh_token: &'a str)
        -> BoxFuture<'a, Result<TokenGrant, DeviceError>>;

    /// `None` when nothing is playing.
    fn current_playback<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, Result<Option<Playback>, DeviceError>>;
}

#[derive(Serialize)]
struct AuthorizeQuery<'a> {
    client_id: &'a str,
    response_type: &'a str,
    redirect_uri: &'a str,
    scope: String,
    state: &'a str,
}

/// HTTP implementation of [`AccountApi`].
#[derive(Debug, Clone)]
pub struct WebApi {
    client: Client,
    secrets: Secrets,
    accounts_url: String,
    api_url: String,
}

impl WebApi {
    pub fn new(
        secrets: Secrets,
        accounts_url: &str,
        api_url: &str,
        request_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let client = ClientBuilder::new()
            .timeout(request_timeout)
            .pool_idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .build()?;
        Ok(Self {
            client,
            secrets,
            accounts_url: accounts_url.trim_end_matches('/').to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenGrant, DeviceError> {
        let response = self
            .client
            .post(format!("{}/api/token", self.accounts_url))
            .basic_auth(&self.secrets.client_id, Some(&self.secrets.client_secret))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response.json().await?;
            trace!(expires_in = body.expires_in, "Token endpoint answered");
            return Ok(body.into());
        }

        let text = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<TokenError>(&text)
            .map(|e| match e.error_description {
                Some(description) => format!("{}: {}", e.error, description),
                None => e.error,
            })
            .unwrap_or_else(|_| format!("HTTP {}", status));

        match status {
            // invalid_grant / invalid_client: the link itself is no good
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                warn!(%status, %reason, "Token request rejected");
                Err(DeviceError::AuthRejected(reason))
            }
            _ => Err(DeviceError::InvalidResponse(format!(
                "Token endpoint returned {}: {}",
                status, reason
            ))),
        }
    }

    async fn fetch_playback(&self, access_token: &str) -> Result<Option<Playback>, DeviceError> {
        let response = self
            .client
            .get(format!("{}/me/player", self.api_url))
            .bearer_auth(access_token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => {
                trace!("No active playback");
                Ok(None)
            }
            StatusCode::UNAUTHORIZED => Err(DeviceError::TokenExpired),
            status if status.is_success() => {
                let body = response.bytes().await?;
                if body.is_empty() {
                    return Ok(None);
                }
                let player: PlayerResponse = serde_json::from_slice(&body)?;
                Ok(Playback::from_player(&player))
            }
            status => Err(DeviceError::InvalidResponse(format!(
                "Playback query returned {}",
                status
            ))),
        }
    }
}

impl AccountApi for WebApi {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<String, DeviceError> {
        let query = serde_urlencoded::to_string(AuthorizeQuery {
            client_id: &self.secrets.client_id,
            response_type: "code",
            redirect_uri,
            scope: SCOPES.join(" "),
            state,
        })?;
        Ok(format!("{}/authorize?{}", self.accounts_url, query))
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, DeviceError>> {
        Box::pin(async move {
            debug!("Exchanging authorization code");
            self.request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .await
        })
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, DeviceError>> {
        Box::pin(async move {
            debug!("Refreshing access token");
            self.request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await
        })
    }

    fn current_playback<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, Result<Option<Playback>, DeviceError>> {
        Box::pin(self.fetch_playback(access_token))
    }
}
