//! Identity provider seam
//!
//! The API never talks to a directory directly; it asks an
//! [`IdentityProvider`] to exchange an OAuth code and to list the groups of
//! an access token. [`OidcIdentityProvider`] implements the generic
//! authorization-code flow against a token and userinfo endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::permissions::Team;

/// Public client information for the login page
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// OAuth client id
    pub client_id: String,
    /// Provider name
    pub provider: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Authorization endpoint
    pub auth_url: String,
}

/// Normalized user returned after login
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Directory user id
    pub id: String,
    /// Display name
    pub name: String,
    /// E-mail
    pub email: String,
    /// Avatar URL
    #[serde(default)]
    pub avatar_url: String,
    /// Provider name
    pub provider: String,
}

/// Result of a code exchange
#[derive(Clone, Debug)]
pub struct LoginResult {
    /// The user
    pub user: UserInfo,
    /// Access token for later group lookups
    pub access_token: String,
    /// Token lifetime in seconds
    pub expires_in: i64,
}

/// Upstream identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider name used in routes (`/oauth/{provider}/callback`)
    fn name(&self) -> &str;

    /// Login page parameters
    fn client_info(&self) -> ClientInfo;

    /// Exchange an authorization code for a user and token
    async fn exchange_code(&self, code: &str) -> Result<LoginResult>;

    /// Current directory groups of the token's user
    async fn groups(&self, access_token: &str) -> Result<Vec<Team>>;
}

/// Settings for the generic OIDC provider
#[derive(Clone, Debug)]
pub struct OidcSettings {
    /// Provider name
    pub provider: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Redirect URI
    pub redirect_uri: String,
    /// Authorization endpoint
    pub auth_url: String,
    /// Token endpoint
    pub token_url: String,
    /// Userinfo endpoint
    pub userinfo_url: String,
    /// Userinfo claim holding groups
    pub groups_claim: String,
}

/// OIDC authorization-code flow over reqwest
pub struct OidcIdentityProvider {
    settings: OidcSettings,
    http: reqwest::Client,
}

impl OidcIdentityProvider {
    /// Create a provider with a bounded HTTP timeout
    pub fn new(settings: OidcSettings, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { settings, http })
    }

    async fn userinfo(&self, access_token: &str) -> Result<UserInfoClaims> {
        let resp = self
            .http
            .get(&self.settings.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized("access token rejected".into()));
        }
        Ok(resp.error_for_status()?.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UserInfoClaims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    picture: Option<String>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

/// Groups claim can be a list of names/ids, a list of objects, or one value
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GroupsClaim {
    Teams(Vec<Team>),
    Names(Vec<String>),
    Single(String),
}

fn groups_from_claim(value: Option<&serde_json::Value>) -> Vec<Team> {
    let Some(value) = value else {
        return Vec::new();
    };
    match serde_json::from_value::<GroupsClaim>(value.clone()) {
        Ok(GroupsClaim::Teams(teams)) => teams,
        Ok(GroupsClaim::Names(names)) => names.into_iter().map(|n| Team::new(n.clone(), n)).collect(),
        Ok(GroupsClaim::Single(n)) => vec![Team::new(n.clone(), n)],
        Err(e) => {
            debug!(error = %e, "unrecognized groups claim");
            Vec::new()
        }
    }
}

#[async_trait]
impl IdentityProvider for OidcIdentityProvider {
    fn name(&self) -> &str {
        &self.settings.provider
    }

    fn client_info(&self) -> ClientInfo {
        ClientInfo {
            client_id: self.settings.client_id.clone(),
            provider: self.settings.provider.clone(),
            redirect_uri: self.settings.redirect_uri.clone(),
            auth_url: self.settings.auth_url.clone(),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<LoginResult> {
        let resp = self
            .http
            .post(&self.settings.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ])
            .send()
            .await?;
        if resp.status().is_client_error() {
            return Err(Error::BadRequest("authorization code rejected".into()));
        }
        let token: TokenResponse = resp.error_for_status()?.json().await?;
        let claims = self.userinfo(&token.access_token).await?;

        let name = claims
            .name
            .or(claims.preferred_username)
            .unwrap_or_else(|| claims.sub.clone());
        Ok(LoginResult {
            user: UserInfo {
                id: claims.sub,
                name,
                email: claims.email.unwrap_or_default(),
                avatar_url: claims.picture.unwrap_or_default(),
                provider: self.settings.provider.clone(),
            },
            access_token: token.access_token,
            expires_in: token.expires_in.unwrap_or(3600),
        })
    }

    async fn groups(&self, access_token: &str) -> Result<Vec<Team>> {
        let claims = self.userinfo(access_token).await?;
        Ok(groups_from_claim(
            claims.extra.get(&self.settings.groups_claim),
        ))
    }
}
