//! OAuth2 authorize/exchange/refresh flows, kept from the browser-flow UI
//! boundary: this crate only needs to *use* tokens, but refreshing an
//! expired one (triggered from [`crate::TokenStore::check`]) still needs a
//! full token-endpoint round trip.

use std::borrow::Cow;

use anyhow::{anyhow, Result};
use chrono::Utc;
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::info;

use crate::{Credential, Provider};

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthBridge {
    http_client: Client,
}

impl Default for AuthBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthBridge {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http_client }
    }

    pub fn authorize_url(&self, config: &OAuthConfig, scopes: &[&str]) -> Result<(String, CsrfToken)> {
        let client = build_client(config)?;
        let mut req = client.authorize_url(CsrfToken::new_random);
        for scope in scopes {
            req = req.add_scope(Scope::new(scope.to_string()));
        }
        let (url, csrf) = req.url();
        Ok((url.to_string(), csrf))
    }

    pub async fn exchange_code(&self, provider: Provider, code: &str, config: &OAuthConfig) -> Result<Credential> {
        let client = build_client(config)?;
        let mut req = client.exchange_code(AuthorizationCode::new(code.to_string()));
        if let Some(redirect_uri) = &config.redirect_uri {
            req = req.set_redirect_uri(Cow::Owned(RedirectUrl::new(redirect_uri.to_string())?));
        }
        let token = req.request_async(&self.http_client).await?;
        info!("exchanged OAuth code for {} token", provider.as_str());
        Ok(token_response_to_credential(provider, &token))
    }

    pub async fn refresh_token(&self, provider: Provider, refresh_token: &str, config: &OAuthConfig) -> Result<Credential> {
        let client = build_client(config)?;
        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http_client)
            .await?;
        Ok(token_response_to_credential(provider, &token))
    }
}

fn token_response_to_credential(
    provider: Provider,
    token: &oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>,
) -> Credential {
    let access_token = token.access_token().secret().to_string();
    let refresh_token = token.refresh_token().map(|t| t.secret().to_string());
    let expires_at = token
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);
    let scope = token.scopes().map(|scopes| {
        scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
    });
    let token_type = Some(token.token_type().as_ref().to_string());

    Credential {
        provider,
        access_token,
        refresh_token,
        expires_at,
        scope,
        token_type,
    }
}

type ConfiguredClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

fn build_client(config: &OAuthConfig) -> Result<ConfiguredClient> {
    let auth_url = AuthUrl::new(config.auth_url.clone()).map_err(|_| anyhow!("invalid auth_url"))?;
    let token_url = TokenUrl::new(config.token_url.clone()).map_err(|_| anyhow!("invalid token_url"))?;
    let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
        .set_client_secret(ClientSecret::new(config.client_secret.clone()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url);
    if let Some(redirect_uri) = &config.redirect_uri {
        client = client.set_redirect_uri(RedirectUrl::new(redirect_uri.clone())?);
    }
    Ok(client)
}
