use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::thread;
use std::time::Duration as StdDuration;

use crate::credentials::{self, CachedAccount, TokenCacheStore};
use crate::error::SyncError;

const AUTHORITY: &str = "https://login.microsoftonline.com/common/oauth2/v2.0";

/// Graph permissions are fixed. The trailing three are OAuth plumbing: the
/// device-code flow needs offline_access for a refresh token and
/// openid/profile for an id token carrying the username.
const SCOPES: &str = "User.Read Tasks.Read Calendars.ReadWrite offline_access openid profile";

/// Access-token expiry is treated as stale slightly early so a token does
/// not lapse mid-request.
const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub username: String,
}

/// Identity-provider boundary. The live implementation talks to the
/// Microsoft identity platform; tests substitute a stub.
pub trait IdentityProvider {
    fn refresh(&self, username: &str, refresh_token: &str) -> Result<AuthOutcome, SyncError>;
    fn acquire_interactive(&self) -> Result<AuthOutcome, SyncError>;
}

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: Option<u64>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
    id_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct IdTokenClaims {
    preferred_username: Option<String>,
    email: Option<String>,
}

/// Device-code OAuth client for the Microsoft identity platform v2.0
/// endpoints.
pub struct DeviceCodeProvider {
    http: Client,
    app_id: String,
}

impl DeviceCodeProvider {
    pub fn new(app_id: &str) -> Self {
        Self {
            http: Client::new(),
            app_id: app_id.to_string(),
        }
    }

    fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, SyncError> {
        let resp = self
            .http
            .post(format!("{AUTHORITY}/token"))
            .form(params)
            .send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(SyncError::Auth(format_token_error(status, &body)));
        }
        resp.json::<TokenResponse>()
            .map_err(|e| SyncError::Auth(e.to_string()))
    }

    fn poll_for_token(&self, device: &DeviceCodeResponse) -> Result<TokenResponse, SyncError> {
        let deadline = Utc::now() + Duration::seconds(device.expires_in as i64);
        let mut interval = device.interval.unwrap_or(5);

        loop {
            if Utc::now() >= deadline {
                return Err(SyncError::Auth(
                    "Device code expired before sign-in completed".to_string(),
                ));
            }
            thread::sleep(StdDuration::from_secs(interval));

            let resp = self
                .http
                .post(format!("{AUTHORITY}/token"))
                .form(&[
                    ("client_id", self.app_id.as_str()),
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                    ("device_code", device.device_code.as_str()),
                ])
                .send()?;

            if resp.status().is_success() {
                return resp
                    .json::<TokenResponse>()
                    .map_err(|e| SyncError::Auth(e.to_string()));
            }

            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) if err.error == "authorization_pending" => {}
                Ok(err) if err.error == "slow_down" => interval += 5,
                Ok(err) => {
                    let desc = err.error_description.unwrap_or_default();
                    return Err(SyncError::Auth(format!("{} {}", err.error, desc)));
                }
                Err(_) => return Err(SyncError::Auth(format_token_error(status, &body))),
            }
        }
    }
}

impl IdentityProvider for DeviceCodeProvider {
    fn refresh(&self, username: &str, refresh_token: &str) -> Result<AuthOutcome, SyncError> {
        let token = self.token_request(&[
            ("client_id", self.app_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", SCOPES),
        ])?;
        Ok(outcome_from_token(token, refresh_token, username))
    }

    fn acquire_interactive(&self) -> Result<AuthOutcome, SyncError> {
        let resp = self
            .http
            .post(format!("{AUTHORITY}/devicecode"))
            .form(&[("client_id", self.app_id.as_str()), ("scope", SCOPES)])
            .send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(SyncError::Auth(format_token_error(status, &body)));
        }
        let device: DeviceCodeResponse =
            resp.json().map_err(|e| SyncError::Auth(e.to_string()))?;

        match &device.message {
            Some(message) => println!("{message}"),
            None => println!(
                "To sign in, open {} and enter the code {}",
                device.verification_uri, device.user_code
            ),
        }
        // Best effort; the printed URI is enough on headless machines.
        let _ = open::that(&device.verification_uri);

        let token = self.poll_for_token(&device)?;
        let username = token
            .id_token
            .as_deref()
            .and_then(username_from_id_token)
            .ok_or_else(|| {
                SyncError::Auth("Sign-in response carried no usable username claim".to_string())
            })?;
        Ok(outcome_from_token(token, "", &username))
    }
}

fn outcome_from_token(token: TokenResponse, fallback_refresh: &str, username: &str) -> AuthOutcome {
    AuthOutcome {
        refresh_token: token
            .refresh_token
            .unwrap_or_else(|| fallback_refresh.to_string()),
        expires_at: (Utc::now() + Duration::seconds(token.expires_in as i64)).timestamp(),
        username: username.to_string(),
        access_token: token.access_token,
    }
}

fn username_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: IdTokenClaims = serde_json::from_slice(&bytes).ok()?;
    claims.preferred_username.or(claims.email)
}

fn format_token_error(status: reqwest::StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {status}");
    }
    let summary = if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(trimmed) {
        if let Some(desc) = err.error_description {
            format!("{} ({})", desc, err.error)
        } else {
            err.error
        }
    } else {
        let mut out = trimmed.replace(['\n', '\r'], " ");
        if out.len() > 240 {
            out.truncate(240);
            out.push_str("...");
        }
        out
    };
    format!("HTTP {status}: {summary}")
}

/// Bearer-token source for every outbound Graph request. Silent acquisition
/// against the cached previous user is tried first; the interactive
/// device-code flow is the fallback. A total failure is returned as an
/// error rather than sending an unauthenticated request.
pub struct Authenticator<P: IdentityProvider> {
    provider: P,
    store: TokenCacheStore,
    data_dir: PathBuf,
}

impl<P: IdentityProvider> Authenticator<P> {
    pub fn new(provider: P, store: TokenCacheStore, data_dir: PathBuf) -> Self {
        Self {
            provider,
            store,
            data_dir,
        }
    }

    pub fn access_token(&self) -> Result<String, SyncError> {
        if let Some(username) = credentials::load_previous_user(&self.data_dir) {
            match self.acquire_silent(&username) {
                Ok(token) => return Ok(token),
                Err(err) => {
                    eprintln!(
                        "Silent sign-in for {username} failed ({}); starting interactive sign-in",
                        err.message()
                    );
                }
            }
        }

        let outcome = self.provider.acquire_interactive()?;
        credentials::save_previous_user(&self.data_dir, &outcome.username)?;
        self.store.with_cache(|cache| {
            cache.insert(
                &outcome.username,
                CachedAccount {
                    access_token: outcome.access_token.clone(),
                    refresh_token: outcome.refresh_token.clone(),
                    expires_at: outcome.expires_at,
                },
            );
        })?;
        Ok(outcome.access_token)
    }

    fn acquire_silent(&self, username: &str) -> Result<String, SyncError> {
        let cached = self
            .store
            .with_cache(|cache| cache.account(username).cloned())?
            .ok_or_else(|| SyncError::Auth(format!("no cached tokens for {username}")))?;

        let now = Utc::now().timestamp();
        if cached.expires_at > now + EXPIRY_SKEW_SECONDS {
            return Ok(cached.access_token);
        }

        let refreshed = self.provider.refresh(username, &cached.refresh_token)?;
        self.store.with_cache(|cache| {
            cache.insert(
                username,
                CachedAccount {
                    access_token: refreshed.access_token.clone(),
                    refresh_token: refreshed.refresh_token.clone(),
                    expires_at: refreshed.expires_at,
                },
            );
        })?;
        Ok(refreshed.access_token)
    }
}
