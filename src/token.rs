//! Access token cache and single-flight refresh.
//!
//! Baidu rotates the refresh token on use, so two refreshes racing each other can
//! leave the second one holding a dead token. [`TokenManager::refresh`] shares one
//! in-flight refresh between every caller that asks while it is outstanding.

use crate::config::Config;
use crate::credential::{CredentialRecord, CredentialStore};
use crate::error::{is_retryable_status, Error};
use crate::transport::{ApiRequest, Transport};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// `-6`: invalid access token, `111`: access token expired.
pub const EXPIRY_ERRNOS: [i64; 2] = [-6, 111];

pub fn is_expiry_error(errno: i64) -> bool {
    EXPIRY_ERRNOS.contains(&errno)
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, Arc<Error>>>>;

#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    transport: Transport,
    token_url: String,
    access_override: Option<String>,
    refresh_override: Option<String>,
    app_key_override: Option<String>,
    secret_key_override: Option<String>,
    current: RwLock<Option<String>>,
    in_flight: Mutex<Option<RefreshFuture>>,
}

struct RefreshGrant {
    refresh_token: String,
    app_key: String,
    secret_key: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl TokenManager {
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>, transport: Transport) -> Self {
        TokenManager {
            inner: Arc::new(Inner {
                store,
                transport,
                token_url: config.token_url(),
                access_override: config.access_token.clone(),
                refresh_override: config.refresh_token.clone(),
                app_key_override: config.app_key.clone(),
                secret_key_override: config.secret_key.clone(),
                current: RwLock::new(None),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Cached token first, then the environment override, then the credential store.
    pub fn get_token(&self) -> Result<String, Error> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let token = match &self.inner.access_override {
            Some(token) => token.clone(),
            None => self
                .inner
                .store
                .load()?
                .access_token
                .filter(|t| !t.is_empty())
                .ok_or_else(Error::auth_missing)?,
        };
        self.set_token(token.clone());
        Ok(token)
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_expiry_error(&self, errno: i64) -> bool {
        is_expiry_error(errno)
    }

    /// Stored expiry in milliseconds since the Unix epoch.
    pub fn expires_at(&self) -> Result<Option<i64>, Error> {
        Ok(self.inner.store.load()?.expires_at)
    }

    pub fn is_expired(&self, now_ms: i64) -> Result<bool, Error> {
        Ok(self.expires_at()?.map_or(false, |at| at <= now_ms))
    }

    /// Refreshes the access token, joining an outstanding refresh if there is one.
    ///
    /// Fails with [`Error::AuthMissing`] without touching the network when the
    /// refresh token or the app credentials are unknown. On any other failure the
    /// cached token is left in place.
    pub async fn refresh(&self) -> Result<String, Error> {
        let refresh = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(outstanding) => {
                    debug!("joining outstanding token refresh");
                    outstanding.clone()
                }
                None => {
                    let grant = self.inner.grant()?;
                    let inner = self.inner.clone();
                    let refresh = async move {
                        let result = inner.request_refresh(grant).await.map_err(Arc::new);
                        *inner
                            .in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await.map_err(Error::RefreshFailed)
    }

    fn cached(&self) -> Option<String> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Inner {
    fn grant(&self) -> Result<RefreshGrant, Error> {
        let record = self.store.load()?;
        let refresh_token = self.refresh_override.clone().or(record.refresh_token);
        let app_key = self.app_key_override.clone().or(record.app_key);
        let secret_key = self.secret_key_override.clone().or(record.secret_key);

        match (refresh_token, app_key, secret_key) {
            (Some(refresh_token), Some(app_key), Some(secret_key)) => Ok(RefreshGrant {
                refresh_token,
                app_key,
                secret_key,
            }),
            _ => Err(Error::AuthMissing(
                "Cannot refresh the access token: refresh token or app credentials missing. \
                 Please authorize again"
                    .to_owned(),
            )),
        }
    }

    async fn request_refresh(&self, grant: RefreshGrant) -> Result<String, Error> {
        info!("Access token expired, refreshing...");

        let request = ApiRequest::get(self.token_url.as_str())
            .query("grant_type", "refresh_token")
            .query("refresh_token", &grant.refresh_token)
            .query("client_id", &grant.app_key)
            .query("client_secret", &grant.secret_key);

        // a rejected grant comes back as HTTP 400 with an `error` body
        let body = match self.transport.send(&request).await {
            Ok(response) => response.text(),
            Err(Error::Http { status, body }) if !is_retryable_status(status) => body,
            Err(e) => {
                warn!("Failed to refresh token: {e}");
                return Err(e);
            }
        };
        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| Error::SerdeJSONError(e, body.clone()))?;

        let access_token = match (parsed.access_token, parsed.error) {
            (Some(token), _) if !token.is_empty() => token,
            (_, Some(error)) => {
                let description = parsed.error_description.unwrap_or_default();
                warn!("Failed to refresh token: {error}: {description}");
                return Err(Error::Refresh(format!("{error}: {description}")));
            }
            _ => return Err(Error::Protocol("token response without access_token".to_owned())),
        };

        // persist before anyone gets to use the new token
        let previous = self.store.load()?;
        let record = CredentialRecord {
            access_token: Some(access_token.clone()),
            refresh_token: parsed.refresh_token.or(Some(grant.refresh_token)),
            expires_at: parsed
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp_millis() + secs * 1000),
            ..previous
        };
        self.store.save(&record)?;

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(access_token.clone());
        info!("Token refreshed and saved");
        Ok(access_token)
    }
}
