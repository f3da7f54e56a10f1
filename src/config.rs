//! Endpoints, limits and environment overrides.

use std::{env, time::Duration};
use tracing::warn;

pub const BASE_URL: &str = "https://pan.baidu.com";
pub const PCS_URL: &str = "https://d.pcs.baidu.com";
pub const OPENAPI_URL: &str = "https://openapi.baidu.com";

/// The user agent the PCS endpoints expect, downloads are refused without it.
pub const USER_AGENT: &str = "pan.baidu.com";

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub pcs_url: String,
    pub openapi_url: String,
    pub user_agent: String,
    /// Applied to every request except block uploads and downloads.
    pub timeout: Duration,
    /// Number of block uploads issued together in one window.
    pub concurrency: usize,
    /// Retries after the first attempt for network errors, 429 and 5xx.
    pub retries: u32,
    pub retry_base_delay: Duration,

    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub app_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: BASE_URL.to_owned(),
            pcs_url: PCS_URL.to_owned(),
            openapi_url: OPENAPI_URL.to_owned(),
            user_agent: USER_AGENT.to_owned(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            retries: DEFAULT_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            access_token: None,
            refresh_token: None,
            app_key: None,
            secret_key: None,
        }
    }
}

impl Config {
    /// Loads a `.env` file if there is one, then reads the process environment.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let concurrency = match non_empty("XPAN_CONCURRENCY") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!("ignoring invalid XPAN_CONCURRENCY value {raw:?}");
                    DEFAULT_CONCURRENCY
                }
            },
            None => DEFAULT_CONCURRENCY,
        };

        Config {
            concurrency,
            access_token: non_empty("BAIDU_ACCESS_TOKEN"),
            refresh_token: non_empty("BAIDU_REFRESH_TOKEN"),
            app_key: non_empty("BAIDU_APP_KEY"),
            secret_key: non_empty("BAIDU_SECRET_KEY"),
            ..Config::default()
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth/2.0/token", self.openapi_url)
    }
    pub fn file_url(&self) -> String {
        format!("{}/rest/2.0/xpan/file", self.base_url)
    }
    pub fn multimedia_url(&self) -> String {
        format!("{}/rest/2.0/xpan/multimedia", self.base_url)
    }
    pub fn nas_url(&self) -> String {
        format!("{}/rest/2.0/xpan/nas", self.base_url)
    }
    pub fn quota_url(&self) -> String {
        format!("{}/api/quota", self.base_url)
    }
    pub fn superfile_url(&self) -> String {
        format!("{}/rest/2.0/pcs/superfile2", self.pcs_url)
    }
}
