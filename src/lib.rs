//! `xpan` is a crate to upload and download files on [Baidu Pan](https://pan.baidu.com)
//! through its open platform API.
//!
//! These features are supported:
//! * Chunked uploads in 4 MiB blocks with server-side deduplication ("rapid upload"):
//!   only the blocks the server does not already hold are transferred.
//! * Bounded concurrent block uploads.
//! * Transparent access token refresh, shared by every request that runs into an
//!   expired token at the same time.
//! * Retry with exponential backoff on network errors, HTTP 429 and HTTP 5xx.
//! * Directory listing, file metadata and streamed downloads.
//!
//! ## Configuration
//! Credentials are read from `~/.baidupan-cli/config.json` (see [`credential::FileStore`])
//! and can be overridden with `BAIDU_ACCESS_TOKEN`, `BAIDU_REFRESH_TOKEN`,
//! `BAIDU_APP_KEY` and `BAIDU_SECRET_KEY`. `XPAN_CONCURRENCY` sets the number of
//! block uploads in flight.
//!
//! ## Example
//!
//! To upload a single file:
//! ```rust,no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use xpan::{api::PanClient, config::Config, credential::FileStore, helper};
//!
//! let store = FileStore::new(FileStore::default_path().ok_or("no home directory")?);
//! let client = PanClient::new(Config::from_env(), Arc::new(store))?;
//! let outcome = helper::upload_file(
//!     &client,
//!     "backup.tar.gz",  // the local file
//!     "/apps/backup/",  // the remote directory, a trailing `/` keeps the local name
//!     Some(Arc::new(|done: usize, total: usize| println!("{done}/{total} blocks"))),
//! )
//! .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod chunker;
pub mod config;
pub mod credential;
pub mod download;
pub mod error;
pub mod helper;
pub mod logging;
pub mod token;
pub mod transport;
pub mod upload;

pub use error::Error;
