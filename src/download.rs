use crate::api::{FileEntry, ListOptions, PanClient};
use crate::error;
use futures::StreamExt;
use std::{
    io,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] error::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Cannot download a directory: {0}")]
    IsDirectory(String),
    #[error("Could not get download link for {0}")]
    NoDownloadLink(String),
    #[error("The IO error: {0:?}")]
    IOError(#[from] io::Error),
}

/// Called with `(written, total)` byte counts; `total` is 0 when the server does not say.
pub type ProgressListener = Arc<Mutex<dyn FnMut(u64, u64) + Send + 'static>>;

pub struct Downloader {
    client: PanClient,
    progress_listener: Option<ProgressListener>,
}

impl Downloader {
    pub fn new(client: PanClient, progress_listener: Option<ProgressListener>) -> Self {
        Downloader {
            client,
            progress_listener,
        }
    }

    /// Finds `remote_path` by listing its parent directory, page by page.
    pub async fn locate(&self, remote_path: &str) -> Result<FileEntry, Error> {
        let (dir, name) = split_remote(remote_path);
        let mut options = ListOptions::default();
        loop {
            let page = self.client.list_files(dir, options).await?;
            let page_len = page.len();
            if let Some(entry) = page
                .into_iter()
                .find(|e| e.server_filename == name || e.path == remote_path)
            {
                return Ok(entry);
            }
            if page_len < options.limit as usize {
                return Err(Error::NotFound(remote_path.to_owned()));
            }
            options.start += options.limit;
        }
    }

    /// Streams the file at `remote_path` into `writer` and returns the number of bytes written.
    pub async fn download<W: AsyncWrite + Unpin>(
        &mut self,
        remote_path: &str,
        writer: &mut W,
    ) -> Result<u64, Error> {
        let entry = self.locate(remote_path).await?;
        if entry.is_dir() {
            return Err(Error::IsDirectory(remote_path.to_owned()));
        }
        info!(path = remote_path, size = entry.size, "found file");

        debug!("Getting download link...");
        let dlink = self
            .client
            .file_metas(&[entry.fs_id], true)
            .await?
            .into_iter()
            .next()
            .and_then(|meta| meta.dlink)
            .ok_or_else(|| Error::NoDownloadLink(remote_path.to_owned()))?;

        let mut resp = self.client.open_download(&dlink).await?;
        let total_len = resp.content_length.unwrap_or(entry.size);

        let mut written_len = 0u64;
        while let Some(chunk) = resp.body.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written_len += chunk.len() as u64;

            if let Some(pl) = self.progress_listener.as_ref() {
                if let Ok(mut f) = pl.lock() {
                    f(written_len, total_len);
                }
            }
        }
        writer.flush().await?;

        info!(path = remote_path, bytes = written_len, "Download complete");
        Ok(written_len)
    }
}

/// `/a/b/c.txt` -> (`/a/b`, `c.txt`), `/c.txt` -> (`/`, `c.txt`).
pub(crate) fn split_remote(remote_path: &str) -> (&str, &str) {
    match remote_path.rfind('/') {
        Some(0) => ("/", &remote_path[1..]),
        Some(pos) => (&remote_path[..pos], &remote_path[pos + 1..]),
        None => ("/", remote_path),
    }
}
