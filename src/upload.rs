//! Chunked upload: precreate, block upload, create.
//!
//! The local bytes are split once into 4 MiB blocks. Precreate tells the server
//! every block hash; the server answers with the blocks it still needs (or that it
//! already has the whole file). Needed blocks go up in windows of at most
//! `concurrency` requests, and the next window starts only when the previous one
//! has fully settled. Create then commits the object with one hash per block in
//! index order.

use crate::api::{CreatedFile, PanClient};
use crate::chunker::{self, ContentBlock};
use crate::error;
use futures::future::join_all;
use std::{fmt, io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] error::Error),
    #[error("Upload of block {index} failed: {source}")]
    Block {
        index: usize,
        #[source]
        source: error::Error,
    },
    #[error("Could not read {}: {source}", .path.display())]
    LocalRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Server confirmed block {index} as {remote}, local hash is {local}")]
    HashMismatch {
        index: usize,
        local: String,
        remote: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UploadState {
    Precreating,
    Negotiated,
    UploadingBlocks,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            UploadState::Precreating => "precreating",
            UploadState::Negotiated => "negotiated",
            UploadState::UploadingBlocks => "uploading blocks",
            UploadState::Finalizing => "finalizing",
            UploadState::Done => "done",
            UploadState::Failed => "failed",
        };
        write!(f, "{}", result)
    }
}

/// Receives `(completed, total)` counts of pending blocks as they are confirmed.
pub trait ProgressObserver: Send + Sync {
    fn on_block_complete(&self, completed: usize, total: usize);
}

impl<F> ProgressObserver for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn on_block_complete(&self, completed: usize, total: usize) {
        self(completed, total)
    }
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub remote_path: String,
    pub total_size: u64,
    /// One hash per block, index-aligned.
    pub block_hashes: Vec<String>,
    pub upload_id: String,
    /// Ascending, deduplicated block indices the server still needs.
    pub pending: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The server already had this exact content, nothing was transferred.
    RapidUpload { path: String },
    Created(CreatedFile),
}

pub struct Uploader {
    client: PanClient,
    concurrency: usize,
    trust_server_hash: bool,
    observer: Option<Arc<dyn ProgressObserver>>,
    state: UploadState,
}

impl Uploader {
    pub fn new(client: PanClient) -> Self {
        let concurrency = client.config().concurrency.max(1);
        Uploader {
            client,
            concurrency,
            trust_server_hash: false,
            observer: None,
            state: UploadState::Precreating,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Accept a server-confirmed block hash even when it differs from the local one.
    pub fn trust_server_hash(mut self, trust: bool) -> Self {
        self.trust_server_hash = trust;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub async fn upload(&mut self, data: &[u8], remote_path: &str) -> Result<UploadOutcome, Error> {
        self.transition(UploadState::Precreating);
        let result = self.run(data, remote_path).await;
        if result.is_err() {
            self.transition(UploadState::Failed);
        }
        result
    }

    async fn run(&mut self, data: &[u8], remote_path: &str) -> Result<UploadOutcome, Error> {
        let (blocks, hashes) = chunker::split(data);
        info!(
            path = remote_path,
            size = data.len(),
            blocks = blocks.len(),
            "starting upload"
        );

        let mut session = match self.precreate(remote_path, data.len() as u64, hashes).await? {
            Some(session) => session,
            None => {
                info!(path = remote_path, "File already exists on server (rapid upload)");
                self.transition(UploadState::Done);
                return Ok(UploadOutcome::RapidUpload {
                    path: remote_path.to_owned(),
                });
            }
        };
        self.transition(UploadState::Negotiated);

        self.transition(UploadState::UploadingBlocks);
        self.upload_blocks(&blocks, &mut session).await?;

        self.transition(UploadState::Finalizing);
        let created = self
            .client
            .create_file(
                &session.remote_path,
                session.total_size,
                &session.upload_id,
                &session.block_hashes,
            )
            .await?;
        info!(path = %created.path, fs_id = created.fs_id, "Upload complete");

        self.transition(UploadState::Done);
        Ok(UploadOutcome::Created(created))
    }

    /// `None` when the server already holds the whole file.
    async fn precreate(
        &self,
        remote_path: &str,
        total_size: u64,
        block_hashes: Vec<String>,
    ) -> Result<Option<UploadSession>, Error> {
        let response = self
            .client
            .precreate(remote_path, total_size, &block_hashes)
            .await?;
        if response.is_rapid_upload() {
            return Ok(None);
        }

        let upload_id = response
            .uploadid
            .filter(|id| !id.is_empty())
            .ok_or_else(|| error::Error::Protocol("precreate answered without uploadid".to_owned()))?;

        let mut pending = response.block_list;
        if let Some(&index) = pending.iter().find(|&&i| i >= block_hashes.len()) {
            return Err(error::Error::Protocol(format!(
                "precreate asked for block {index}, file has {} blocks",
                block_hashes.len()
            ))
            .into());
        }
        pending.sort_unstable();
        pending.dedup();
        debug!(upload_id = %upload_id, pending = pending.len(), "precreate negotiated");

        Ok(Some(UploadSession {
            remote_path: remote_path.to_owned(),
            total_size,
            block_hashes,
            upload_id,
            pending,
        }))
    }

    async fn upload_blocks(
        &self,
        blocks: &[ContentBlock<'_>],
        session: &mut UploadSession,
    ) -> Result<(), Error> {
        let total = session.pending.len();
        let mut completed = 0;

        for window in session.pending.chunks(self.concurrency) {
            debug!(blocks = ?window, "uploading window");
            let uploads = window.iter().map(|&index| {
                let data: Arc<[u8]> = Arc::from(blocks[index].bytes);
                let client = &self.client;
                let upload_id = session.upload_id.as_str();
                let path = session.remote_path.as_str();
                async move { (index, client.upload_block(upload_id, path, index, data).await) }
            });

            // the window is a barrier, every request settles before the next one starts
            let results = join_all(uploads).await;

            let mut failure = None;
            for (index, result) in results {
                match result {
                    Ok(confirmed) => {
                        let local = &blocks[index].hash;
                        if !self.trust_server_hash && !confirmed.eq_ignore_ascii_case(local) {
                            failure.get_or_insert(Error::HashMismatch {
                                index,
                                local: local.clone(),
                                remote: confirmed,
                            });
                            continue;
                        }
                        session.block_hashes[index] = confirmed;
                        completed += 1;
                        if let Some(observer) = &self.observer {
                            observer.on_block_complete(completed, total);
                        }
                    }
                    Err(source) => {
                        failure.get_or_insert(Error::Block { index, source });
                    }
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }

        Ok(())
    }

    fn transition(&mut self, next: UploadState) {
        debug!("upload state {} -> {}", self.state, next);
        self.state = next;
    }
}
