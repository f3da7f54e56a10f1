use super::api::PanClient;
use super::download::{self, Downloader, ProgressListener};
use super::upload::{self, ProgressObserver, UploadOutcome, Uploader};
use async_recursion::async_recursion;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Local path does not exist: {0}")]
    LocalNotFound(PathBuf),
    #[error("Upload error: {0}")]
    UploadError(#[from] upload::Error),
    #[error("Download error: {0}")]
    DownloadError(#[from] download::Error),
    #[error("Uploaded {uploaded} of {total} files before {file} failed: {source}")]
    PartialDirectory {
        uploaded: usize,
        total: usize,
        file: String,
        #[source]
        source: upload::Error,
    },
}

#[derive(Debug, Clone)]
pub struct LocalFile {
    pub local_path: PathBuf,
    /// `/`-separated path relative to the walked directory.
    pub relative_path: String,
}

#[derive(Debug, Clone)]
pub struct DirUploadReport {
    pub uploaded: usize,
    pub outcomes: Vec<(String, UploadOutcome)>,
}

/// Ensures a remote path starts with `/`.
pub fn normalize_path(remote_path: &str) -> String {
    if remote_path.starts_with('/') {
        remote_path.to_owned()
    } else {
        format!("/{remote_path}")
    }
}

/// A remote target ending with `/` means "into this directory, keep the local name".
pub fn resolve_remote_target(local_path: &Path, remote_path: &str) -> String {
    let remote = normalize_path(remote_path);
    match local_path.file_name().and_then(|x| x.to_str()) {
        Some(name) if remote.ends_with('/') => format!("{remote}{name}"),
        _ => remote,
    }
}

fn gen_uploader(client: &PanClient, observer: Option<Arc<dyn ProgressObserver>>) -> Uploader {
    let uploader = Uploader::new(client.clone());
    match observer {
        Some(observer) => uploader.observer(observer),
        None => uploader,
    }
}

pub async fn upload_bytes(
    client: &PanClient,
    data: &[u8],
    remote_path: &str,
    observer: Option<Arc<dyn ProgressObserver>>,
) -> Result<UploadOutcome, Error> {
    let remote_path = normalize_path(remote_path);
    let outcome = gen_uploader(client, observer)
        .upload(data, &remote_path)
        .await?;
    Ok(outcome)
}

pub async fn upload_file(
    client: &PanClient,
    local_path: impl AsRef<Path>,
    remote_path: &str,
    observer: Option<Arc<dyn ProgressObserver>>,
) -> Result<UploadOutcome, Error> {
    let local_path = local_path.as_ref();
    if !local_path.exists() {
        return Err(Error::LocalNotFound(local_path.to_owned()));
    }
    let data = tokio::fs::read(local_path).await?;
    let remote_path = resolve_remote_target(local_path, remote_path);
    upload_bytes(client, &data, &remote_path, observer).await
}

/// Uploads every file under `local_dir` one after another.
///
/// Files uploaded before a failure stay on the server; the error reports how many
/// made it.
pub async fn upload_dir(
    client: &PanClient,
    local_dir: impl AsRef<Path>,
    remote_dir: &str,
    observer: Option<Arc<dyn ProgressObserver>>,
) -> Result<DirUploadReport, Error> {
    let local_dir = local_dir.as_ref();
    if !local_dir.exists() {
        return Err(Error::LocalNotFound(local_dir.to_owned()));
    }
    let files = collect_files(local_dir).await?;
    info!("Found {} files to upload", files.len());
    upload_files(client, files, remote_dir, observer).await
}

/// Uploads `files` below `remote_dir`, keeping their relative paths.
pub async fn upload_files(
    client: &PanClient,
    files: Vec<LocalFile>,
    remote_dir: &str,
    observer: Option<Arc<dyn ProgressObserver>>,
) -> Result<DirUploadReport, Error> {
    let total = files.len();
    let remote_dir = normalize_path(remote_dir.trim_end_matches('/'));
    let mut report = DirUploadReport {
        uploaded: 0,
        outcomes: Vec::with_capacity(total),
    };

    for file in files {
        let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), file.relative_path);
        info!("Uploading: {}", file.relative_path);

        let result = match tokio::fs::read(&file.local_path).await {
            Ok(data) => {
                gen_uploader(client, observer.clone())
                    .upload(&data, &remote_path)
                    .await
            }
            Err(source) => Err(upload::Error::LocalRead {
                path: file.local_path.clone(),
                source,
            }),
        };
        match result {
            Ok(outcome) => {
                report.uploaded += 1;
                report.outcomes.push((remote_path, outcome));
                info!("Progress: {}/{} files", report.uploaded, total);
            }
            Err(source) => {
                return Err(Error::PartialDirectory {
                    uploaded: report.uploaded,
                    total,
                    file: file.relative_path,
                    source,
                })
            }
        }
    }

    Ok(report)
}

/// Regular files under `dir`, depth first, sorted by name within each directory.
pub async fn collect_files(dir: &Path) -> io::Result<Vec<LocalFile>> {
    let mut files = vec![];
    walk(dir, String::new(), &mut files).await?;
    Ok(files)
}

#[async_recursion]
async fn walk(dir: &Path, prefix: String, files: &mut Vec<LocalFile>) -> io::Result<()> {
    let mut entries = vec![];
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        entries.push(entry);
    }
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative_path = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            walk(&entry.path(), relative_path, files).await?;
        } else if file_type.is_file() {
            files.push(LocalFile {
                local_path: entry.path(),
                relative_path,
            });
        }
    }
    Ok(())
}

/// Downloads `remote_path` to `local_path`; a directory target keeps the remote name.
///
/// The body goes to a `.part` file beside the target, which replaces the target only
/// once the whole file has arrived.
pub async fn download_file(
    client: &PanClient,
    remote_path: &str,
    local_path: impl AsRef<Path>,
    progress_listener: Option<ProgressListener>,
) -> Result<PathBuf, Error> {
    let remote_path = normalize_path(remote_path);
    let local_path = local_path.as_ref();
    let target = if local_path.is_dir() {
        let (_, name) = download::split_remote(&remote_path);
        local_path.join(name)
    } else {
        local_path.to_owned()
    };
    let partial = partial_path(&target);

    let mut file = tokio::fs::File::create(&partial).await?;
    let result = Downloader::new(client.clone(), progress_listener)
        .download(&remote_path, &mut file)
        .await;
    drop(file);

    if let Err(e) = result {
        if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
            warn!("Could not remove {}: {cleanup}", partial.display());
        }
        return Err(e.into());
    }
    tokio::fs::rename(&partial, &target).await?;
    info!("Saved to: {}", target.display());
    Ok(target)
}

/// `dir/name.ext` -> `dir/name.ext.part`
fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_owned();
    name.push(".part");
    target.with_file_name(name)
}
