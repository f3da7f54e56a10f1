use anyhow::Result;
use std::env;
use std::sync::{Arc, Mutex};
use xpan::api::PanClient;
use xpan::config::Config;
use xpan::credential::FileStore;
use xpan::helper;
use xpan::logging::{self, Verbosity};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(Verbosity::Normal);
    let args = env::args().collect::<Vec<_>>();

    match args.as_slice() {
        [_, remote, local] => download(remote, local).await,
        _ => panic!(
            "
        Please input the remote file path and the local path to save it to
        Example:
            cargo run --example download /apps/backup/backup.tar.gz ./
        "
        ),
    }
}

async fn download(remote: &str, local: &str) -> Result<()> {
    let store = FileStore::new(FileStore::default_path().expect("no home directory"));
    let client = PanClient::new(Config::from_env(), Arc::new(store))?;

    let saved = helper::download_file(
        &client,
        remote,
        local,
        Some(Arc::new(Mutex::new(|written: u64, total: u64| {
            println!("{written}/{total}");
        }))),
    )
    .await?;

    println!("{remote} downloaded to path: {}", saved.display());
    Ok(())
}
