use anyhow::Result;
use std::env;
use std::path::Path;
use std::sync::Arc;
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
        [_, local, remote] => upload(local, remote).await,
        _ => panic!(
            "
        Please input the local file or directory and the remote path
        Example:
            cargo run --example upload ./backup.tar.gz /apps/backup/
        "
        ),
    }
}

async fn upload(local: &str, remote: &str) -> Result<()> {
    let store = FileStore::new(FileStore::default_path().expect("no home directory"));
    let client = PanClient::new(Config::from_env(), Arc::new(store))?;

    if Path::new(local).is_dir() {
        let report = helper::upload_dir(&client, local, remote, None).await?;
        for (path, outcome) in report.outcomes {
            println!("{path}: {outcome:?}");
        }
    } else {
        let outcome = helper::upload_file(
            &client,
            local,
            remote,
            Some(Arc::new(|done: usize, total: usize| {
                println!("blocks: {done}/{total}");
            })),
        )
        .await?;
        println!("{outcome:?}");
    }
    Ok(())
}
