use anyhow::Result;
use std::env;
use std::sync::Arc;
use xpan::api::{ListOptions, PanClient};
use xpan::config::Config;
use xpan::credential::FileStore;
use xpan::logging::{self, Verbosity};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(Verbosity::Quiet);
    let args = env::args().collect::<Vec<_>>();

    let dir = match args.as_slice() {
        [_] => "/",
        [_, dir] => dir.as_str(),
        _ => panic!(
            "
        Please input the remote directory to list
        Example:
            cargo run --example list /apps
        "
        ),
    };

    let store = FileStore::new(FileStore::default_path().expect("no home directory"));
    let client = PanClient::new(Config::from_env(), Arc::new(store))?;

    let user = client.user_info().await?;
    let quota = client.quota().await?;
    println!("user: {} ({} / {} bytes used)", user.baidu_name, quota.used, quota.total);

    for entry in client.list_files(dir, ListOptions::default()).await? {
        let kind = if entry.is_dir() { "d" } else { "-" };
        println!("{kind} {:>12} {}", entry.size, entry.path);
    }
    Ok(())
}
