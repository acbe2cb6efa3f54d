#![warn(missing_docs)]
//! SecFS share bootstrap: creates a share on in-memory servers and lists
//! its root.

use std::path::PathBuf;
use std::sync::Arc;

use secfs_crypto::UserKeys;
use secfs_meta::{GroupDirectory, Session, SessionConfig, UserDirectory, UserId};
use secfs_store::{MemoryBlockStore, MemoryVersionServer};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: secfs-init <owner-uid> [config.toml|config.json]");
        std::process::exit(1);
    }

    let owner = UserId::new(args[1].parse()?);
    let config = match args.get(2) {
        Some(path) => SessionConfig::from_file(&PathBuf::from(path))?,
        None => SessionConfig::default(),
    };
    tracing::info!(?config, "SecFS bootstrap starting");

    let keys = Arc::new(UserKeys::generate());
    let mut users = UserDirectory::new();
    users.insert(owner, keys.public_keys());

    let mut session = Session::new(
        config,
        Arc::new(MemoryBlockStore::new()),
        Arc::new(MemoryVersionServer::new()),
        users,
        GroupDirectory::new(),
    );
    session.register_keys(owner, keys);

    let root = session.init(owner)?;
    tracing::info!("Root directory: {}", root);
    for (entry, _) in session.readdir(owner, root, 0, None)? {
        tracing::info!(
            "  {} -> {}",
            String::from_utf8_lossy(&entry.name),
            entry.target
        );
    }
    Ok(())
}
