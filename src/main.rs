use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use serde::Serialize;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod test_utils;

use config::{AttributeKeys, ChainArgs, Cli, Command, StoreConfig};
use models::object::Attribute;
use services::{
    archiver::Archiver,
    ledger::DumpLedger,
    local_store::LocalObjectStore,
    object_store::{HOMOMORPHIC_DISABLED_ATTR, MAGIC_ATTR},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config ---
    let cli = Cli::parse();
    let store_cfg = StoreConfig::from_env_and_args(&cli)?;
    tracing::info!("Starting block-archiver with store config: {:?}", store_cfg);

    // --- Open the local object store ---
    let store = Arc::new(
        LocalObjectStore::connect(&store_cfg.database_url, &store_cfg.storage_dir)
            .await
            .with_context(|| format!("opening store at {}", store_cfg.database_url))?,
    );

    // --- Cancel in-flight work on Ctrl-C ---
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Migrate => {
            store.migrate().await?;
            tracing::info!("Database migration complete.");
        }
        Command::CreateContainer {
            container,
            owner,
            magic,
            disable_homomorphic,
        } => {
            let mut attributes = vec![Attribute::new(MAGIC_ATTR, magic)];
            if disable_homomorphic {
                attributes.push(Attribute::new(HOMOMORPHIC_DISABLED_ATTR, true));
            }
            let info = store.create_container(&container, &owner, &attributes).await?;
            tracing::info!(container = %info.id, owner = %info.owner, magic, "Container created");
        }
        Command::Serve { host, port } => serve(store, host, port).await?,
        Command::Upload(chain) => {
            let report = archiver(&chain, store, cancel).await?.run_upload().await?;
            print_report(&report)?;
        }
        Command::Audit {
            chain,
            dry_run,
            from_index,
            to_index,
        } => {
            let report = archiver(&chain, store, cancel)
                .await?
                .run_audit(Some(from_index), to_index, dry_run)
                .await?;
            print_report(&report)?;
        }
        Command::UploadState(chain) => {
            let uploaded = archiver(&chain, store, cancel)
                .await?
                .run_state_upload()
                .await?;
            let heights: Vec<u32> = uploaded.iter().map(|(height, _)| *height).collect();
            print_report(&heights)?;
        }
    }

    Ok(())
}

/// Wire the chain dump and the local store into an [`Archiver`].
async fn archiver(
    chain: &ChainArgs,
    store: Arc<LocalObjectStore>,
    cancel: CancellationToken,
) -> Result<Archiver> {
    let archive_cfg = chain.archive_config()?;
    let (dump, magic) = chain.chain_source()?;
    tracing::info!("Archive config: {:?}", archive_cfg);

    let ledger = DumpLedger::open(&dump, magic)
        .await
        .with_context(|| format!("loading chain dump {}", dump))?;
    Ok(Archiver::new(Arc::new(ledger), store, archive_cfg, cancel))
}

fn print_report<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

async fn serve(store: Arc<LocalObjectStore>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let (host, port) = config::serve_addr(host, port)?;
    let state = routes::AppState {
        store,
        keys: Arc::new(AttributeKeys::default()),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = format!("{}:{}", host, port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
