use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mythrill_storage_core::{DocumentRef, DocumentStore, StorageTier};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mythrill_storage_local::config::{Command, Config};
use mythrill_storage_local::{persist, FileDocumentStore, QuotaEnforcer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so payloads and JSON on stdout stay clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let sync_config = config.sync_config()?;

    let dir = config.effective_storage_dir();
    info!("Storage dir: {}", dir.display());
    let store = Arc::new(FileDocumentStore::new(&dir));
    store.ping().await.context("storage directory is not usable")?;
    let quota = QuotaEnforcer::new(store.clone(), sync_config.tiers.clone());

    match config.command {
        Command::Tier { user } => {
            let assignment = quota.get_user_tier(&user).await;
            println!("tier: {}", assignment.tier.as_str().to_ascii_lowercase());
            println!("total: {} bytes", assignment.limits.total_bytes);
            for (category, limit) in &assignment.limits.item_limits {
                println!("{}: {} items", category, limit);
            }
        }
        Command::SetTier { user, tier } => {
            let tier = StorageTier::parse(&tier)
                .with_context(|| format!("unknown tier '{}'", tier))?;
            quota.set_user_tier(&user, tier).await?;
            info!("Assigned {} to {}", tier.as_str(), user);
        }
        Command::Usage { user } => {
            let usage = quota.get_storage_usage(&user).await;
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
        Command::Put {
            user,
            category,
            id,
            file,
        } => {
            let payload = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let doc = DocumentRef::new(category, id);
            let receipt = persist::write_document(store.as_ref(), &quota, &user, &doc, &payload).await?;
            info!(
                "Stored {} v{} ({} bytes{})",
                doc,
                receipt.version,
                payload.len(),
                if receipt.created { ", new" } else { "" }
            );
        }
        Command::Get {
            user,
            category,
            id,
            out,
        } => {
            let doc = DocumentRef::new(category, id);
            let document = store
                .load(&user, &doc)
                .await?
                .with_context(|| format!("{} not found for {}", doc, user))?;
            match out {
                Some(path) => tokio::fs::write(&path, &document.payload)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", String::from_utf8_lossy(&document.payload)),
            }
        }
        Command::Rm { user, category, id } => {
            let doc = DocumentRef::new(category, id);
            if persist::remove_document(store.as_ref(), &quota, &user, &doc).await? {
                info!("Removed {}", doc);
            } else {
                info!("{} did not exist", doc);
            }
        }
        Command::Export { user, out } => {
            let export = persist::export_user_data(store.as_ref(), &quota, &user)
                .await?
                .with_context(|| format!("{} has no persistent storage", user))?;
            let json = serde_json::to_string_pretty(&export)?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(
                        "Exported {} document(s) to {}",
                        export.document_count(),
                        path.display()
                    );
                }
                None => println!("{}", json),
            }
        }
        Command::Purge { user } => {
            let report = persist::purge_user_data(store.as_ref(), &quota, &user).await?;
            println!(
                "purged {} document(s), {} bytes",
                report.documents, report.bytes
            );
        }
    }

    Ok(())
}
