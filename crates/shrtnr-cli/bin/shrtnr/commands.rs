use crate::cli::Command;
use anyhow::{bail, Context};
use shrtnr_storage::{LinkStore, ShortCode, StorageError};
use std::io::Write;
use tracing::debug;

/// Executes one subcommand against `store`, writing its output to `out`.
pub async fn run(
    store: &dyn LinkStore,
    command: Command,
    base_url: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match command {
        Command::Shorten { owner, url } => match store.put(&owner, &url).await {
            Ok(code) => writeln!(out, "{}", code.to_url(base_url))?,
            Err(StorageError::DuplicateLink { existing }) => {
                debug!(code = %existing, "url already shortened");
                writeln!(out, "{} (already shortened)", existing.to_url(base_url))?;
            }
            Err(e) => return Err(e).context("failed to shorten url"),
        },
        Command::Resolve { code } => {
            let code = ShortCode::new(code)?;
            match store.resolve(&code).await? {
                None => bail!("no link for code {code}"),
                Some(record) if record.deleted => bail!("link {code} has been deleted"),
                Some(record) => writeln!(out, "{}", record.original_url)?,
            }
        }
        Command::List { owner } => {
            let mut links: Vec<_> = store.list_by_owner(&owner).await?.into_iter().collect();
            links.sort();
            for (code, long) in links {
                writeln!(out, "{}\t{long}", code.to_url(base_url))?;
            }
        }
        Command::Delete { owner, codes } => {
            let codes = codes
                .into_iter()
                .map(ShortCode::new)
                .collect::<Result<Vec<_>, _>>()?;
            let count = codes.len();
            store
                .delete(&owner, codes)
                .await
                .context("failed to delete links")?;
            writeln!(out, "accepted {count} delete request(s)")?;
        }
        Command::Stats => {
            let stats = serde_json::json!({
                "urls": store.count_links().await?,
                "users": store.count_owners().await?,
            });
            writeln!(out, "{stats}")?;
        }
        Command::Ping => {
            store.ping().await.context("backend is not reachable")?;
            writeln!(out, "ok")?;
        }
    }

    Ok(())
}
