//! # outpost
//!
//! Maintenance binary for the Outpost offline store.
//!
//! This binary provides:
//! - **status**: account, pending journal entries and their sync state
//! - **gc**: purge stale upload chunks and orphaned files
//! - **reconcile**: demote translations whose master moved on
//! - **freeze / thaw**: exclude or re-include an object's edits from the next push
//!
//! The password is read from `OUTPOST_PASSWORD`; every other setting comes
//! from the `OUTPOST_*` environment (see `StoreConfig`).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use outpost_shared::{AuthFactor, Token};
use outpost_store::{Database, DeviceKeyProtector, SecretProtector, StoreConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Inspect and maintain the Outpost offline store")]
struct Args {
    /// Directory holding `outpost.db` (overrides OUTPOST_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Account to unlock
    #[arg(short, long)]
    user: String,

    /// Unlock with the device key instead of the password
    #[arg(long)]
    device_key: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the account and every pending journal entry
    Status {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Purge stale upload chunks and unreferenced files
    Gc,
    /// Demote reviewed translations whose master changed
    Reconcile,
    /// Keep an object's edits out of the next push
    Freeze { token: String },
    /// Include an object's edits in the next push again
    Thaw { token: String },
}

fn unlock(db: &mut Database, args: &Args) -> Result<()> {
    match &args.device_key {
        Some(path) => {
            let protector = DeviceKeyProtector::open(path)
                .with_context(|| format!("opening device key {}", path.display()))?;
            db.login(
                &args.user,
                "",
                AuthFactor::Ownership,
                Some(&protector as &dyn SecretProtector),
            )?;
        }
        None => {
            let password = std::env::var("OUTPOST_PASSWORD")
                .context("OUTPOST_PASSWORD must be set to unlock the store")?;
            db.login(&args.user, &password, AuthFactor::Knowledge, None)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,outpost_store=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // -----------------------------------------------------------------------
    // 2. Load configuration and open the store
    // -----------------------------------------------------------------------
    let mut config = StoreConfig::from_env();
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    let retention = config.chunk_retention;

    let mut db = Database::new(config).context("opening the store")?;
    if !db.has_account()? {
        bail!("no account configured yet; create one from the client first");
    }
    unlock(&mut db, &args)?;
    info!(user = %args.user, "store unlocked");

    // -----------------------------------------------------------------------
    // 3. Run the command
    // -----------------------------------------------------------------------
    match &args.command {
        Command::Status { json } => {
            let account = db.account_info()?;
            let staged = db.list_staged()?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&staged)?);
                return Ok(());
            }

            println!("account  {} @ {}", account.username, account.url);
            match db.file_size_stats()? {
                Some(stats) => println!(
                    "files    {} mirrored, {}..{} bytes (median {})",
                    stats.count, stats.min, stats.max, stats.median
                ),
                None => println!("files    none mirrored"),
            }
            println!("pending  {}", staged.len());
            for entry in &staged {
                println!(
                    "  {:<28} {:<9} {:<14} {}{}",
                    entry.token.to_string(),
                    entry.kind.to_string(),
                    entry.operation.to_string(),
                    entry.sync_state(),
                    if entry.frozen { " (frozen)" } else { "" },
                );
            }
        }
        Command::Gc => {
            let chunks = db.purge_stale_chunks(retention)?;
            let orphans = db.cleanup_orphan_files()?;
            println!(
                "purged {chunks} stale chunk(s), removed {} orphaned file(s)",
                orphans.len()
            );
        }
        Command::Reconcile => {
            let demoted = db.reconcile_translations()?;
            println!("demoted {demoted} translation(s)");
        }
        Command::Freeze { token } | Command::Thaw { token } => {
            let frozen = matches!(args.command, Command::Freeze { .. });
            let token = Token::new(token.as_str())?;
            let rows = db.freeze(&token, frozen)?;
            if rows == 0 {
                bail!("nothing staged for {token}");
            }
            println!("{} {rows} row(s) of {token}", if frozen { "froze" } else { "thawed" });
        }
    }

    Ok(())
}
