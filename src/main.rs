use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use nft_event_sync::events::{Address, EventRecord, NftRef, StoreName, Word};
use nft_event_sync::store::{self, SharedDatabase};
use nft_event_sync::sync::source::EthSource;
use nft_event_sync::sync::{SyncContext, SyncManager};
use nft_event_sync::{open_database, AppConfig, QueryLayer};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON config file; built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    rpc_url: Option<String>,

    #[arg(long, global = true)]
    journal: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Backfill every store, then tail live blocks until Ctrl-C.
    Sync {
        /// Stop once every store reaches this height.
        #[arg(long)]
        until: Option<u64>,
    },
    /// Print per-store checkpoints.
    Status,
    /// Current owner of a token.
    Owner { contract: Address, token_id: Word },
    /// State of a listing.
    Listing { listing_id: Word },
    /// Persona of an account, optionally as seen inside an app.
    Persona {
        account: Address,
        #[arg(long)]
        app: Option<Address>,
    },
    /// Mints, listings and purchases of a token, newest first.
    History {
        token_id: Word,
        #[arg(long)]
        app: Option<Address>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Sync { until } => run_sync(&config, until).await,
        Command::Status => print_status(&open_journal(&config)?),
        Command::Owner { contract, token_id } => {
            let query = QueryLayer::new(open_journal(&config)?);
            match query.owner_of(&contract, &token_id)? {
                Some(owner) => {
                    println!("owner:         {}", owner.owner);
                    if let Some(minter) = owner.minter {
                        println!("minter:        {}", minter);
                    }
                    println!("last transfer: {}", owner.last_transfer);
                }
                None => println!("token {} of {} has no recorded owner", token_id, contract),
            }
            Ok(())
        }
        Command::Listing { listing_id } => {
            let query = QueryLayer::new(open_journal(&config)?);
            match query.listing(&listing_id)? {
                Some(listing) => println!("{:#?}", listing),
                None => println!("listing {} not found", listing_id),
            }
            Ok(())
        }
        Command::Persona { account, app } => {
            let query = QueryLayer::new(open_journal(&config)?);
            match (query.persona(&account)?, app.or(config.contracts.app)) {
                (Some(persona), Some(app)) => println!("{:#?}", persona.for_app(&app)),
                (Some(persona), None) => println!("{:#?}", persona.basic),
                (None, _) => println!("no persona for {}", account),
            }
            Ok(())
        }
        Command::History {
            token_id,
            app,
            limit,
        } => {
            let Some(app) = app.or(config.contracts.app) else {
                bail!("history needs an app: pass --app or set contracts.app");
            };
            let token = NftRef {
                contract: config.contracts.ipft_redeemable,
                id: token_id,
            };
            let query = QueryLayer::new(open_journal(&config)?);
            for record in query.token_history(&app, &token, Some(limit))? {
                print_record(&record);
            }
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::default(),
    };

    if let Some(url) = &args.rpc_url {
        config.rpc_url = url.clone();
    }
    if let Some(journal) = &args.journal {
        config.journal_path = journal.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_journal(config: &AppConfig) -> Result<SharedDatabase> {
    open_database(&config.journal_path, config.sync.genesis_height)
        .with_context(|| format!("opening journal {}", config.journal_path))
}

async fn run_sync(config: &AppConfig, until: Option<u64>) -> Result<()> {
    let db = open_journal(config)?;
    println!("[SYNC] Connecting to {}", config.rpc_url);
    let source = EthSource::new(&config.rpc_url, config.poll_interval(), config.sync.live_buffer)?;

    let ctx = SyncContext::new(Arc::new(source), db.clone(), config.sync.clone());
    let manager = SyncManager::start(ctx, &config.contracts, until);

    for handle in manager.handles() {
        let store_name = handle.store();
        let mut status = handle.subscribe_status();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = status.borrow_and_update().clone();
                println!("[SYNC] {:<26} {}", store_name, current);
            }
        });
    }

    let finished = async {
        for handle in manager.handles() {
            handle.wait_for(|s| s.is_terminal()).await;
        }
    };
    tokio::select! {
        _ = finished => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("[SYNC] Ctrl-C received, closing sessions...");
            manager.close_all();
        }
    }

    let mut failed = 0;
    for (store_name, result) in manager.join_all().await {
        if let Err(e) = result {
            eprintln!("[SYNC] {} failed: {}", store_name, e);
            failed += 1;
        }
    }

    print_status(&db)?;
    if failed > 0 {
        bail!("{} store(s) stalled", failed);
    }
    Ok(())
}

fn print_status(db: &SharedDatabase) -> Result<()> {
    let db = store::read(db)?;
    println!("-----------------------------------------------");
    for store_name in StoreName::ALL {
        let checkpoint = db
            .checkpoints()
            .committed(store_name)
            .map_or_else(|| "-".to_string(), |h| h.to_string());
        println!(
            "{:<26} {:>10}  ({} events)",
            store_name,
            checkpoint,
            db.table(store_name).len()
        );
    }
    println!("-----------------------------------------------");
    println!("commits: {}", db.commit_seq());
    Ok(())
}

fn print_record(record: &EventRecord) {
    println!("{} {:<26} tx {}", record.key, record.store(), record.tx_hash);
}
