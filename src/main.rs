use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use dosekeeper_lib::alarms::AlarmRecord;
use dosekeeper_lib::auth::{CachedUser, PendingRegistration};
use dosekeeper_lib::model::{CachedCollection, CachedRecord, Collection, OwnerId};
use dosekeeper_lib::queue::QueueItem;
use dosekeeper_lib::storage::{keys, SqliteStore, StoreHandle};

#[derive(Debug, Parser)]
#[command(name = "dosekeeper", about = "Inspect a dosekeeper device store", version)]
struct Cli {
    /// Optional explicit DB path
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pending remote mutations.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Cached record snapshots.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Alarms known to the registry.
    #[command(subcommand)]
    Alarms(AlarmsCommand),
    /// Cached identity and pending registration.
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Show queued items, optionally for one owner.
    Status {
        #[arg(long)]
        owner: Option<String>,
        /// Emit JSON instead of the table view.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// List the records of one collection.
    List {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        owner: String,
        /// Show archived records instead of active ones.
        #[arg(long)]
        archived: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum AlarmsCommand {
    List {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    Show {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    dosekeeper_lib::logging::init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().unwrap_or(std::env::current_dir()?);
    Ok(base.join("dosekeeper").join("dosekeeper.sqlite3"))
}

async fn open_store(db: &Path) -> Result<StoreHandle> {
    if !db.exists() {
        anyhow::bail!("no database at {}", db.display());
    }
    let store = SqliteStore::open(db)
        .await
        .with_context(|| format!("open database {}", db.display()))?;
    Ok(StoreHandle::sqlite(store))
}

async fn run(cli: Cli) -> Result<i32> {
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path().context("determine database path")?,
    };
    let store = open_store(&db_path).await?;

    match cli.command {
        Commands::Queue(QueueCommand::Status { owner, json }) => queue_status(&store, owner, json).await,
        Commands::Cache(CacheCommand::List {
            collection,
            owner,
            archived,
            json,
        }) => cache_list(&store, &collection, &owner, archived, json).await,
        Commands::Alarms(AlarmsCommand::List { owner, json }) => alarms_list(&store, owner, json).await,
        Commands::Session(SessionCommand::Show { json }) => session_show(&store, json).await,
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{serialized}");
    Ok(())
}

async fn queue_status(store: &StoreHandle, owner: Option<String>, emit_json: bool) -> Result<i32> {
    let items: Vec<QueueItem> = store
        .get_json(keys::QUEUE_ITEMS)
        .await?
        .unwrap_or_default();
    let owner = owner.map(OwnerId::new);
    let items: Vec<QueueItem> = items
        .into_iter()
        .filter(|item| owner.as_ref().map_or(true, |owner| &item.owner == owner))
        .collect();

    if emit_json {
        print_json(&json!({ "pending": items.len(), "items": items }))?;
        return Ok(0);
    }
    println!("Pending: {}", items.len());
    for item in &items {
        println!(
            "{:<36}  {:<6}  {:<12}  {:<24}  {:<8}  attempts={}",
            item.id,
            item.operation.as_str(),
            item.collection.as_str(),
            item.item_id,
            item.status.as_str(),
            item.attempts
        );
    }
    Ok(0)
}

async fn cache_list(
    store: &StoreHandle,
    collection: &str,
    owner: &str,
    archived: bool,
    emit_json: bool,
) -> Result<i32> {
    let Some(collection) = Collection::parse(collection) else {
        eprintln!("Error: unknown collection {collection}");
        return Ok(2);
    };
    let owner = OwnerId::new(owner);
    let records: Vec<CachedRecord> = store
        .get_json::<CachedCollection>(&keys::cache(collection, &owner))
        .await?
        .map(|snapshot| if archived { snapshot.archived() } else { snapshot.active() })
        .unwrap_or_default();

    if emit_json {
        print_json(&json!({
            "collection": collection.as_str(),
            "owner": owner.as_str(),
            "archived": archived,
            "records": records,
        }))?;
        return Ok(0);
    }
    println!("{} for {}: {}", collection, owner, records.len());
    for record in &records {
        let label = record
            .str_field("name")
            .or_else(|| record.str_field("title"))
            .unwrap_or("");
        println!("{:<36}  {}", record.id, label);
    }
    Ok(0)
}

async fn alarms_list(store: &StoreHandle, owner: Option<String>, emit_json: bool) -> Result<i32> {
    let alarms: Vec<AlarmRecord> = store
        .get_json(keys::ALARM_REGISTRY)
        .await?
        .unwrap_or_default();
    let owner = owner.map(OwnerId::new);
    let mut alarms: Vec<AlarmRecord> = alarms
        .into_iter()
        .filter(|alarm| owner.as_ref().map_or(true, |owner| &alarm.owner == owner))
        .collect();
    alarms.sort_by_key(|alarm| alarm.trigger_at);

    if emit_json {
        print_json(&json!({ "alarms": alarms }))?;
        return Ok(0);
    }
    println!("Alarms: {}", alarms.len());
    for alarm in &alarms {
        println!(
            "{:<36}  {:<5}  {:<24}  {}  snoozes={}",
            alarm.id,
            alarm.item_type.as_str(),
            alarm.item_id,
            dosekeeper_lib::time::to_date(alarm.trigger_at).to_rfc3339(),
            alarm.snooze_count
        );
    }
    Ok(0)
}

async fn session_show(store: &StoreHandle, emit_json: bool) -> Result<i32> {
    let user: Option<CachedUser> = store.get_json(keys::CACHED_USER).await?;
    let owner: Option<OwnerId> = store.get_json(keys::CACHED_OWNER).await?;
    let pending: Option<PendingRegistration> = store.get_json(keys::PENDING_REGISTRATION).await?;
    let has_credentials = store.get_raw(keys::CREDENTIALS).await?.is_some();
    let pending_identity = pending.as_ref().map(|p| p.temporary_identity.clone());

    if emit_json {
        print_json(&json!({
            "owner": owner,
            "user": user,
            "pendingRegistration": pending_identity,
            "offlineLogin": has_credentials,
        }))?;
        return Ok(0);
    }
    match &user {
        Some(user) => println!(
            "User: {} ({}){}",
            user.uid,
            user.display_name.as_deref().unwrap_or("-"),
            if user.is_pending_registration { " pending" } else { "" }
        ),
        None => println!("User: <none>"),
    }
    println!(
        "Owner: {}",
        owner.as_ref().map(OwnerId::as_str).unwrap_or("<none>")
    );
    println!("Offline login: {}", if has_credentials { "yes" } else { "no" });
    if let Some(identity) = pending_identity {
        println!("Pending registration: {identity}");
    }
    Ok(0)
}
