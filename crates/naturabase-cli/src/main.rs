use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use naturabase_api::{NaturabaseApi, TabularRow};
use naturabase_core::{
    DomainError, EntityKind, EntryCandidate, EntryId, EntrySearchCriteria, InventoryCandidate,
    InventoryId, Principal, Role, UserId,
};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "nb")]
#[command(about = "Naturabase observation backend CLI")]
struct Cli {
    #[arg(long, default_value = "./naturabase.sqlite3")]
    db: PathBuf,

    /// Acting user id; omit to run anonymously.
    #[arg(long, global = true)]
    user: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = RoleArg::Contributor)]
    role: RoleArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    #[command(name = "ref")]
    Reference {
        #[command(subcommand)]
        command: Box<ReferenceCommand>,
    },
    Inventory {
        #[command(subcommand)]
        command: Box<InventoryCommand>,
    },
    Entry {
        #[command(subcommand)]
        command: Box<EntryCommand>,
    },
    ImportRows(ImportRowsArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ReferenceCommand {
    Add(ReferenceAddArgs),
    Update(ReferenceUpdateArgs),
    Delete(ReferenceDeleteArgs),
    List(ReferenceListArgs),
    Search(ReferenceSearchArgs),
}

#[derive(Debug, Args)]
struct ReferenceAddArgs {
    #[arg(long)]
    kind: String,
    #[command(flatten)]
    payload: PayloadArgs,
}

#[derive(Debug, Args)]
struct ReferenceUpdateArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    id: String,
    #[command(flatten)]
    payload: PayloadArgs,
}

#[derive(Debug, Args)]
struct ReferenceDeleteArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ReferenceListArgs {
    #[arg(long)]
    kind: String,
}

#[derive(Debug, Args)]
struct ReferenceSearchArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    q: String,
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Debug, Subcommand)]
enum InventoryCommand {
    Create(PayloadArgs),
    Update(InventoryUpdateArgs),
    Delete(IdArgs),
    Get(IdArgs),
    List(PageArgs),
}

#[derive(Debug, Args)]
struct InventoryUpdateArgs {
    #[arg(long)]
    id: String,
    /// Re-point the entries onto the existing duplicate instead of failing.
    #[arg(long, default_value_t = false)]
    migrate_entries: bool,
    #[command(flatten)]
    payload: PayloadArgs,
}

#[derive(Debug, Subcommand)]
enum EntryCommand {
    Create(PayloadArgs),
    CreateBatch(PayloadArgs),
    Update(EntryUpdateArgs),
    Delete(IdArgs),
    Get(IdArgs),
    Search(EntrySearchArgs),
    Count(PayloadArgs),
}

#[derive(Debug, Args)]
struct EntryUpdateArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    payload: PayloadArgs,
}

#[derive(Debug, Args)]
struct EntrySearchArgs {
    #[command(flatten)]
    payload: PayloadArgs,
    #[arg(long, default_value_t = 50)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Debug, Args)]
struct ImportRowsArgs {
    #[command(flatten)]
    payload: PayloadArgs,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(long, default_value_t = 50)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

/// Inline JSON or a file path; exactly one must be given.
#[derive(Debug, Args)]
struct PayloadArgs {
    #[arg(long)]
    json: Option<String>,
    #[arg(long)]
    file: Option<PathBuf>,
}

impl PayloadArgs {
    fn read(&self) -> Result<String> {
        match (&self.json, &self.file) {
            (Some(json), None) => Ok(json.clone()),
            (None, Some(path)) => fs::read_to_string(path)
                .with_context(|| format!("failed to read payload file {}", path.display())),
            (Some(_), Some(_)) => Err(anyhow!("--json and --file are mutually exclusive")),
            (None, None) => Err(anyhow!("a payload is required: pass --json or --file")),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let body = self.read()?;
        serde_json::from_str(&body).context("failed to parse payload JSON")
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Admin,
    Contributor,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn parse_principal(user: Option<&str>, role: RoleArg) -> Result<Option<Principal>> {
    let Some(raw) = user else {
        return Ok(None);
    };
    let user_id =
        UserId::parse(raw).ok_or_else(|| anyhow!("--user is not a valid ULID: {raw}"))?;
    let role = match role {
        RoleArg::Admin => Role::Admin,
        RoleArg::Contributor => Role::Contributor,
    };
    Ok(Some(Principal::new(user_id, role)))
}

fn parse_kind(raw: &str) -> Result<EntityKind> {
    EntityKind::parse(raw).ok_or_else(|| anyhow!("unknown entity kind: {raw}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = NaturabaseApi::new(&cli.db);
    let principal = parse_principal(cli.user.as_deref(), cli.role)?;

    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Reference { command } => run_reference(*command, &api, principal.as_ref()),
        Command::Inventory { command } => run_inventory(*command, &api, principal.as_ref()),
        Command::Entry { command } => run_entry(*command, &api, principal.as_ref()),
        Command::ImportRows(args) => run_import_rows(&args, &api, principal.as_ref()),
    }
}

fn run_db(command: DbCommand, api: &NaturabaseApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate => {
            let status = api.migrate()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = api.import_snapshot(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            api.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore_database(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(report).context("failed to serialize report")?)
        }
    }
}

fn run_reference(
    command: ReferenceCommand,
    api: &NaturabaseApi,
    principal: Option<&Principal>,
) -> Result<()> {
    match command {
        ReferenceCommand::Add(args) => {
            let kind = parse_kind(&args.kind)?;
            let draft: Value = args.payload.decode()?;
            let created = api.create_reference_value(principal, kind, &draft)?;
            emit_json(serde_json::json!({
                "kind": kind.as_str(),
                "reference": created
            }))
        }
        ReferenceCommand::Update(args) => {
            let kind = parse_kind(&args.kind)?;
            let draft: Value = args.payload.decode()?;
            let updated = api.update_reference_value(principal, kind, &args.id, &draft)?;
            emit_json(serde_json::json!({
                "kind": kind.as_str(),
                "reference": updated
            }))
        }
        ReferenceCommand::Delete(args) => {
            let kind = parse_kind(&args.kind)?;
            let deleted = api.delete_reference_value(principal, kind, &args.id)?;
            emit_json(serde_json::json!({
                "kind": kind.as_str(),
                "deleted": deleted.is_some(),
                "reference": deleted
            }))
        }
        ReferenceCommand::List(args) => {
            let kind = parse_kind(&args.kind)?;
            let listed = api.list_references_value(kind)?;
            emit_json(serde_json::json!({
                "kind": kind.as_str(),
                "references": listed
            }))
        }
        ReferenceCommand::Search(args) => {
            let kind = parse_kind(&args.kind)?;
            let hits = api.search_reference_labels(kind, &args.q, args.limit)?;
            emit_json(serde_json::json!({
                "kind": kind.as_str(),
                "q": args.q,
                "hits": hits
            }))
        }
    }
}

fn run_inventory(
    command: InventoryCommand,
    api: &NaturabaseApi,
    principal: Option<&Principal>,
) -> Result<()> {
    match command {
        InventoryCommand::Create(payload) => {
            let candidate: InventoryCandidate = payload.decode()?;
            let inventory = api.create_inventory(principal, &candidate)?;
            emit_json(serde_json::json!({
                "inventory": inventory
            }))
        }
        InventoryCommand::Update(args) => {
            let id = InventoryId::parse(&args.id)
                .ok_or_else(|| anyhow!("--id is not a valid ULID: {}", args.id))?;
            let candidate: InventoryCandidate = args.payload.decode()?;
            match api.update_inventory(principal, id, &candidate, args.migrate_entries) {
                Ok(outcome) => emit_json(serde_json::json!({
                    "inventory": outcome.inventory,
                    "migrated_entries": outcome.migrated_entries
                })),
                Err(DomainError::SimilarInventoryAlreadyExists(existing)) => Err(anyhow!(
                    "an equivalent inventory already exists ({existing}); \
                     rerun with --migrate-entries to merge into it"
                )),
                Err(err) => Err(err.into()),
            }
        }
        InventoryCommand::Delete(args) => {
            let id = InventoryId::parse(&args.id)
                .ok_or_else(|| anyhow!("--id is not a valid ULID: {}", args.id))?;
            let deleted = api.delete_inventory(principal, id)?;
            emit_json(serde_json::json!({
                "deleted": deleted.is_some(),
                "inventory": deleted
            }))
        }
        InventoryCommand::Get(args) => {
            let id = InventoryId::parse(&args.id)
                .ok_or_else(|| anyhow!("--id is not a valid ULID: {}", args.id))?;
            let inventory = api.find_inventory(id)?;
            emit_json(serde_json::json!({
                "inventory": inventory
            }))
        }
        InventoryCommand::List(args) => {
            let inventories = api.find_paginated_inventories(args.limit, args.offset)?;
            let total = api.get_inventories_count()?;
            emit_json(serde_json::json!({
                "total": total,
                "inventories": inventories
            }))
        }
    }
}

fn run_entry(
    command: EntryCommand,
    api: &NaturabaseApi,
    principal: Option<&Principal>,
) -> Result<()> {
    match command {
        EntryCommand::Create(payload) => {
            let candidate: EntryCandidate = payload.decode()?;
            let entry = api.create_entry(principal, &candidate)?;
            emit_json(serde_json::json!({
                "entry": entry
            }))
        }
        EntryCommand::CreateBatch(payload) => {
            let candidates: Vec<EntryCandidate> = payload.decode()?;
            let entries = api.create_entries(principal, &candidates)?;
            emit_json(serde_json::json!({
                "created": entries.len(),
                "entries": entries
            }))
        }
        EntryCommand::Update(args) => {
            let id = EntryId::parse(&args.id)
                .ok_or_else(|| anyhow!("--id is not a valid ULID: {}", args.id))?;
            let candidate: EntryCandidate = args.payload.decode()?;
            let entry = api.update_entry(principal, id, &candidate)?;
            emit_json(serde_json::json!({
                "entry": entry
            }))
        }
        EntryCommand::Delete(args) => {
            let id = EntryId::parse(&args.id)
                .ok_or_else(|| anyhow!("--id is not a valid ULID: {}", args.id))?;
            let deleted = api.delete_entry(principal, id)?;
            emit_json(serde_json::json!({
                "deleted": deleted.as_ref().map(|d| d.entry.clone()),
                "inventory_deleted": deleted.is_some_and(|d| d.inventory_deleted)
            }))
        }
        EntryCommand::Get(args) => {
            let id = EntryId::parse(&args.id)
                .ok_or_else(|| anyhow!("--id is not a valid ULID: {}", args.id))?;
            let entry = api.find_entry(id)?;
            emit_json(serde_json::json!({
                "entry": entry
            }))
        }
        EntryCommand::Search(args) => {
            let criteria: EntrySearchCriteria = args.payload.decode()?;
            let entries = api.find_paginated_entries(&criteria, args.limit, args.offset)?;
            let total = api.get_entries_count(&criteria)?;
            emit_json(serde_json::json!({
                "total": total,
                "limit": args.limit,
                "offset": args.offset,
                "entries": entries
            }))
        }
        EntryCommand::Count(payload) => {
            let criteria: EntrySearchCriteria = payload.decode()?;
            let total = api.get_entries_count(&criteria)?;
            emit_json(serde_json::json!({
                "total": total
            }))
        }
    }
}

fn run_import_rows(
    args: &ImportRowsArgs,
    api: &NaturabaseApi,
    principal: Option<&Principal>,
) -> Result<()> {
    let rows: Vec<TabularRow> = args.payload.decode()?;
    let report = api.import_tabular_rows(principal, &rows)?;
    emit_json(serde_json::json!({
        "rows": rows.len(),
        "report": report
    }))
}
