use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use scamper_notes_api::{scamper_field_descriptors, ApiError, NotesApi};
use scamper_notes_core::ScamperField;
use scamper_notes_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::{Map, Value};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sn")]
#[command(about = "Scamper Notes CLI")]
struct Cli {
    #[arg(long, env = "SCAMPER_NOTES_DB", default_value = "./scamper_notes.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Note {
        #[command(subcommand)]
        command: NoteCommand,
    },
    Scamper {
        #[command(subcommand)]
        command: ScamperCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum NoteCommand {
    List,
    Show(NoteIdArg),
    Add(NoteAddArgs),
    Edit(NoteEditArgs),
    Delete(NoteIdArg),
}

#[derive(Debug, Args)]
struct NoteIdArg {
    id: String,
}

#[derive(Debug, Args)]
struct NoteAddArgs {
    #[arg(long, default_value = "")]
    title: String,
    #[arg(long, default_value = "")]
    content: String,
}

#[derive(Debug, Args)]
struct NoteEditArgs {
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    content: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ScamperCommand {
    Show(NoteIdArg),
    Set(ScamperSetArgs),
    Fields,
}

#[derive(Debug, Args)]
struct ScamperSetArgs {
    note_id: String,
    #[arg(long)]
    substitute: Option<String>,
    #[arg(long)]
    combine: Option<String>,
    #[arg(long)]
    adapt: Option<String>,
    #[arg(long)]
    modify: Option<String>,
    #[arg(long)]
    put_to_other_use: Option<String>,
    #[arg(long)]
    eliminate: Option<String>,
    #[arg(long)]
    reverse: Option<String>,
}

impl ScamperSetArgs {
    fn answer(&self, field: ScamperField) -> Option<&String> {
        match field {
            ScamperField::Substitute => self.substitute.as_ref(),
            ScamperField::Combine => self.combine.as_ref(),
            ScamperField::Adapt => self.adapt.as_ref(),
            ScamperField::Modify => self.modify.as_ref(),
            ScamperField::PutToOtherUse => self.put_to_other_use.as_ref(),
            ScamperField::Eliminate => self.eliminate.as_ref(),
            ScamperField::Reverse => self.reverse.as_ref(),
        }
    }

    fn body(&self) -> Value {
        let mut body = Map::new();
        for field in ScamperField::ALL {
            if let Some(answer) = self.answer(field) {
                body.insert(field.key().to_string(), Value::String(answer.clone()));
            }
        }
        Value::Object(body)
    }
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

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

/// Folds validation issues into the error text so they reach stderr.
fn api_failure(err: ApiError) -> anyhow::Error {
    let issues = err
        .issues()
        .iter()
        .map(|issue| {
            if issue.path.is_empty() {
                issue.message.clone()
            } else {
                format!("{}: {}", issue.path.join("."), issue.message)
            }
        })
        .collect::<Vec<_>>();
    if issues.is_empty() {
        anyhow::Error::new(err)
    } else {
        anyhow!("{err}: {}", issues.join("; "))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let store = SqliteStore::open(&cli.db)?;
            run_db(command, &store)
        }
        Command::Note { command } => run_note(command, &notes_api(&cli.db)?),
        Command::Scamper { command } => run_scamper(command, &cli.db),
    }
}

fn notes_api(db: &std::path::Path) -> Result<NotesApi> {
    let store = SqliteStore::open_migrated(db)?;
    Ok(NotesApi::new(Arc::new(store)))
}

fn run_db(command: DbCommand, store: &SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    let applied = store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": applied,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit(&report)
}

fn run_note(command: NoteCommand, api: &NotesApi) -> Result<()> {
    match command {
        NoteCommand::List => emit(&api.list_notes().map_err(api_failure)?),
        NoteCommand::Show(args) => emit(&api.get_note(&args.id).map_err(api_failure)?),
        NoteCommand::Add(args) => {
            let body = serde_json::json!({ "title": args.title, "content": args.content });
            emit(&api.create_note(&body).map_err(api_failure)?)
        }
        NoteCommand::Edit(args) => {
            let mut body = Map::new();
            if let Some(title) = args.title {
                body.insert("title".to_string(), Value::String(title));
            }
            if let Some(content) = args.content {
                body.insert("content".to_string(), Value::String(content));
            }
            emit(&api.update_note(&args.id, &Value::Object(body)).map_err(api_failure)?)
        }
        NoteCommand::Delete(args) => emit(&api.delete_note(&args.id).map_err(api_failure)?),
    }
}

fn run_scamper(command: ScamperCommand, db: &std::path::Path) -> Result<()> {
    match command {
        ScamperCommand::Fields => emit(&scamper_field_descriptors()),
        ScamperCommand::Show(args) => {
            let api = notes_api(db)?;
            emit(&api.get_scamper(&args.id).map_err(api_failure)?)
        }
        ScamperCommand::Set(args) => {
            let api = notes_api(db)?;
            emit(&api.save_scamper(&args.note_id, &args.body()).map_err(api_failure)?)
        }
    }
}
