use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agreement_retirement_api::{
    init_logging, AuditSink, EnforcementAdapter, HttpAuditSink, LogAuditSink, LogFormat,
    RetirementAdmin, RetirementService,
};
use agreement_retirement_core::{
    evaluate_time_interval, parse_instant, RetirementQuery, SortOrder, SystemClock,
};
use agreement_retirement_store_sqlite::{SqliteRetirementStore, SqliteStoreOptions};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ar")]
#[command(about = "Agreement retirement operator CLI")]
struct Cli {
    #[arg(long, env = "AR_DB", default_value = "./agreement_retirement.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "AR_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,
    /// Logging service endpoint receiving retirement events.
    #[arg(long, env = "AR_AUDIT_URL")]
    audit_url: Option<String>,
    #[arg(long, env = "AR_AUDIT_TIMEOUT_MS", default_value_t = 5_000)]
    audit_timeout_ms: u64,
    #[arg(long, env = "AR_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Retire an agreement. Repeating the command keeps the original record.
    Retire(RetireArgs),
    Show(AgreementArgs),
    /// Print the authorization decision for an agreement.
    Check(AgreementArgs),
    List(ListArgs),
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Export(DbExportArgs),
    Import(DbImportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
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
}

#[derive(Debug, Args)]
struct RetireArgs {
    #[arg(long)]
    agreement_id: String,
    #[arg(long)]
    reason: String,
    #[arg(long, env = "AR_ACTOR", default_value = "operator-cli")]
    actor: String,
}

#[derive(Debug, Args)]
struct AgreementArgs {
    agreement_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Asc,
    Desc,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    agreement_id: Option<String>,
    #[arg(long)]
    agreement_id_prefix: Option<String>,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    reason_prefix: Option<String>,
    /// Exclusive lower bound, RFC 3339.
    #[arg(long)]
    retired_after: Option<String>,
    /// Exclusive upper bound, RFC 3339.
    #[arg(long)]
    retired_before: Option<String>,
    #[arg(long)]
    offset: Option<u32>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long, value_enum)]
    order: Option<OrderArg>,
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    /// Evaluate a time-interval constraint. Bounds accept RFC 3339 or epoch seconds.
    Eval(PolicyEvalArgs),
}

#[derive(Debug, Args)]
struct PolicyEvalArgs {
    #[arg(long)]
    valid_from: Option<String>,
    #[arg(long)]
    valid_until: Option<String>,
    /// Evaluation instant; defaults to now.
    #[arg(long)]
    at: Option<String>,
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, "info")?;
    let busy_timeout = Duration::from_millis(cli.busy_timeout_ms);
    let service = || {
        open_service(&cli.db, busy_timeout, cli.audit_url.as_deref(), cli.audit_timeout_ms)
    };

    match cli.command {
        Command::Db { command } => run_db(command, &RetirementAdmin::new(cli.db.clone(), busy_timeout)),
        Command::Policy { command } => run_policy(command),
        Command::Retire(args) => run_retire(&args, &service()?),
        Command::Show(args) => {
            let record = service()?.get(&args.agreement_id)?;
            emit_json(serde_json::json!({
                "agreement_id": args.agreement_id,
                "retired": record.is_some(),
                "record": record
            }))
        }
        Command::Check(args) => {
            let decision =
                EnforcementAdapter::new(Arc::new(service()?)).check_allowed(&args.agreement_id);
            emit_json(serde_json::json!({
                "agreement_id": args.agreement_id,
                "allowed": decision.is_allowed(),
                "decision": decision
            }))
        }
        Command::List(args) => run_list(args, &service()?),
    }
}

fn open_service(
    db: &Path,
    busy_timeout: Duration,
    audit_url: Option<&str>,
    audit_timeout_ms: u64,
) -> Result<RetirementService> {
    let store = SqliteRetirementStore::open(db, SqliteStoreOptions { busy_timeout })
        .with_context(|| format!("failed to open retirement store {}", db.display()))?;
    let audit: Arc<dyn AuditSink> = match audit_url {
        Some(url) => Arc::new(HttpAuditSink::new(url, Duration::from_millis(audit_timeout_ms))),
        None => Arc::new(LogAuditSink),
    };
    Ok(RetirementService::new(Arc::new(store), audit, Arc::new(SystemClock)))
}

fn run_db(command: DbCommand, admin: &RetirementAdmin) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = admin.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = admin.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = admin.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::Export(args) => {
            let manifest = admin.export(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = admin.import(&args.input)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "summary": summary
            }))
        }
    }
}

fn run_retire(args: &RetireArgs, service: &RetirementService) -> Result<()> {
    let outcome = service.retire(&args.agreement_id, &args.reason, &args.actor)?;
    emit_json(serde_json::to_value(&outcome).context("failed to serialize retirement outcome")?)
}

fn run_list(args: ListArgs, service: &RetirementService) -> Result<()> {
    let query = RetirementQuery {
        agreement_id: args.agreement_id,
        agreement_id_prefix: args.agreement_id_prefix,
        reason: args.reason,
        reason_prefix: args.reason_prefix,
        retired_after: args.retired_after.as_deref().map(parse_rfc3339).transpose()?,
        retired_before: args.retired_before.as_deref().map(parse_rfc3339).transpose()?,
        offset: args.offset,
        limit: args.limit,
        order: args.order.map(|order| match order {
            OrderArg::Asc => SortOrder::Asc,
            OrderArg::Desc => SortOrder::Desc,
        }),
    };
    let page = service.find(&query)?;
    emit_json(serde_json::to_value(&page).context("failed to serialize retirement page")?)
}

fn run_policy(command: PolicyCommand) -> Result<()> {
    match command {
        PolicyCommand::Eval(args) => {
            let at = match args.at.as_deref() {
                Some(raw) => parse_instant(raw)
                    .ok_or_else(|| anyhow!("invalid --at instant (RFC 3339 or epoch seconds): {raw}"))?,
                None => OffsetDateTime::now_utc(),
            };
            let outcome =
                evaluate_time_interval(at, args.valid_from.as_deref(), args.valid_until.as_deref());
            emit_json(serde_json::json!({
                "at": at.format(&time::format_description::well_known::Rfc3339)?,
                "satisfied": outcome.is_satisfied(),
                "result": outcome
            }))
        }
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
