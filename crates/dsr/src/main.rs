use std::sync::Arc;

use dsr_connector::ConnectorStore;
use dsr_core::{
    config::Config,
    domain::{OperationId, OperationStatus, SubjectId, WorkspaceId},
    engine::ComplianceEngine,
    operations::ComplianceOperation,
    ports::{AllowListAuthorizer, StoreAdapter},
};
use dsr_filestore::FileStore;
use dsr_postgrest::{PostgrestStore, TableSpec};

const USAGE: &str = "\
usage: dsr <command> [args]

  export   <subject> [--workspace <id>]                    build an encrypted data export
  erase    <subject> [--reason <text>] [--workspace <id>]  delete or anonymize per store policy
  restrict <subject>                                        set the processing restriction flag
  lift     <subject>                                        lift the processing restriction flag
  locate   <subject> [--workspace <id>]                     report where the subject's data lives
  status   <operation-id>                                   show one operation record
  audit    <subject>                                        print the subject's audit trail
  sweep                                                     purge export archives past retention

The acting operator comes from --actor <email> or DSR_ACTOR.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dsr_core::logging::init("dsr");

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let mut positional = Vec::new();
    let mut workspace = None;
    let mut actor = None;
    let mut reason = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--workspace" => workspace = args.next(),
            "--actor" => actor = args.next(),
            "--reason" => reason = args.next(),
            _ => positional.push(arg),
        }
    }

    let cfg = Arc::new(Config::load()?);
    let stores = build_stores(&cfg)?;
    let authorizer = Arc::new(AllowListAuthorizer::new(cfg.authorized_operators.clone()));
    let engine = ComplianceEngine::new(Arc::clone(&cfg), stores, authorizer)?;

    let workspace = workspace.map(WorkspaceId);
    let actor = actor.or_else(|| std::env::var("DSR_ACTOR").ok());

    let code = match command.as_str() {
        "export" => {
            let subject = subject_arg(&positional);
            let actor = required_actor(actor)?;
            let id = engine
                .export_user_data(&actor, &subject, workspace.as_ref())
                .await?;
            let op = engine.await_terminal(&id).await?;
            print_record(&op)?;
            failed_exit(&op)
        }
        "erase" => {
            let subject = subject_arg(&positional);
            let actor = required_actor(actor)?;
            let id = engine
                .delete_user_data(&actor, &subject, workspace.as_ref(), reason.as_deref())
                .await?;
            let op = engine.await_terminal(&id).await?;
            print_record(&op)?;
            failed_exit(&op)
        }
        "restrict" => {
            let subject = subject_arg(&positional);
            let actor = required_actor(actor)?;
            let op = engine.restrict_processing(&actor, &subject).await?;
            print_record(&op)?;
            failed_exit(&op)
        }
        "lift" => {
            let subject = subject_arg(&positional);
            let actor = required_actor(actor)?;
            let op = engine.lift_restriction(&actor, &subject).await?;
            print_record(&op)?;
            failed_exit(&op)
        }
        "locate" => {
            let subject = subject_arg(&positional);
            let actor = required_actor(actor)?;
            let (op, report) = engine
                .get_data_locations(&actor, &subject, workspace.as_ref())
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "operation_id": op.operation_id,
                    "report": report.grouped(),
                }))?
            );
            0
        }
        "status" => {
            let Some(raw) = positional.first() else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            let op = engine.status(&OperationId(raw.clone())).await?;
            print_record(&op)?;
            0
        }
        "audit" => {
            let subject = subject_arg(&positional);
            let trail = engine.audit_trail(&subject).await?;
            println!("{}", serde_json::to_string_pretty(&trail)?);
            0
        }
        "sweep" => {
            let purged = engine.purge_expired_archives()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "purged": purged }))?
            );
            0
        }
        _ => {
            eprintln!("{USAGE}");
            2
        }
    };

    engine.shutdown().await;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn build_stores(cfg: &Config) -> anyhow::Result<Vec<Arc<dyn StoreAdapter>>> {
    let mut stores: Vec<Arc<dyn StoreAdapter>> = Vec::new();

    if let Some(url) = &cfg.postgrest_url {
        let mut tables = Vec::new();
        for raw in &cfg.postgrest_tables {
            let spec = TableSpec::parse(raw).ok_or_else(|| {
                anyhow::anyhow!("invalid table spec in DSR_POSTGREST_TABLES: {raw:?}")
            })?;
            tables.push(spec);
        }
        stores.push(Arc::new(PostgrestStore::new(
            url.clone(),
            cfg.postgrest_api_key.clone(),
            tables,
        )));
    }

    if let Some(root) = &cfg.filestore_root {
        stores.push(Arc::new(FileStore::new(root.clone())));
    }

    if let Some(url) = &cfg.connector_url {
        stores.push(Arc::new(ConnectorStore::new(
            url.clone(),
            cfg.connector_token.clone(),
        )));
    }

    if stores.is_empty() {
        tracing::warn!(
            "no data stores configured; only restriction flags and audit queries will do anything"
        );
    }

    Ok(stores)
}

fn subject_arg(positional: &[String]) -> SubjectId {
    match positional.first() {
        Some(s) => SubjectId(s.clone()),
        None => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

fn required_actor(actor: Option<String>) -> anyhow::Result<String> {
    actor.ok_or_else(|| anyhow::anyhow!("an acting operator is required (--actor or DSR_ACTOR)"))
}

fn print_record(op: &ComplianceOperation) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(op)?);
    Ok(())
}

fn failed_exit(op: &ComplianceOperation) -> i32 {
    if op.status == OperationStatus::Failed {
        1
    } else {
        0
    }
}
