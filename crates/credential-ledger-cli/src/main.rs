use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use credential_ledger_api::CredentialLedgerApi;
use credential_ledger_core::OPERATIONS;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "credledger")]
#[command(about = "Credential Ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./credential_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Invoke a named ledger operation with positional string arguments.
    Invoke(InvokeArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Ops {
        #[command(subcommand)]
        command: OpsCommand,
    },
}

#[derive(Debug, Args)]
struct InvokeArgs {
    operation: String,
    args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum OpsCommand {
    /// List every registered operation with its declared arity.
    List,
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
            "payload": other,
        }),
    }
}

fn run(cli: Cli) -> Result<Value> {
    let api = CredentialLedgerApi::new(cli.db);
    match cli.command {
        Command::Invoke(invoke) => {
            let payload = api.invoke(&invoke.operation, &invoke.args)?;
            Ok(serde_json::json!({
                "operation": invoke.operation,
                "payload": payload,
            }))
        }
        Command::Db { command } => match command {
            DbCommand::SchemaVersion => {
                let status = api.schema_status()?;
                Ok(serde_json::to_value(status)?)
            }
            DbCommand::Migrate(args) => {
                let result = api.migrate(args.dry_run)?;
                Ok(serde_json::to_value(result)?)
            }
        },
        Command::Ops { command } => match command {
            OpsCommand::List => {
                let operations = OPERATIONS
                    .iter()
                    .map(|spec| {
                        serde_json::json!({
                            "name": spec.name,
                            "arity": spec.arity,
                        })
                    })
                    .collect::<Vec<_>>();
                Ok(serde_json::json!({ "operations": operations }))
            }
        },
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = run(cli)?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(output))?);
    Ok(())
}
