//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::block::{BlockPatch, NewBlock};
use crate::domain::config_validation::{self, StoreBackend};
use crate::domain::error::BlocktraderError;
use crate::domain::ids::{BlockId, StrategyId};
use crate::domain::strategy::{StrategyExport, StrategyPatch};
use crate::domain::strategy_service::StrategyService;
use crate::logging::{init_logging, LogConfig};
use crate::ports::config_port::ConfigPort;
use crate::ports::strategy_store::StrategyStore;

#[derive(Parser, Debug)]
#[command(name = "blocktrader", about = "Manage block-based trading strategy trees")]
pub struct Cli {
    /// INI configuration file
    #[arg(short, long)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the configuration and create the schema
    Init,
    /// Create a strategy with an empty root block
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List strategies
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print a strategy with its nested block tree
    Show { strategy: StrategyId },
    /// Add a block; BLOCK is JSON or @path to a JSON file
    AddBlock {
        strategy: StrategyId,
        #[arg(long)]
        parent: BlockId,
        #[arg(long)]
        block: String,
    },
    /// Patch a block; PATCH is JSON or @path to a JSON file
    UpdateBlock {
        strategy: StrategyId,
        block_id: BlockId,
        #[arg(long)]
        patch: String,
    },
    /// Delete a block and its subtree
    DeleteBlock {
        strategy: StrategyId,
        block_id: BlockId,
    },
    /// Re-parent a block
    MoveBlock {
        strategy: StrategyId,
        block_id: BlockId,
        #[arg(long)]
        parent: BlockId,
        #[arg(long)]
        order: Option<u32>,
    },
    /// Change name, description or active flag
    UpdateStrategy {
        strategy: StrategyId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },
    /// Delete a strategy and everything it owns
    Delete { strategy: StrategyId },
    /// Write a strategy as a portable JSON document
    Export {
        strategy: StrategyId,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create a new strategy from an exported JSON document
    Import {
        #[arg(long)]
        owner: String,
        #[arg(short, long)]
        input: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(code) => return code,
    };

    match LogConfig::from_config(&config) {
        Ok(log_config) => init_logging(&log_config),
        Err(e) => return fail(&e),
    }

    match execute(&config, cli.command).and_then(|value| render(&value)) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| {
        let err = BlocktraderError::ConfigParse {
            file: path.display().to_string(),
            reason: e.to_string(),
        };
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

fn fail(err: &BlocktraderError) -> ExitCode {
    eprintln!("error: {err}");
    ExitCode::from(err)
}

fn render(value: &Value) -> Result<String, BlocktraderError> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn to_json(value: &impl Serialize) -> Result<Value, BlocktraderError> {
    Ok(serde_json::to_value(value)?)
}

/// Parses a JSON argument; a leading `@` names a file to read it from.
pub fn parse_json_arg<T: DeserializeOwned>(raw: &str, field: &str) -> Result<T, BlocktraderError> {
    let text = match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).map_err(|e| BlocktraderError::invalid(field, e.to_string()))
}

/// Opens the configured backend and makes sure its schema exists.
pub fn open_store(config: &dyn ConfigPort) -> Result<Arc<dyn StrategyStore>, BlocktraderError> {
    match config_validation::validate_config(config)? {
        StoreBackend::Sqlite => open_sqlite(config),
        StoreBackend::Postgres => open_postgres(config),
    }
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &dyn ConfigPort) -> Result<Arc<dyn StrategyStore>, BlocktraderError> {
    use crate::adapters::sqlite_adapter::SqliteAdapter;
    Ok(Arc::new(SqliteAdapter::from_config(config)?))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_config: &dyn ConfigPort) -> Result<Arc<dyn StrategyStore>, BlocktraderError> {
    Err(backend_missing("sqlite"))
}

#[cfg(feature = "postgres")]
fn open_postgres(config: &dyn ConfigPort) -> Result<Arc<dyn StrategyStore>, BlocktraderError> {
    use crate::adapters::postgres_adapter::PostgresAdapter;
    Ok(Arc::new(PostgresAdapter::from_config(config)?))
}

#[cfg(not(feature = "postgres"))]
fn open_postgres(_config: &dyn ConfigPort) -> Result<Arc<dyn StrategyStore>, BlocktraderError> {
    Err(backend_missing("postgres"))
}

#[cfg(any(not(feature = "sqlite"), not(feature = "postgres")))]
fn backend_missing(backend: &str) -> BlocktraderError {
    BlocktraderError::ConfigInvalid {
        section: "store".into(),
        key: "backend".into(),
        reason: format!("{backend} support was not compiled in"),
    }
}

pub fn build_service(config: &dyn ConfigPort) -> Result<StrategyService, BlocktraderError> {
    let store = open_store(config)?;
    let max_attempts = config_validation::max_attempts(config)?;
    Ok(StrategyService::new(store).with_max_attempts(max_attempts))
}

/// Runs one command and returns its JSON result.
pub fn execute(config: &dyn ConfigPort, command: Command) -> Result<Value, BlocktraderError> {
    let service = build_service(config)?;
    match command {
        Command::Init => {
            let backend = config_validation::store_backend(config)?;
            Ok(serde_json::json!({
                "status": "ok",
                "backend": format!("{backend:?}").to_lowercase(),
                "maxAttempts": service.max_attempts(),
            }))
        }
        Command::Create {
            owner,
            name,
            description,
        } => to_json(&service.create_strategy(&owner, &name, &description)?),
        Command::List { owner } => to_json(&service.list_strategies(owner.as_deref())?),
        Command::Show { strategy } => to_json(&service.get_strategy(strategy)?),
        Command::AddBlock {
            strategy,
            parent,
            block,
        } => {
            let new: NewBlock = parse_json_arg(&block, "block")?;
            to_json(&service.create_block(strategy, parent, &new)?)
        }
        Command::UpdateBlock {
            strategy,
            block_id,
            patch,
        } => {
            let patch: BlockPatch = parse_json_arg(&patch, "patch")?;
            to_json(&service.update_block(strategy, block_id, &patch)?)
        }
        Command::DeleteBlock { strategy, block_id } => {
            to_json(&service.delete_block(strategy, block_id)?)
        }
        Command::MoveBlock {
            strategy,
            block_id,
            parent,
            order,
        } => to_json(&service.move_block(strategy, block_id, parent, order)?),
        Command::UpdateStrategy {
            strategy,
            name,
            description,
            active,
        } => {
            let patch = StrategyPatch {
                name,
                description,
                is_active: active,
            };
            to_json(&service.update_strategy(strategy, &patch)?)
        }
        Command::Delete { strategy } => {
            service.delete_strategy(strategy)?;
            Ok(serde_json::json!({ "deleted": strategy }))
        }
        Command::Export { strategy, output } => {
            let export = service.export_strategy(strategy)?;
            match output {
                Some(path) => {
                    fs::write(&path, serde_json::to_string_pretty(&export)?)?;
                    Ok(serde_json::json!({
                        "exported": strategy,
                        "path": path.display().to_string(),
                        "blocks": export.blocks.len(),
                    }))
                }
                None => to_json(&export),
            }
        }
        Command::Import { owner, input } => {
            let text = fs::read_to_string(&input)?;
            let export: StrategyExport = serde_json::from_str(&text)
                .map_err(|e| BlocktraderError::invalid("input", e.to_string()))?;
            to_json(&service.import_strategy(&owner, &export)?)
        }
    }
}
