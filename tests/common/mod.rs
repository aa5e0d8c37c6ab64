#![allow(dead_code)]

use blocktrader::adapters::sqlite_adapter::SqliteAdapter;
use blocktrader::domain::action::ActionPayload;
use blocktrader::domain::block::{BlockNode, NewBlock};
use blocktrader::domain::condition::{ConditionPayload, Operator};
use blocktrader::domain::config_validation::SqliteSettings;
use blocktrader::domain::error::BlocktraderError;
use blocktrader::domain::ids::{BlockId, StrategyId};
use blocktrader::domain::strategy::{Strategy, StrategySnapshot};
use blocktrader::domain::strategy_service::StrategyService;
use blocktrader::domain::tree_mutation::ChangeSet;
use blocktrader::ports::strategy_store::{CommitOutcome, StrategyStore};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn memory_service() -> StrategyService {
    StrategyService::new(Arc::new(SqliteAdapter::in_memory().unwrap()))
}

/// Service over an on-disk database, so several threads get their own
/// pooled connections.
pub fn file_service(dir: &Path, max_attempts: u32) -> StrategyService {
    let settings = SqliteSettings {
        path: dir.join("strategies.db").display().to_string(),
        pool_size: 8,
        busy_timeout: Duration::from_secs(10),
    };
    let store = SqliteAdapter::open(&settings).unwrap();
    StrategyService::new(Arc::new(store)).with_max_attempts(max_attempts)
}

pub fn sma_condition(target: f64) -> ConditionPayload {
    ConditionPayload::new("SMA", "AAPL", "1min", Operator::LessThan, target)
}

pub fn sma_if(target: f64) -> NewBlock {
    NewBlock::condition_if(sma_condition(target))
}

pub fn log_action(message: &str) -> NewBlock {
    NewBlock::action(ActionPayload::log_message(message))
}

/// Creates a strategy and returns its id and root block id.
pub fn new_strategy(service: &StrategyService, name: &str) -> (StrategyId, BlockId) {
    let tree = service.create_strategy("owner-1", name, "").unwrap();
    let root = tree.strategy.root_block_id.unwrap();
    (tree.strategy.id, root)
}

pub fn root_of(service: &StrategyService, id: StrategyId) -> BlockNode {
    service.get_strategy(id).unwrap().root.unwrap()
}

/// All block ids of a tree, parents first.
pub fn ids(node: &BlockNode) -> Vec<BlockId> {
    let mut out = vec![node.block.id];
    for child in &node.children {
        out.extend(ids(child));
    }
    out
}

pub fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Store wrapper that answers the next `conflicts` commits with
/// `CommitOutcome::Conflict` without touching the inner store.
pub struct FlakyStore {
    inner: Arc<dyn StrategyStore>,
    conflicts: AtomicU32,
    pub commits: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn StrategyStore>) -> Self {
        Self {
            inner,
            conflicts: AtomicU32::new(0),
            commits: AtomicU32::new(0),
        }
    }

    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }
}

impl StrategyStore for FlakyStore {
    fn insert_strategy(&self, strategy: &Strategy) -> Result<(), BlocktraderError> {
        self.inner.insert_strategy(strategy)
    }

    fn list_strategies(&self, owner_id: Option<&str>) -> Result<Vec<Strategy>, BlocktraderError> {
        self.inner.list_strategies(owner_id)
    }

    fn load_snapshot(&self, id: StrategyId) -> Result<Option<StrategySnapshot>, BlocktraderError> {
        self.inner.load_snapshot(id)
    }

    fn commit(&self, changes: &ChangeSet) -> Result<CommitOutcome, BlocktraderError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Ok(CommitOutcome::Conflict);
        }
        self.inner.commit(changes)
    }

    fn delete_strategy(&self, id: StrategyId) -> Result<bool, BlocktraderError> {
        self.inner.delete_strategy(id)
    }
}
