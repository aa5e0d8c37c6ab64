//! Strategy operations exposed to callers.
//!
//! Every mutation follows the same cycle: load a snapshot, plan the change
//! set with [`tree_mutation`], then commit it against the snapshot's
//! revision. A commit that loses the race is re-planned from fresh state, up
//! to `max_attempts` times.

use crate::domain::block::{BlockPatch, NewBlock, StrategyBlock};
use crate::domain::config_validation::DEFAULT_MAX_ATTEMPTS;
use crate::domain::error::{BlocktraderError, Entity};
use crate::domain::ids::{BlockId, StrategyId};
use crate::domain::strategy::{
    Strategy, StrategyExport, StrategyPatch, StrategySnapshot, StrategyTree,
};
use crate::domain::tree;
use crate::domain::tree_mutation::{self, ChangeSet, Plan};
use crate::ports::strategy_store::{CommitOutcome, StrategyStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedBlocks {
    pub deleted_ids: Vec<BlockId>,
}

pub struct StrategyService {
    store: Arc<dyn StrategyStore>,
    max_attempts: u32,
}

impl StrategyService {
    pub fn new(store: Arc<dyn StrategyStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS as u32,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Creates a strategy and its ROOT block.
    pub fn create_strategy(
        &self,
        owner_id: &str,
        name: &str,
        description: &str,
    ) -> Result<StrategyTree, BlocktraderError> {
        let strategy = Strategy::new(owner_id, name, description)?;
        self.store.insert_strategy(&strategy)?;
        if let Err(e) = self.create_root(strategy.id) {
            self.discard(strategy.id);
            return Err(e);
        }
        info!(strategy_id = %strategy.id, owner_id = %strategy.owner_id, "strategy created");
        self.get_strategy(strategy.id)
    }

    pub fn create_root(&self, strategy_id: StrategyId) -> Result<StrategyBlock, BlocktraderError> {
        self.mutate(strategy_id, "create_root", |snapshot| {
            let plan = tree_mutation::plan_create_root(snapshot)?;
            let root = tree::resolve_row(snapshot, &plan.output)?;
            Ok(Plan {
                changes: plan.changes,
                output: root,
            })
        })
    }

    pub fn get_strategy(&self, strategy_id: StrategyId) -> Result<StrategyTree, BlocktraderError> {
        let snapshot = self.snapshot(strategy_id)?;
        let root = tree::nest(&snapshot).map_err(report)?;
        Ok(StrategyTree {
            strategy: snapshot.strategy,
            root,
        })
    }

    pub fn list_strategies(&self, owner_id: Option<&str>) -> Result<Vec<Strategy>, BlocktraderError> {
        self.store.list_strategies(owner_id)
    }

    pub fn update_strategy(
        &self,
        strategy_id: StrategyId,
        patch: &StrategyPatch,
    ) -> Result<Strategy, BlocktraderError> {
        self.mutate(strategy_id, "update_strategy", |snapshot| {
            tree_mutation::plan_update_strategy(snapshot, patch)
        })
    }

    pub fn delete_strategy(&self, strategy_id: StrategyId) -> Result<(), BlocktraderError> {
        if !self.store.delete_strategy(strategy_id)? {
            return Err(BlocktraderError::not_found(Entity::Strategy, strategy_id));
        }
        info!(strategy_id = %strategy_id, "strategy deleted");
        Ok(())
    }

    pub fn create_block(
        &self,
        strategy_id: StrategyId,
        parent_id: BlockId,
        new: &NewBlock,
    ) -> Result<StrategyBlock, BlocktraderError> {
        self.mutate(strategy_id, "create_block", |snapshot| {
            tree_mutation::plan_add_block(snapshot, parent_id, new)
        })
    }

    pub fn update_block(
        &self,
        strategy_id: StrategyId,
        block_id: BlockId,
        patch: &BlockPatch,
    ) -> Result<StrategyBlock, BlocktraderError> {
        self.mutate(strategy_id, "update_block", |snapshot| {
            tree_mutation::plan_update_block(snapshot, block_id, patch)
        })
    }

    pub fn delete_block(
        &self,
        strategy_id: StrategyId,
        block_id: BlockId,
    ) -> Result<DeletedBlocks, BlocktraderError> {
        let deleted_ids = self.mutate(strategy_id, "delete_block", |snapshot| {
            tree_mutation::plan_delete_block(snapshot, block_id)
        })?;
        Ok(DeletedBlocks { deleted_ids })
    }

    pub fn move_block(
        &self,
        strategy_id: StrategyId,
        block_id: BlockId,
        new_parent_id: BlockId,
        new_order: Option<u32>,
    ) -> Result<StrategyBlock, BlocktraderError> {
        self.mutate(strategy_id, "move_block", |snapshot| {
            tree_mutation::plan_move_block(snapshot, block_id, new_parent_id, new_order)
        })
    }

    pub fn export_strategy(&self, strategy_id: StrategyId) -> Result<StrategyExport, BlocktraderError> {
        let StrategyTree { strategy, root } = self.get_strategy(strategy_id)?;
        Ok(StrategyExport {
            name: strategy.name,
            description: strategy.description,
            is_active: strategy.is_active,
            blocks: root.as_ref().map(tree::flatten).unwrap_or_default(),
        })
    }

    /// Creates a new strategy owned by `owner_id` from an exported document.
    /// The document is fully validated before anything is written; if the
    /// block commit fails afterwards the half-built strategy is removed.
    pub fn import_strategy(
        &self,
        owner_id: &str,
        export: &StrategyExport,
    ) -> Result<StrategyTree, BlocktraderError> {
        tree_mutation::validate_export(export)?;
        let mut strategy = Strategy::new(owner_id, &export.name, &export.description)?;
        strategy.is_active = export.is_active;
        self.store.insert_strategy(&strategy)?;
        let strategy_id = strategy.id;

        let imported = self.create_root(strategy_id).and_then(|_| {
            self.mutate(strategy_id, "import_strategy", |snapshot| {
                tree_mutation::plan_import(snapshot, export)
            })
        });
        match imported {
            Ok(count) => {
                info!(strategy_id = %strategy_id, blocks = count, "strategy imported");
                self.get_strategy(strategy_id)
            }
            Err(e) => {
                self.discard(strategy_id);
                Err(e)
            }
        }
    }

    /// Removes a strategy whose setup failed half way.
    fn discard(&self, strategy_id: StrategyId) {
        if let Err(cleanup) = self.store.delete_strategy(strategy_id) {
            warn!(%strategy_id, error = %cleanup, "failed to remove partially created strategy");
        }
    }

    fn snapshot(&self, strategy_id: StrategyId) -> Result<StrategySnapshot, BlocktraderError> {
        self.store
            .load_snapshot(strategy_id)
            .map_err(report)?
            .ok_or_else(|| BlocktraderError::not_found(Entity::Strategy, strategy_id))
    }

    fn mutate<T>(
        &self,
        strategy_id: StrategyId,
        operation: &str,
        plan: impl Fn(&StrategySnapshot) -> Result<Plan<T>, BlocktraderError>,
    ) -> Result<T, BlocktraderError> {
        for attempt in 1..=self.max_attempts {
            let snapshot = self.snapshot(strategy_id)?;
            let Plan { changes, output } = plan(&snapshot).map_err(report)?;
            if changes.is_empty() {
                debug!(%strategy_id, operation, "nothing to commit");
                return Ok(output);
            }

            let change_set = ChangeSet {
                strategy_id,
                base_revision: snapshot.strategy.revision,
                changes,
            };
            match self.store.commit(&change_set)? {
                CommitOutcome::Applied => {
                    debug!(
                        %strategy_id,
                        operation,
                        revision = change_set.base_revision + 1,
                        changes = change_set.changes.len(),
                        "committed"
                    );
                    return Ok(output);
                }
                CommitOutcome::Conflict => {
                    warn!(
                        %strategy_id,
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        "concurrent modification, re-planning"
                    );
                }
            }
        }
        Err(BlocktraderError::Conflict {
            strategy_id: strategy_id.to_string(),
            attempts: self.max_attempts,
        })
    }
}

/// Logs internal consistency faults with their detail before they are
/// surfaced as a generic failure.
fn report(err: BlocktraderError) -> BlocktraderError {
    if let BlocktraderError::CorruptTree {
        strategy_id,
        reason,
    } = &err
    {
        error!(%strategy_id, %reason, "strategy tree is corrupt");
    }
    err
}
