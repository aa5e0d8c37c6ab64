//! Strategy persistence port.

use crate::domain::error::BlocktraderError;
use crate::domain::ids::StrategyId;
use crate::domain::strategy::{Strategy, StrategySnapshot};
use crate::domain::tree_mutation::ChangeSet;

/// Result of an optimistic commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every change was written and the revision bumped.
    Applied,
    /// The strategy moved past the change set's base revision (or vanished);
    /// nothing was written.
    Conflict,
}

pub trait StrategyStore: Send + Sync {
    fn insert_strategy(&self, strategy: &Strategy) -> Result<(), BlocktraderError>;

    /// Strategies ordered by creation time, optionally limited to one owner.
    fn list_strategies(&self, owner_id: Option<&str>) -> Result<Vec<Strategy>, BlocktraderError>;

    /// Reads the strategy row and every block, condition and action it owns
    /// from one consistent view.
    fn load_snapshot(&self, id: StrategyId) -> Result<Option<StrategySnapshot>, BlocktraderError>;

    /// Applies `changes` atomically if the strategy is still at
    /// `changes.base_revision`.
    fn commit(&self, changes: &ChangeSet) -> Result<CommitOutcome, BlocktraderError>;

    /// Removes a strategy and everything it owns. Returns false if it did not
    /// exist.
    fn delete_strategy(&self, id: StrategyId) -> Result<bool, BlocktraderError>;
}
