//! Strategy records and their materialized tree.

use crate::domain::action::Action;
use crate::domain::block::{BlockNode, BlockRow, StrategyBlock};
use crate::domain::condition::Condition;
use crate::domain::error::BlocktraderError;
use crate::domain::ids::{ActionId, BlockId, ConditionId, StrategyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub id: StrategyId,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub root_block_id: Option<BlockId>,
    /// Bumped by every committed mutation of this strategy.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    /// A fresh, inactive strategy without a root block.
    pub fn new(owner_id: &str, name: &str, description: &str) -> Result<Self, BlocktraderError> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(BlocktraderError::invalid("ownerId", "must not be blank"));
        }
        let name = validate_name(name)?;
        let now = Utc::now();
        Ok(Self {
            id: StrategyId::new(),
            owner_id: owner_id.to_string(),
            name,
            description: description.trim().to_string(),
            is_active: false,
            root_block_id: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply(&mut self, patch: &StrategyPatch) -> Result<(), BlocktraderError> {
        if let Some(name) = &patch.name {
            self.name = validate_name(name)?;
        }
        if let Some(description) = &patch.description {
            self.description = description.trim().to_string();
        }
        if let Some(is_active) = patch.is_active {
            self.is_active = is_active;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<String, BlocktraderError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(BlocktraderError::invalid("name", "must not be blank"));
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

/// A strategy together with its nested block tree, as handed to renderers and
/// evaluators. `root` is `None` only for a strategy whose root block was never
/// created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyTree {
    #[serde(flatten)]
    pub strategy: Strategy,
    pub root: Option<BlockNode>,
}

/// Everything persisted for one strategy, read in a single consistent pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySnapshot {
    pub strategy: Strategy,
    pub blocks: Vec<BlockRow>,
    pub conditions: HashMap<ConditionId, Condition>,
    pub actions: HashMap<ActionId, Action>,
}

impl StrategySnapshot {
    pub fn empty(strategy: Strategy) -> Self {
        Self {
            strategy,
            blocks: Vec::new(),
            conditions: HashMap::new(),
            actions: HashMap::new(),
        }
    }
}

/// Portable form of a strategy used for bulk export and import. `blocks` is
/// the flattened tree, root first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyExport {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_active: bool,
    pub blocks: Vec<StrategyBlock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_strategy_has_no_root() {
        let s = Strategy::new("user-1", "  Dip Buyer ", "buys dips").unwrap();
        assert_eq!(s.name, "Dip Buyer");
        assert_eq!(s.owner_id, "user-1");
        assert!(s.root_block_id.is_none());
        assert!(!s.is_active);
        assert_eq!(s.revision, 0);
    }

    #[test]
    fn blank_name_rejected() {
        assert!(matches!(
            Strategy::new("user-1", "  ", ""),
            Err(BlocktraderError::InvalidPayload { field, .. }) if field == "name"
        ));
        assert!(Strategy::new("", "x", "").is_err());
    }

    #[test]
    fn patch_updates_metadata() {
        let mut s = Strategy::new("user-1", "A", "").unwrap();
        s.apply(&StrategyPatch {
            name: Some("B".into()),
            is_active: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.name, "B");
        assert!(s.is_active);
        assert!(s.updated_at >= s.created_at);
    }

    #[test]
    fn patch_rejects_blank_name() {
        let mut s = Strategy::new("user-1", "A", "").unwrap();
        let patch = StrategyPatch {
            name: Some(String::new()),
            ..Default::default()
        };
        assert!(s.apply(&patch).is_err());
        assert_eq!(s.name, "A");
    }
}
