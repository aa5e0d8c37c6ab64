//! Strategy blocks: the typed nodes of a strategy tree.
//!
//! Two shapes exist for a block:
//! - [`BlockRow`] is what storage holds. Its [`BlockLeaf`] carries the id of
//!   the owned condition or action, tagged by block type.
//! - [`StrategyBlock`] is the materialized form. Its [`BlockKind`] carries the
//!   owned condition or action itself.
//!
//! In both, a leaf that does not match its block type cannot be expressed.

use crate::domain::action::{Action, ActionPayload};
use crate::domain::condition::{Condition, ConditionPayload};
use crate::domain::error::BlocktraderError;
use crate::domain::ids::{ActionId, BlockId, ConditionId, StrategyId};
use crate::domain::payload::Parameters;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockType {
    Root,
    ConditionIf,
    ConditionElse,
    Action,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Root => "ROOT",
            BlockType::ConditionIf => "CONDITION_IF",
            BlockType::ConditionElse => "CONDITION_ELSE",
            BlockType::Action => "ACTION",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = BlocktraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ROOT" => Ok(BlockType::Root),
            "CONDITION_IF" => Ok(BlockType::ConditionIf),
            "CONDITION_ELSE" => Ok(BlockType::ConditionElse),
            "ACTION" => Ok(BlockType::Action),
            _ => Err(BlocktraderError::invalid(
                "blockType",
                format!("unknown block type {s:?}"),
            )),
        }
    }
}

/// Leaf reference of a persisted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockLeaf {
    Root,
    ConditionIf(ConditionId),
    ConditionElse(ConditionId),
    Action(ActionId),
}

impl BlockLeaf {
    /// Rebuilds a leaf from the nullable columns of a stored row. The error
    /// describes the inconsistency and is reported as a corrupt tree.
    pub fn from_columns(
        block_type: &str,
        condition_id: Option<ConditionId>,
        action_id: Option<ActionId>,
    ) -> Result<Self, String> {
        let block_type: BlockType = block_type.parse().map_err(|e| format!("{e}"))?;
        match (block_type, condition_id, action_id) {
            (BlockType::Root, None, None) => Ok(BlockLeaf::Root),
            (BlockType::ConditionIf, Some(c), None) => Ok(BlockLeaf::ConditionIf(c)),
            (BlockType::ConditionElse, Some(c), None) => Ok(BlockLeaf::ConditionElse(c)),
            (BlockType::Action, None, Some(a)) => Ok(BlockLeaf::Action(a)),
            (t, c, a) => Err(format!(
                "{t} block with conditionId={c:?} actionId={a:?}"
            )),
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            BlockLeaf::Root => BlockType::Root,
            BlockLeaf::ConditionIf(_) => BlockType::ConditionIf,
            BlockLeaf::ConditionElse(_) => BlockType::ConditionElse,
            BlockLeaf::Action(_) => BlockType::Action,
        }
    }

    pub fn condition_id(&self) -> Option<ConditionId> {
        match self {
            BlockLeaf::ConditionIf(id) | BlockLeaf::ConditionElse(id) => Some(*id),
            _ => None,
        }
    }

    pub fn action_id(&self) -> Option<ActionId> {
        match self {
            BlockLeaf::Action(id) => Some(*id),
            _ => None,
        }
    }
}

/// A block as stored: one row of `strategy_blocks`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub id: BlockId,
    pub strategy_id: StrategyId,
    pub parent_id: Option<BlockId>,
    pub leaf: BlockLeaf,
    pub parameters: Parameters,
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "blockType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockKind {
    Root,
    ConditionIf { condition: Condition },
    ConditionElse { condition: Condition },
    Action { action: Action },
}

impl BlockKind {
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockKind::Root => BlockType::Root,
            BlockKind::ConditionIf { .. } => BlockType::ConditionIf,
            BlockKind::ConditionElse { .. } => BlockType::ConditionElse,
            BlockKind::Action { .. } => BlockType::Action,
        }
    }

    pub fn leaf(&self) -> BlockLeaf {
        match self {
            BlockKind::Root => BlockLeaf::Root,
            BlockKind::ConditionIf { condition } => BlockLeaf::ConditionIf(condition.id),
            BlockKind::ConditionElse { condition } => BlockLeaf::ConditionElse(condition.id),
            BlockKind::Action { action } => BlockLeaf::Action(action.id),
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            BlockKind::ConditionIf { condition } | BlockKind::ConditionElse { condition } => {
                Some(condition)
            }
            _ => None,
        }
    }

    pub fn action(&self) -> Option<&Action> {
        match self {
            BlockKind::Action { action } => Some(action),
            _ => None,
        }
    }
}

/// A block with its owned condition or action resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyBlock {
    pub id: BlockId,
    pub strategy_id: StrategyId,
    pub parent_id: Option<BlockId>,
    #[serde(flatten)]
    pub kind: BlockKind,
    #[serde(default)]
    pub parameters: Parameters,
    pub order: u32,
}

impl StrategyBlock {
    pub fn block_type(&self) -> BlockType {
        self.kind.block_type()
    }

    pub fn row(&self) -> BlockRow {
        BlockRow {
            id: self.id,
            strategy_id: self.strategy_id,
            parent_id: self.parent_id,
            leaf: self.kind.leaf(),
            parameters: self.parameters.clone(),
            order: self.order,
        }
    }
}

/// A materialized tree node. Children are owned and sorted by `order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockNode {
    #[serde(flatten)]
    pub block: StrategyBlock,
    #[serde(default)]
    pub children: Vec<BlockNode>,
}

impl BlockNode {
    /// Number of blocks in this subtree, including this one.
    pub fn block_count(&self) -> usize {
        1 + self.children.iter().map(BlockNode::block_count).sum::<usize>()
    }

    pub fn find(&self, id: BlockId) -> Option<&BlockNode> {
        if self.block.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }
}

/// Input of `addBlock`: the block type plus the leaf payload it requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlock {
    pub block_type: BlockType,
    #[serde(default)]
    pub condition: Option<ConditionPayload>,
    #[serde(default)]
    pub action: Option<ActionPayload>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub order: Option<u32>,
}

impl NewBlock {
    pub fn new(block_type: BlockType) -> Self {
        Self {
            block_type,
            condition: None,
            action: None,
            parameters: Parameters::new(),
            order: None,
        }
    }

    pub fn condition_if(condition: ConditionPayload) -> Self {
        Self {
            condition: Some(condition),
            ..Self::new(BlockType::ConditionIf)
        }
    }

    pub fn condition_else(condition: ConditionPayload) -> Self {
        Self {
            condition: Some(condition),
            ..Self::new(BlockType::ConditionElse)
        }
    }

    pub fn action(action: ActionPayload) -> Self {
        Self {
            action: Some(action),
            ..Self::new(BlockType::Action)
        }
    }

    pub fn at(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Validates the leaf payload against the block type and builds the
    /// owned condition or action with fresh ids.
    pub fn build_kind(&self, order: u32) -> Result<BlockKind, BlocktraderError> {
        let kind_name = self.block_type.as_str();
        match self.block_type {
            BlockType::Root => Err(BlocktraderError::invalid(
                "blockType",
                "ROOT blocks are created together with their strategy",
            )),
            BlockType::ConditionIf | BlockType::ConditionElse => {
                if self.action.is_some() {
                    return Err(BlocktraderError::invalid(
                        "action",
                        format!("{kind_name} blocks cannot own an action"),
                    ));
                }
                let payload = self.condition.clone().ok_or_else(|| {
                    BlocktraderError::invalid(
                        "condition",
                        format!("{kind_name} blocks require a condition payload"),
                    )
                })?;
                let condition = payload.into_condition(ConditionId::new())?;
                Ok(if self.block_type == BlockType::ConditionIf {
                    BlockKind::ConditionIf { condition }
                } else {
                    BlockKind::ConditionElse { condition }
                })
            }
            BlockType::Action => {
                if self.condition.is_some() {
                    return Err(BlocktraderError::invalid(
                        "condition",
                        "ACTION blocks cannot own a condition",
                    ));
                }
                let payload = self.action.clone().ok_or_else(|| {
                    BlocktraderError::invalid("action", "ACTION blocks require an action payload")
                })?;
                let action = payload.into_action(ActionId::new(), order)?;
                Ok(BlockKind::Action { action })
            }
        }
    }
}

/// Input of `updateBlock`. The structural fields are accepted only when they
/// repeat the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockPatch {
    pub block_type: Option<BlockType>,
    pub parent_id: Option<BlockId>,
    pub condition_id: Option<ConditionId>,
    pub action_id: Option<ActionId>,
    pub parameters: Option<Parameters>,
    pub order: Option<u32>,
    pub condition: Option<ConditionPayload>,
    pub action: Option<ActionPayload>,
}
