//! Tree materializer: flat block rows to a nested tree and back.
//!
//! Rows are grouped by parent id in one pass and attached top-down from the
//! ROOT block. Every structural violation found on the way is reported as
//! `CorruptTree`; the mutation API is supposed to make them impossible.

use crate::domain::block::{BlockKind, BlockLeaf, BlockNode, BlockRow, BlockType, StrategyBlock};
use crate::domain::error::{BlocktraderError, Entity};
use crate::domain::ids::{BlockId, StrategyId};
use crate::domain::strategy::StrategySnapshot;
use std::collections::{HashMap, HashSet};

/// Deepest level a block may sit at, counting the ROOT block as level 0.
pub const MAX_DEPTH: usize = 64;

/// Builds the nested tree of a persisted strategy. Returns `None` for a
/// strategy whose root block has not been created yet.
pub fn nest(snapshot: &StrategySnapshot) -> Result<Option<BlockNode>, BlocktraderError> {
    let strategy = &snapshot.strategy;
    if snapshot.blocks.is_empty() {
        return match strategy.root_block_id {
            None => Ok(None),
            Some(root_id) => Err(BlocktraderError::corrupt(
                strategy.id,
                format!("root block {root_id} is referenced but has no row"),
            )),
        };
    }

    let root = nest_blocks(strategy.id, resolve_blocks(snapshot)?)?;
    if strategy.root_block_id != Some(root.block.id) {
        return Err(BlocktraderError::corrupt(
            strategy.id,
            format!(
                "rootBlockId {:?} does not match ROOT row {}",
                strategy.root_block_id, root.block.id
            ),
        ));
    }
    Ok(Some(root))
}

/// Joins each block row with the condition or action it references.
pub fn resolve_blocks(
    snapshot: &StrategySnapshot,
) -> Result<Vec<StrategyBlock>, BlocktraderError> {
    snapshot
        .blocks
        .iter()
        .map(|row| resolve_row(snapshot, row))
        .collect()
}

pub fn resolve_row(
    snapshot: &StrategySnapshot,
    row: &BlockRow,
) -> Result<StrategyBlock, BlocktraderError> {
    let strategy_id = snapshot.strategy.id;
    let kind = match row.leaf {
        BlockLeaf::Root => BlockKind::Root,
        BlockLeaf::ConditionIf(id) | BlockLeaf::ConditionElse(id) => {
            let condition = snapshot
                .conditions
                .get(&id)
                .cloned()
                .ok_or_else(|| missing_leaf(strategy_id, row.id, Entity::Condition, id))?;
            if row.leaf.block_type() == BlockType::ConditionIf {
                BlockKind::ConditionIf { condition }
            } else {
                BlockKind::ConditionElse { condition }
            }
        }
        BlockLeaf::Action(id) => BlockKind::Action {
            action: snapshot
                .actions
                .get(&id)
                .cloned()
                .ok_or_else(|| missing_leaf(strategy_id, row.id, Entity::Action, id))?,
        },
    };
    Ok(StrategyBlock {
        id: row.id,
        strategy_id: row.strategy_id,
        parent_id: row.parent_id,
        kind,
        parameters: row.parameters.clone(),
        order: row.order,
    })
}

fn missing_leaf(
    strategy_id: StrategyId,
    block_id: BlockId,
    entity: Entity,
    id: impl std::fmt::Display,
) -> BlocktraderError {
    BlocktraderError::corrupt(
        strategy_id,
        format!("block {block_id} references missing {entity} {id}"),
    )
}

/// Assembles a flat set of blocks into a tree rooted at the single ROOT block.
pub fn nest_blocks(
    strategy_id: StrategyId,
    blocks: Vec<StrategyBlock>,
) -> Result<BlockNode, BlocktraderError> {
    let corrupt = |reason: String| BlocktraderError::corrupt(strategy_id, reason);

    let mut ids = HashSet::with_capacity(blocks.len());
    for block in &blocks {
        if block.strategy_id != strategy_id {
            return Err(corrupt(format!(
                "block {} belongs to strategy {}",
                block.id, block.strategy_id
            )));
        }
        if !ids.insert(block.id) {
            return Err(corrupt(format!("duplicate block id {}", block.id)));
        }
    }

    let mut root = None;
    let mut by_parent: HashMap<BlockId, Vec<StrategyBlock>> = HashMap::new();
    for block in blocks {
        match (block.parent_id, block.block_type()) {
            (None, BlockType::Root) => {
                if let Some(first) = root.replace(block) {
                    return Err(corrupt(format!(
                        "more than one ROOT block (first {})",
                        first.id
                    )));
                }
            }
            (None, block_type) => {
                return Err(corrupt(format!(
                    "{block_type} block {} has no parent",
                    block.id
                )));
            }
            (Some(_), BlockType::Root) => {
                return Err(corrupt(format!("ROOT block {} has a parent", block.id)));
            }
            (Some(parent_id), _) => {
                if !ids.contains(&parent_id) {
                    return Err(corrupt(format!(
                        "parent {parent_id} of block {} does not exist",
                        block.id
                    )));
                }
                by_parent.entry(parent_id).or_default().push(block);
            }
        }
    }
    let root = root.ok_or_else(|| corrupt("no ROOT block".to_string()))?;

    for (parent_id, siblings) in by_parent.iter_mut() {
        siblings.sort_by_key(|b| b.order);
        if let Some(pair) = siblings.windows(2).find(|w| w[0].order == w[1].order) {
            return Err(corrupt(format!(
                "blocks {} and {} share order {} under {parent_id}",
                pair[0].id, pair[1].id, pair[0].order
            )));
        }
    }

    let mut level = vec![root.id];
    let mut depth = 0;
    while !level.is_empty() {
        if depth > MAX_DEPTH {
            return Err(corrupt(format!(
                "blocks nest deeper than {MAX_DEPTH} levels"
            )));
        }
        level = level
            .iter()
            .filter_map(|id| by_parent.get(id))
            .flatten()
            .map(|block| block.id)
            .collect();
        depth += 1;
    }

    let tree = attach(root, &mut by_parent);
    let reachable = tree.block_count();
    if reachable != ids.len() {
        return Err(corrupt(format!(
            "{} blocks are not reachable from the root",
            ids.len() - reachable
        )));
    }
    Ok(tree)
}

fn attach(block: StrategyBlock, by_parent: &mut HashMap<BlockId, Vec<StrategyBlock>>) -> BlockNode {
    let children = by_parent
        .remove(&block.id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| attach(child, by_parent))
        .collect();
    BlockNode { block, children }
}

/// Flattens a tree into blocks, parents before children and siblings in
/// ascending order.
pub fn flatten(root: &BlockNode) -> Vec<StrategyBlock> {
    let mut out = Vec::with_capacity(root.block_count());
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        out.push(node.block.clone());
        let mut children: Vec<&BlockNode> = node.children.iter().collect();
        children.sort_by_key(|child| std::cmp::Reverse(child.block.order));
        stack.extend(children);
    }
    out
}
