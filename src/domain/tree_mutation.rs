//! Tree mutation planning.
//!
//! Each operation reads a [`StrategySnapshot`] and produces a [`Plan`]: the
//! list of row changes to commit plus the value returned to the caller. No
//! I/O happens here. The service commits the plan against the snapshot's
//! revision, so a plan built from stale state is never applied.

use crate::domain::action::{Action, ActionPayload};
use crate::domain::block::{
    BlockKind, BlockLeaf, BlockNode, BlockPatch, BlockRow, BlockType, NewBlock, StrategyBlock,
};
use crate::domain::condition::{Condition, ConditionPayload};
use crate::domain::error::{BlocktraderError, Entity};
use crate::domain::ids::{ActionId, BlockId, ConditionId, StrategyId};
use crate::domain::payload::Parameters;
use crate::domain::strategy::{Strategy, StrategyExport, StrategyPatch, StrategySnapshot};
use crate::domain::tree;
use std::collections::{HashMap, HashSet};

/// One row-level change. Inserts are listed parents first.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Inserts the ROOT row and records it as the strategy's root.
    InsertRoot(BlockRow),
    InsertCondition(Condition),
    InsertAction(Action),
    InsertBlock(BlockRow),
    /// Rewrites `parent_id`, `parameters` and `order` of an existing row.
    UpdateBlock(BlockRow),
    UpdateCondition(Condition),
    UpdateAction(Action),
    /// Rewrites name, description and active flag.
    UpdateStrategy(Strategy),
    DeleteBlocks(Vec<BlockId>),
    DeleteConditions(Vec<ConditionId>),
    DeleteActions(Vec<ActionId>),
}

/// Changes to apply atomically, valid only if the strategy is still at
/// `base_revision`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub strategy_id: StrategyId,
    pub base_revision: u64,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan<T> {
    pub changes: Vec<Change>,
    pub output: T,
}

impl<T> Plan<T> {
    fn new(changes: Vec<Change>, output: T) -> Self {
        Self { changes, output }
    }
}

/// Parent/child index over the rows of a snapshot.
pub struct TreeIndex<'a> {
    rows: HashMap<BlockId, &'a BlockRow>,
    children: HashMap<BlockId, Vec<&'a BlockRow>>,
}

impl<'a> TreeIndex<'a> {
    pub fn build(rows: &'a [BlockRow]) -> Self {
        let mut index = Self {
            rows: HashMap::with_capacity(rows.len()),
            children: HashMap::new(),
        };
        for row in rows {
            index.rows.insert(row.id, row);
            if let Some(parent_id) = row.parent_id {
                index.children.entry(parent_id).or_default().push(row);
            }
        }
        for siblings in index.children.values_mut() {
            siblings.sort_by_key(|row| row.order);
        }
        index
    }

    pub fn get(&self, id: BlockId) -> Option<&'a BlockRow> {
        self.rows.get(&id).copied()
    }

    pub fn children_of(&self, id: BlockId) -> &[&'a BlockRow] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// One past the highest order under `parent_id`, ignoring `except`.
    pub fn next_order(&self, parent_id: BlockId, except: Option<BlockId>) -> Result<u32, BlocktraderError> {
        let max = self
            .children_of(parent_id)
            .iter()
            .filter(|row| Some(row.id) != except)
            .map(|row| row.order)
            .max();
        match max {
            None => Ok(0),
            Some(max) => max
                .checked_add(1)
                .ok_or_else(|| BlocktraderError::invalid("order", "no order left after u32::MAX")),
        }
    }

    /// The sibling under `parent_id` already holding `order`, if any.
    pub fn holder_of(&self, parent_id: BlockId, order: u32, except: Option<BlockId>) -> Option<BlockId> {
        self.children_of(parent_id)
            .iter()
            .find(|row| row.order == order && Some(row.id) != except)
            .map(|row| row.id)
    }

    /// The subtree rooted at `id`, parents before children.
    pub fn subtree(&self, id: BlockId) -> Vec<&'a BlockRow> {
        let mut out = Vec::new();
        let mut stack: Vec<&BlockRow> = self.get(id).into_iter().collect();
        let mut seen = HashSet::new();
        while let Some(row) = stack.pop() {
            if !seen.insert(row.id) {
                continue;
            }
            out.push(row);
            stack.extend(self.children_of(row.id).iter().rev());
        }
        out
    }

    /// Number of ancestors of `id`; 0 for the ROOT block.
    pub fn depth(&self, strategy_id: StrategyId, id: BlockId) -> Result<usize, BlocktraderError> {
        let mut depth = 0usize;
        let mut current = self.get(id).and_then(|row| row.parent_id);
        while let Some(parent_id) = current {
            depth += 1;
            if depth > self.rows.len() {
                return Err(BlocktraderError::corrupt(
                    strategy_id,
                    format!("ancestor chain of {id} does not reach a root"),
                ));
            }
            current = self.get(parent_id).and_then(|row| row.parent_id);
        }
        Ok(depth)
    }

    /// Levels in the subtree rooted at `id`, counting `id` itself.
    pub fn height(&self, id: BlockId) -> usize {
        let mut height = 0;
        let mut stack: Vec<(BlockId, usize)> = vec![(id, 1)];
        let mut seen = HashSet::new();
        while let Some((id, level)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            height = height.max(level);
            stack.extend(self.children_of(id).iter().map(|row| (row.id, level + 1)));
        }
        height
    }

    /// Walks from `start` up to the root and reports whether `target` is on
    /// the way (including `start` itself).
    pub fn has_ancestor(
        &self,
        strategy_id: StrategyId,
        start: BlockId,
        target: BlockId,
    ) -> Result<bool, BlocktraderError> {
        let mut current = Some(start);
        let mut steps = 0usize;
        while let Some(id) = current {
            if id == target {
                return Ok(true);
            }
            steps += 1;
            if steps > self.rows.len() {
                return Err(BlocktraderError::corrupt(
                    strategy_id,
                    format!("ancestor chain of {start} does not reach a root"),
                ));
            }
            current = self.get(id).and_then(|row| row.parent_id);
        }
        Ok(false)
    }
}

fn ensure_depth(
    index: &TreeIndex<'_>,
    strategy_id: StrategyId,
    parent_id: BlockId,
    height: usize,
) -> Result<(), BlocktraderError> {
    if index.depth(strategy_id, parent_id)? + height > tree::MAX_DEPTH {
        return Err(BlocktraderError::invalid(
            "parentId",
            format!("blocks nest at most {} levels below the root", tree::MAX_DEPTH),
        ));
    }
    Ok(())
}

fn ensure_order_free(
    index: &TreeIndex<'_>,
    parent_id: BlockId,
    order: u32,
    except: Option<BlockId>,
) -> Result<(), BlocktraderError> {
    match index.holder_of(parent_id, order, except) {
        Some(holder) => Err(BlocktraderError::invalid(
            "order",
            format!("order {order} under {parent_id} is already used by block {holder}"),
        )),
        None => Ok(()),
    }
}

fn find_block<'a>(index: &TreeIndex<'a>, id: BlockId) -> Result<&'a BlockRow, BlocktraderError> {
    index
        .get(id)
        .ok_or_else(|| BlocktraderError::not_found(Entity::Block, id))
}

fn find_parent<'a>(index: &TreeIndex<'a>, id: BlockId) -> Result<&'a BlockRow, BlocktraderError> {
    index.get(id).ok_or_else(|| BlocktraderError::ParentNotFound {
        parent_id: id.to_string(),
    })
}

pub fn plan_create_root(snapshot: &StrategySnapshot) -> Result<Plan<BlockRow>, BlocktraderError> {
    let strategy = &snapshot.strategy;
    let has_root_row = snapshot.blocks.iter().any(|row| row.leaf == BlockLeaf::Root);
    if strategy.root_block_id.is_some() || has_root_row {
        return Err(BlocktraderError::AlreadyInitialized {
            strategy_id: strategy.id.to_string(),
        });
    }
    let root = BlockRow {
        id: BlockId::new(),
        strategy_id: strategy.id,
        parent_id: None,
        leaf: BlockLeaf::Root,
        parameters: Parameters::new(),
        order: 0,
    };
    Ok(Plan::new(vec![Change::InsertRoot(root.clone())], root))
}

pub fn plan_add_block(
    snapshot: &StrategySnapshot,
    parent_id: BlockId,
    new: &NewBlock,
) -> Result<Plan<StrategyBlock>, BlocktraderError> {
    let index = TreeIndex::build(&snapshot.blocks);
    let parent = find_parent(&index, parent_id)?;
    ensure_depth(&index, snapshot.strategy.id, parent.id, 1)?;

    let order = match new.order {
        Some(order) => {
            ensure_order_free(&index, parent.id, order, None)?;
            order
        }
        None => index.next_order(parent.id, None)?,
    };
    let kind = new.build_kind(order)?;

    let block = StrategyBlock {
        id: BlockId::new(),
        strategy_id: snapshot.strategy.id,
        parent_id: Some(parent.id),
        kind,
        parameters: new.parameters.clone(),
        order,
    };

    let mut changes = Vec::with_capacity(2);
    match &block.kind {
        BlockKind::ConditionIf { condition } | BlockKind::ConditionElse { condition } => {
            changes.push(Change::InsertCondition(condition.clone()))
        }
        BlockKind::Action { action } => changes.push(Change::InsertAction(action.clone())),
        BlockKind::Root => {}
    }
    changes.push(Change::InsertBlock(block.row()));
    Ok(Plan::new(changes, block))
}

pub fn plan_update_block(
    snapshot: &StrategySnapshot,
    block_id: BlockId,
    patch: &BlockPatch,
) -> Result<Plan<StrategyBlock>, BlocktraderError> {
    let index = TreeIndex::build(&snapshot.blocks);
    let row = find_block(&index, block_id)?;
    let immutable = |field: &str| BlocktraderError::Immutable {
        block_id: block_id.to_string(),
        field: field.to_string(),
    };

    if patch.block_type.is_some_and(|t| t != row.leaf.block_type()) {
        return Err(immutable("blockType"));
    }
    if patch.parent_id.is_some() && patch.parent_id != row.parent_id {
        return Err(immutable("parentId"));
    }
    if patch.condition_id.is_some() && patch.condition_id != row.leaf.condition_id() {
        return Err(immutable("conditionId"));
    }
    if patch.action_id.is_some() && patch.action_id != row.leaf.action_id() {
        return Err(immutable("actionId"));
    }

    let mut block = tree::resolve_row(snapshot, row)?;
    let mut changes = Vec::new();

    let new_order = patch.order.filter(|order| *order != row.order);
    if let Some(order) = new_order {
        match row.parent_id {
            None => return Err(immutable("order")),
            Some(parent_id) => ensure_order_free(&index, parent_id, order, Some(row.id))?,
        }
        block.order = order;
    }
    let new_parameters = patch
        .parameters
        .as_ref()
        .filter(|parameters| **parameters != row.parameters);
    if let Some(parameters) = new_parameters {
        block.parameters = parameters.clone();
    }
    if new_order.is_some() || new_parameters.is_some() {
        changes.push(Change::UpdateBlock(block.row()));
    }

    let block_type = row.leaf.block_type();
    match &mut block.kind {
        BlockKind::ConditionIf { condition } | BlockKind::ConditionElse { condition } => {
            if patch.action.is_some() {
                return Err(BlocktraderError::invalid(
                    "action",
                    format!("{block_type} blocks do not own an action"),
                ));
            }
            if let Some(condition_patch) = &patch.condition {
                let patched = condition.patched(condition_patch)?;
                if patched != *condition {
                    *condition = patched;
                    changes.push(Change::UpdateCondition(condition.clone()));
                }
            }
        }
        BlockKind::Action { action } => {
            if patch.condition.is_some() {
                return Err(BlocktraderError::invalid(
                    "condition",
                    "ACTION blocks do not own a condition",
                ));
            }
            let mut patched = match &patch.action {
                Some(action_patch) => action.patched(action_patch)?,
                None => action.clone(),
            };
            patched.order = block.order;
            if patched != *action {
                *action = patched;
                changes.push(Change::UpdateAction(action.clone()));
            }
        }
        BlockKind::Root => {
            if patch.condition.is_some() || patch.action.is_some() {
                return Err(BlocktraderError::invalid(
                    if patch.condition.is_some() { "condition" } else { "action" },
                    "the ROOT block owns no leaf",
                ));
            }
        }
    }

    Ok(Plan::new(changes, block))
}

pub fn plan_delete_block(
    snapshot: &StrategySnapshot,
    block_id: BlockId,
) -> Result<Plan<Vec<BlockId>>, BlocktraderError> {
    let index = TreeIndex::build(&snapshot.blocks);
    let row = find_block(&index, block_id)?;
    if row.leaf == BlockLeaf::Root {
        return Err(BlocktraderError::RootDeletionForbidden {
            block_id: block_id.to_string(),
        });
    }

    let doomed = index.subtree(block_id);
    let doomed_ids: Vec<BlockId> = doomed.iter().map(|row| row.id).collect();
    let doomed_set: HashSet<BlockId> = doomed_ids.iter().copied().collect();

    // Leaves still referenced from outside the subtree stay.
    let survivors: Vec<&BlockRow> = snapshot
        .blocks
        .iter()
        .filter(|row| !doomed_set.contains(&row.id))
        .collect();
    let conditions: Vec<ConditionId> = doomed
        .iter()
        .filter_map(|row| row.leaf.condition_id())
        .filter(|id| !survivors.iter().any(|s| s.leaf.condition_id() == Some(*id)))
        .collect();
    let actions: Vec<ActionId> = doomed
        .iter()
        .filter_map(|row| row.leaf.action_id())
        .filter(|id| !survivors.iter().any(|s| s.leaf.action_id() == Some(*id)))
        .collect();

    let mut changes = vec![Change::DeleteBlocks(doomed_ids.clone())];
    if !conditions.is_empty() {
        changes.push(Change::DeleteConditions(conditions));
    }
    if !actions.is_empty() {
        changes.push(Change::DeleteActions(actions));
    }
    Ok(Plan::new(changes, doomed_ids))
}

pub fn plan_move_block(
    snapshot: &StrategySnapshot,
    block_id: BlockId,
    new_parent_id: BlockId,
    new_order: Option<u32>,
) -> Result<Plan<StrategyBlock>, BlocktraderError> {
    let index = TreeIndex::build(&snapshot.blocks);
    let row = find_block(&index, block_id)?;
    if row.parent_id.is_none() {
        return Err(BlocktraderError::Immutable {
            block_id: block_id.to_string(),
            field: "parentId".to_string(),
        });
    }
    let cycle = || BlocktraderError::CycleRejected {
        block_id: block_id.to_string(),
        new_parent_id: new_parent_id.to_string(),
    };
    if new_parent_id == block_id {
        return Err(cycle());
    }
    let new_parent = find_parent(&index, new_parent_id)?;
    if index.has_ancestor(snapshot.strategy.id, new_parent.id, block_id)? {
        return Err(cycle());
    }
    ensure_depth(&index, snapshot.strategy.id, new_parent.id, index.height(block_id))?;

    let same_parent = row.parent_id == Some(new_parent.id);
    let order = match new_order {
        Some(order) => {
            ensure_order_free(&index, new_parent.id, order, Some(block_id))?;
            order
        }
        None if same_parent => row.order,
        None => index.next_order(new_parent.id, Some(block_id))?,
    };

    let mut block = tree::resolve_row(snapshot, row)?;
    block.parent_id = Some(new_parent.id);
    block.order = order;

    let mut changes = Vec::with_capacity(2);
    if same_parent && order == row.order {
        return Ok(Plan::new(changes, block));
    }
    changes.push(Change::UpdateBlock(block.row()));
    if let BlockKind::Action { action } = &mut block.kind {
        action.order = order;
        changes.push(Change::UpdateAction(action.clone()));
    }
    Ok(Plan::new(changes, block))
}

pub fn plan_update_strategy(
    snapshot: &StrategySnapshot,
    patch: &StrategyPatch,
) -> Result<Plan<Strategy>, BlocktraderError> {
    let current = &snapshot.strategy;
    let mut strategy = current.clone();
    strategy.apply(patch)?;
    let unchanged = strategy.name == current.name
        && strategy.description == current.description
        && strategy.is_active == current.is_active;
    if unchanged {
        return Ok(Plan::new(Vec::new(), current.clone()));
    }
    let changes = vec![Change::UpdateStrategy(strategy.clone())];
    strategy.revision += 1;
    Ok(Plan::new(changes, strategy))
}

/// Checks an exported document without touching storage: the blocks must
/// form one well-formed tree and every leaf must pass its schema. Structural
/// faults are reported against the `blocks` field.
pub fn validate_export(export: &StrategyExport) -> Result<BlockNode, BlocktraderError> {
    let source_strategy = export
        .blocks
        .first()
        .map(|block| block.strategy_id)
        .ok_or_else(|| BlocktraderError::invalid("blocks", "an export holds at least the ROOT block"))?;
    let tree = tree::nest_blocks(source_strategy, export.blocks.clone()).map_err(|e| match e {
        BlocktraderError::CorruptTree { reason, .. } => BlocktraderError::invalid("blocks", reason),
        other => other,
    })?;
    for block in &export.blocks {
        match &block.kind {
            BlockKind::Root => {}
            BlockKind::ConditionIf { condition } | BlockKind::ConditionElse { condition } => {
                ConditionPayload::from(condition).into_condition(condition.id)?;
            }
            BlockKind::Action { action } => {
                ActionPayload::from(action).into_action(action.id, block.order)?;
            }
        }
    }
    Ok(tree)
}

/// Re-creates the non-root blocks of an exported tree under the root of a
/// freshly initialized strategy. Every block, condition and action gets a new
/// id; orders and parameters are kept.
pub fn plan_import(
    snapshot: &StrategySnapshot,
    export: &StrategyExport,
) -> Result<Plan<usize>, BlocktraderError> {
    let strategy = &snapshot.strategy;
    let root_id = strategy
        .root_block_id
        .ok_or_else(|| BlocktraderError::not_found(Entity::Block, "root"))?;
    let source_tree = validate_export(export)?;

    let mut changes = Vec::with_capacity(export.blocks.len() * 2);
    if !source_tree.block.parameters.is_empty() {
        let root_row = snapshot
            .blocks
            .iter()
            .find(|row| row.id == root_id)
            .ok_or_else(|| BlocktraderError::corrupt(strategy.id, "root row missing"))?;
        changes.push(Change::UpdateBlock(BlockRow {
            parameters: source_tree.block.parameters.clone(),
            ..root_row.clone()
        }));
    }

    let mut stack: Vec<(&BlockNode, BlockId)> = source_tree
        .children
        .iter()
        .rev()
        .map(|child| (child, root_id))
        .collect();
    let mut imported = 0;
    while let Some((node, parent_id)) = stack.pop() {
        let source = &node.block;
        let kind = match &source.kind {
            BlockKind::Root => {
                return Err(BlocktraderError::invalid("blocks", "nested ROOT block"));
            }
            BlockKind::ConditionIf { condition } | BlockKind::ConditionElse { condition } => {
                let condition = ConditionPayload::from(condition).into_condition(ConditionId::new())?;
                changes.push(Change::InsertCondition(condition.clone()));
                if source.block_type() == BlockType::ConditionIf {
                    BlockKind::ConditionIf { condition }
                } else {
                    BlockKind::ConditionElse { condition }
                }
            }
            BlockKind::Action { action } => {
                let action = ActionPayload::from(action)
                    .into_action(ActionId::new(), source.order)?;
                changes.push(Change::InsertAction(action.clone()));
                BlockKind::Action { action }
            }
        };
        let block = StrategyBlock {
            id: BlockId::new(),
            strategy_id: strategy.id,
            parent_id: Some(parent_id),
            kind,
            parameters: source.parameters.clone(),
            order: source.order,
        };
        changes.push(Change::InsertBlock(block.row()));
        imported += 1;
        stack.extend(node.children.iter().rev().map(|child| (child, block.id)));
    }

    Ok(Plan::new(changes, imported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::condition::Operator;
    use serde_json::json;

    /// Applies plans to an in-memory snapshot the way a store would.
    fn apply(snapshot: &mut StrategySnapshot, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::InsertRoot(row) => {
                    snapshot.strategy.root_block_id = Some(row.id);
                    snapshot.blocks.push(row);
                }
                Change::InsertCondition(c) => {
                    snapshot.conditions.insert(c.id, c);
                }
                Change::InsertAction(a) => {
                    snapshot.actions.insert(a.id, a);
                }
                Change::InsertBlock(row) => snapshot.blocks.push(row),
                Change::UpdateBlock(row) => {
                    let slot = snapshot.blocks.iter_mut().find(|b| b.id == row.id).unwrap();
                    *slot = row;
                }
                Change::UpdateCondition(c) => {
                    snapshot.conditions.insert(c.id, c);
                }
                Change::UpdateAction(a) => {
                    snapshot.actions.insert(a.id, a);
                }
                Change::UpdateStrategy(s) => snapshot.strategy = s,
                Change::DeleteBlocks(ids) => snapshot.blocks.retain(|b| !ids.contains(&b.id)),
                Change::DeleteConditions(ids) => snapshot.conditions.retain(|id, _| !ids.contains(id)),
                Change::DeleteActions(ids) => snapshot.actions.retain(|id, _| !ids.contains(id)),
            }
        }
        snapshot.strategy.revision += 1;
    }

    fn initialized() -> (StrategySnapshot, BlockId) {
        let strategy = Strategy::new("owner", "test", "").unwrap();
        let mut snapshot = StrategySnapshot::empty(strategy);
        let plan = plan_create_root(&snapshot).unwrap();
        let root = plan.output.id;
        apply(&mut snapshot, plan.changes);
        (snapshot, root)
    }

    fn sma() -> ConditionPayload {
        ConditionPayload::new("SMA", "AAPL", "1min", Operator::LessThan, 212.0)
    }

    fn add(snapshot: &mut StrategySnapshot, parent: BlockId, new: NewBlock) -> StrategyBlock {
        let plan = plan_add_block(snapshot, parent, &new).unwrap();
        apply(snapshot, plan.changes);
        plan.output
    }

    fn add_if(snapshot: &mut StrategySnapshot, parent: BlockId) -> BlockId {
        add(snapshot, parent, NewBlock::condition_if(sma())).id
    }

    #[test]
    fn create_root_once() {
        let (snapshot, root) = initialized();
        assert_eq!(snapshot.strategy.root_block_id, Some(root));
        assert!(matches!(
            plan_create_root(&snapshot),
            Err(BlocktraderError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn add_assigns_next_order() {
        let (mut snapshot, root) = initialized();
        let first = add(&mut snapshot, root, NewBlock::condition_if(sma()));
        assert_eq!(first.order, 0);
        add(&mut snapshot, root, NewBlock::condition_if(sma()).at(10));
        let third = add(&mut snapshot, root, NewBlock::action(ActionPayload::log_message("x")));
        assert_eq!(third.order, 11);
        assert_eq!(third.kind.action().unwrap().order, 11);
    }

    #[test]
    fn add_rejects_taken_order() {
        let (mut snapshot, root) = initialized();
        add(&mut snapshot, root, NewBlock::condition_if(sma()).at(3));
        match plan_add_block(&snapshot, root, &NewBlock::condition_if(sma()).at(3)) {
            Err(BlocktraderError::InvalidPayload { field, .. }) => assert_eq!(field, "order"),
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
    }

    #[test]
    fn add_under_missing_parent() {
        let (snapshot, _) = initialized();
        assert!(matches!(
            plan_add_block(&snapshot, BlockId::new(), &NewBlock::condition_if(sma())),
            Err(BlocktraderError::ParentNotFound { .. })
        ));
    }

    #[test]
    fn add_to_uninitialized_strategy_has_no_parent() {
        let snapshot = StrategySnapshot::empty(Strategy::new("o", "s", "").unwrap());
        assert!(matches!(
            plan_add_block(&snapshot, BlockId::new(), &NewBlock::condition_if(sma())),
            Err(BlocktraderError::ParentNotFound { .. })
        ));
    }

    #[test]
    fn add_plan_inserts_leaf_before_block() {
        let (snapshot, root) = initialized();
        let plan = plan_add_block(&snapshot, root, &NewBlock::condition_if(sma())).unwrap();
        assert!(matches!(plan.changes[0], Change::InsertCondition(_)));
        assert!(matches!(plan.changes[1], Change::InsertBlock(_)));
    }

    #[test]
    fn update_rejects_locked_fields() {
        let (mut snapshot, root) = initialized();
        let id = add_if(&mut snapshot, root);
        let cases = [
            (
                BlockPatch {
                    block_type: Some(BlockType::Action),
                    ..Default::default()
                },
                "blockType",
            ),
            (
                BlockPatch {
                    parent_id: Some(BlockId::new()),
                    ..Default::default()
                },
                "parentId",
            ),
            (
                BlockPatch {
                    condition_id: Some(ConditionId::new()),
                    ..Default::default()
                },
                "conditionId",
            ),
            (
                BlockPatch {
                    action_id: Some(ActionId::new()),
                    ..Default::default()
                },
                "actionId",
            ),
        ];
        for (patch, expected) in cases {
            match plan_update_block(&snapshot, id, &patch) {
                Err(BlocktraderError::Immutable { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected Immutable({expected}), got {other:?}"),
            }
        }
    }

    #[test]
    fn update_accepts_unchanged_locked_fields() {
        let (mut snapshot, root) = initialized();
        let id = add_if(&mut snapshot, root);
        let patch = BlockPatch {
            block_type: Some(BlockType::ConditionIf),
            parent_id: Some(root),
            ..Default::default()
        };
        let plan = plan_update_block(&snapshot, id, &patch).unwrap();
        assert!(plan.changes.is_empty());
    }

    #[test]
    fn update_condition_fields_in_place() {
        let (mut snapshot, root) = initialized();
        let block = add(&mut snapshot, root, NewBlock::condition_if(sma()));
        let condition_id = block.kind.condition().unwrap().id;
        let patch = BlockPatch {
            condition: Some(ConditionPayload {
                target_value: Some(json!(150)),
                ..Default::default()
            }),
            parameters: Some(json!({"note": "x"}).as_object().cloned().unwrap()),
            ..Default::default()
        };
        let plan = plan_update_block(&snapshot, block.id, &patch).unwrap();
        let updated = plan.output.kind.condition().unwrap();
        assert_eq!(updated.id, condition_id);
        assert_eq!(updated.target_value, 150.0);
        assert_eq!(plan.output.parameters.get("note"), Some(&json!("x")));
        assert_eq!(plan.changes.len(), 2);
    }

    #[test]
    fn update_rejects_wrong_leaf_patch() {
        let (mut snapshot, root) = initialized();
        let id = add_if(&mut snapshot, root);
        let patch = BlockPatch {
            action: Some(ActionPayload::log_message("x")),
            ..Default::default()
        };
        assert!(matches!(
            plan_update_block(&snapshot, id, &patch),
            Err(BlocktraderError::InvalidPayload { field, .. }) if field == "action"
        ));
    }

    #[test]
    fn update_order_checks_siblings_and_mirrors_action() {
        let (mut snapshot, root) = initialized();
        add_if(&mut snapshot, root);
        let action = add(&mut snapshot, root, NewBlock::action(ActionPayload::log_message("x")));
        let taken = BlockPatch {
            order: Some(0),
            ..Default::default()
        };
        assert!(plan_update_block(&snapshot, action.id, &taken).is_err());

        let free = BlockPatch {
            order: Some(9),
            ..Default::default()
        };
        let plan = plan_update_block(&snapshot, action.id, &free).unwrap();
        assert_eq!(plan.output.order, 9);
        assert_eq!(plan.output.kind.action().unwrap().order, 9);
    }

    #[test]
    fn root_order_is_locked() {
        let (snapshot, root) = initialized();
        let patch = BlockPatch {
            order: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            plan_update_block(&snapshot, root, &patch),
            Err(BlocktraderError::Immutable { field, .. }) if field == "order"
        ));
    }

    #[test]
    fn update_missing_block() {
        let (snapshot, _) = initialized();
        assert!(matches!(
            plan_update_block(&snapshot, BlockId::new(), &BlockPatch::default()),
            Err(BlocktraderError::NotFound { entity: Entity::Block, .. })
        ));
    }

    #[test]
    fn delete_removes_subtree_and_leaves() {
        let (mut snapshot, root) = initialized();
        let branch = add_if(&mut snapshot, root);
        let nested = add_if(&mut snapshot, branch);
        add(&mut snapshot, nested, NewBlock::action(ActionPayload::log_message("a")));
        let keep = add_if(&mut snapshot, root);

        let plan = plan_delete_block(&snapshot, branch).unwrap();
        assert_eq!(plan.output.len(), 3);
        assert_eq!(plan.output[0], branch);
        apply(&mut snapshot, plan.changes);

        let ids: Vec<BlockId> = snapshot.blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![root, keep]);
        assert_eq!(snapshot.conditions.len(), 1);
        assert!(snapshot.actions.is_empty());
    }

    #[test]
    fn delete_root_forbidden() {
        let (snapshot, root) = initialized();
        assert!(matches!(
            plan_delete_block(&snapshot, root),
            Err(BlocktraderError::RootDeletionForbidden { .. })
        ));
    }

    #[test]
    fn move_rejects_self_and_descendants() {
        let (mut snapshot, root) = initialized();
        let a = add_if(&mut snapshot, root);
        let b = add_if(&mut snapshot, a);
        let c = add_if(&mut snapshot, b);
        for target in [a, b, c] {
            assert!(matches!(
                plan_move_block(&snapshot, a, target, None),
                Err(BlocktraderError::CycleRejected { .. })
            ));
        }
    }

    #[test]
    fn move_appends_under_new_parent() {
        let (mut snapshot, root) = initialized();
        let a = add_if(&mut snapshot, root);
        let b = add_if(&mut snapshot, root);
        add_if(&mut snapshot, a);
        let plan = plan_move_block(&snapshot, b, a, None).unwrap();
        assert_eq!(plan.output.parent_id, Some(a));
        assert_eq!(plan.output.order, 1);
        apply(&mut snapshot, plan.changes);
        let tree = tree::nest(&snapshot).unwrap().unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].children.len(), 2);
    }

    #[test]
    fn move_root_is_immutable() {
        let (mut snapshot, root) = initialized();
        let a = add_if(&mut snapshot, root);
        assert!(matches!(
            plan_move_block(&snapshot, root, a, None),
            Err(BlocktraderError::Immutable { .. })
        ));
    }

    #[test]
    fn move_to_missing_parent() {
        let (mut snapshot, root) = initialized();
        let a = add_if(&mut snapshot, root);
        assert!(matches!(
            plan_move_block(&snapshot, a, BlockId::new(), None),
            Err(BlocktraderError::ParentNotFound { .. })
        ));
    }

    #[test]
    fn import_rebuilds_tree_with_new_ids() {
        let (mut source, root) = initialized();
        let branch = add_if(&mut source, root);
        add(&mut source, branch, NewBlock::action(ActionPayload::log_message("hit")));
        let tree = tree::nest(&source).unwrap().unwrap();
        let export = StrategyExport {
            name: "copy".into(),
            description: String::new(),
            is_active: false,
            blocks: tree::flatten(&tree),
        };

        let (mut target, _) = initialized();
        let plan = plan_import(&target, &export).unwrap();
        assert_eq!(plan.output, 2);
        apply(&mut target, plan.changes);
        let copy = tree::nest(&target).unwrap().unwrap();
        assert_eq!(copy.block_count(), 3);
        assert_ne!(copy.children[0].block.id, branch);
        assert_eq!(
            copy.children[0].children[0].block.kind.action().unwrap().parameters,
            tree.children[0].children[0].block.kind.action().unwrap().parameters
        );
    }

    /// Adds a chain of IF blocks under `parent` and returns the deepest one.
    fn chain(snapshot: &mut StrategySnapshot, parent: BlockId, len: usize) -> BlockId {
        (0..len).fold(parent, |parent, _| add_if(snapshot, parent))
    }

    #[test]
    fn add_stops_at_max_depth() {
        let (mut snapshot, root) = initialized();
        let deepest = chain(&mut snapshot, root, tree::MAX_DEPTH);
        match plan_add_block(&snapshot, deepest, &NewBlock::condition_if(sma())) {
            Err(BlocktraderError::InvalidPayload { field, .. }) => assert_eq!(field, "parentId"),
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
        assert_eq!(tree::nest(&snapshot).unwrap().unwrap().block_count(), tree::MAX_DEPTH + 1);
    }

    #[test]
    fn move_counts_the_moved_subtree_depth() {
        let (mut snapshot, root) = initialized();
        let deep = chain(&mut snapshot, root, tree::MAX_DEPTH - 1);
        let branch = add_if(&mut snapshot, root);
        let child = add_if(&mut snapshot, branch);

        let index = TreeIndex::build(&snapshot.blocks);
        assert_eq!(index.height(branch), 2);
        assert_eq!(index.depth(snapshot.strategy.id, deep).unwrap(), tree::MAX_DEPTH - 1);

        match plan_move_block(&snapshot, branch, deep, None) {
            Err(BlocktraderError::InvalidPayload { field, .. }) => assert_eq!(field, "parentId"),
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
        let plan = plan_move_block(&snapshot, child, deep, None).unwrap();
        apply(&mut snapshot, plan.changes);
        assert!(tree::nest(&snapshot).is_ok());
    }

    #[test]
    fn empty_strategy_patch_changes_nothing() {
        let (snapshot, _) = initialized();
        let plan = plan_update_strategy(&snapshot, &StrategyPatch::default()).unwrap();
        assert!(plan.changes.is_empty());
        assert_eq!(plan.output, snapshot.strategy);

        let same = StrategyPatch {
            name: Some(snapshot.strategy.name.clone()),
            is_active: Some(snapshot.strategy.is_active),
            ..StrategyPatch::default()
        };
        assert!(plan_update_strategy(&snapshot, &same).unwrap().changes.is_empty());

        let rename = StrategyPatch {
            name: Some("renamed".into()),
            ..StrategyPatch::default()
        };
        let plan = plan_update_strategy(&snapshot, &rename).unwrap();
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.output.revision, snapshot.strategy.revision + 1);
    }

    #[test]
    fn import_rejects_broken_export() {
        let (target, _) = initialized();
        let export = StrategyExport {
            name: "x".into(),
            description: String::new(),
            is_active: false,
            blocks: vec![],
        };
        assert!(matches!(
            plan_import(&target, &export),
            Err(BlocktraderError::InvalidPayload { .. })
        ));
    }
}
