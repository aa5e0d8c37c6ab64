//! Property tests over randomly grown strategy trees.

#![cfg(feature = "sqlite")]

mod common;

use blocktrader::domain::block::BlockNode;
use blocktrader::domain::error::BlocktraderError;
use blocktrader::domain::ids::{BlockId, StrategyId};
use blocktrader::domain::strategy_service::StrategyService;
use blocktrader::domain::tree;
use common::*;
use proptest::prelude::*;
use proptest::sample::Index;
use std::collections::{HashMap, HashSet};

/// Each step picks an existing block as parent and adds either an IF
/// condition or a logged action under it.
fn growth() -> impl Strategy<Value = Vec<(Index, bool)>> {
    prop::collection::vec((any::<Index>(), any::<bool>()), 1..24)
}

fn grow(steps: &[(Index, bool)]) -> (StrategyService, StrategyId, Vec<BlockId>) {
    let service = memory_service();
    let (sid, root) = new_strategy(&service, "Random");
    let mut blocks = vec![root];
    for (n, (parent, is_condition)) in steps.iter().enumerate() {
        let parent = *parent.get(&blocks);
        let new = if *is_condition {
            sma_if(n as f64)
        } else {
            log_action(&format!("step {n}"))
        };
        blocks.push(service.create_block(sid, parent, &new).unwrap().id);
    }
    (service, sid, blocks)
}

fn parents(node: &BlockNode, out: &mut HashMap<BlockId, Option<BlockId>>) {
    out.insert(node.block.id, node.block.parent_id);
    for child in &node.children {
        parents(child, out);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn nest_and_flatten_round_trip(steps in growth()) {
        let (service, sid, blocks) = grow(&steps);
        let root = root_of(&service, sid);
        prop_assert_eq!(root.block_count(), blocks.len());

        let flat = tree::flatten(&root);
        prop_assert_eq!(flat.len(), blocks.len());
        let renested = tree::nest_blocks(sid, flat).unwrap();
        prop_assert_eq!(renested, root);
    }

    #[test]
    fn sibling_orders_are_unique(steps in growth()) {
        let (service, sid, _) = grow(&steps);
        let root = root_of(&service, sid);
        let mut stack = vec![&root];
        while let Some(node) = stack.pop() {
            let orders: HashSet<u32> = node.children.iter().map(|c| c.block.order).collect();
            prop_assert_eq!(orders.len(), node.children.len());
            let sorted = node.children.windows(2).all(|w| w[0].block.order < w[1].block.order);
            prop_assert!(sorted);
            stack.extend(node.children.iter());
        }
    }

    #[test]
    fn delete_removes_exactly_the_subtree(steps in growth(), pick in any::<Index>()) {
        let (service, sid, blocks) = grow(&steps);
        let target = *pick.get(&blocks[1..]);
        let before = root_of(&service, sid);
        let subtree: HashSet<BlockId> = ids(before.find(target).unwrap()).into_iter().collect();

        let deleted = service.delete_block(sid, target).unwrap();
        let deleted: HashSet<BlockId> = deleted.deleted_ids.into_iter().collect();
        prop_assert_eq!(&deleted, &subtree);

        let after = root_of(&service, sid);
        let remaining: HashSet<BlockId> = ids(&after).into_iter().collect();
        let expected: HashSet<BlockId> = blocks
            .iter()
            .copied()
            .filter(|id| !subtree.contains(id))
            .collect();
        prop_assert_eq!(remaining, expected);

        let mut before_parents = HashMap::new();
        parents(&before, &mut before_parents);
        let mut after_parents = HashMap::new();
        parents(&after, &mut after_parents);
        for (id, parent) in after_parents {
            prop_assert_eq!(before_parents.get(&id), Some(&parent));
        }
    }

    #[test]
    fn moving_under_a_descendant_is_rejected(
        steps in growth(),
        pick in any::<Index>(),
        under in any::<Index>(),
    ) {
        let (service, sid, blocks) = grow(&steps);
        let moving = *pick.get(&blocks[1..]);
        let before = root_of(&service, sid);
        let descendants = ids(before.find(moving).unwrap());
        let target = *under.get(&descendants);

        let err = service.move_block(sid, moving, target, None).unwrap_err();
        prop_assert!(
            matches!(err, BlocktraderError::CycleRejected { .. }),
            "unexpected error {:?}",
            err
        );
        prop_assert_eq!(root_of(&service, sid), before);
    }

    #[test]
    fn moving_elsewhere_keeps_the_tree_whole(
        steps in growth(),
        pick in any::<Index>(),
        under in any::<Index>(),
    ) {
        let (service, sid, blocks) = grow(&steps);
        let moving = *pick.get(&blocks[1..]);
        let before = root_of(&service, sid);
        let excluded: HashSet<BlockId> = ids(before.find(moving).unwrap()).into_iter().collect();
        let candidates: Vec<BlockId> = blocks
            .iter()
            .copied()
            .filter(|id| !excluded.contains(id))
            .collect();
        let target = *under.get(&candidates);

        let moved = service.move_block(sid, moving, target, None).unwrap();
        prop_assert_eq!(moved.parent_id, Some(target));

        let after = root_of(&service, sid);
        prop_assert_eq!(after.block_count(), blocks.len());
        let subtree_before = ids(before.find(moving).unwrap());
        let subtree_after = ids(after.find(target).unwrap().find(moving).unwrap());
        prop_assert_eq!(subtree_before, subtree_after);
    }
}
