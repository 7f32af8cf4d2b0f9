//! Causal chain traversal over `caused_by_receipt_id` edges.

use std::collections::HashSet;

use receiptgate_core::{Receipt, ReceiptGateError};
use serde::Serialize;

use crate::ReceiptStore;

pub const DEFAULT_CHAIN_DEPTH: usize = 64;
pub const MAX_CHAIN_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ChainDirection {
    #[default]
    Ancestors,
    Descendants,
    Both,
}

impl ChainDirection {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ancestors" => Some(Self::Ancestors),
            "descendants" => Some(Self::Descendants),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ancestors => "ancestors",
            Self::Descendants => "descendants",
            Self::Both => "both",
        }
    }
}

/// One receipt in a flattened chain, tagged with its distance from the
/// starting receipt.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChainEntry {
    pub depth: u32,
    pub receipt: Receipt,
}

/// Walks the causal graph from `receipt_id`, depth-first and cycle-safe.
///
/// The visited set is keyed on `receipt_id`, so the walk terminates even when
/// a corrupted edge projection contains cycles. `max_depth` is clamped to
/// [`MAX_CHAIN_DEPTH`]; the starting receipt is depth 0. For `Both`,
/// ancestors are listed before descendants.
///
/// # Errors
/// Returns [`ReceiptGateError::NotFound`] when the starting receipt does not
/// exist, or any store error.
pub async fn walk_chain(
    store: &dyn ReceiptStore,
    receipt_id: &str,
    direction: ChainDirection,
    max_depth: usize,
) -> Result<Vec<ChainEntry>, ReceiptGateError> {
    let max_depth = max_depth.clamp(1, MAX_CHAIN_DEPTH);
    let start = store
        .get_by_receipt_id(receipt_id)
        .await?
        .ok_or(ReceiptGateError::NotFound)?;

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(start.receipt_id.clone());
    let mut entries = vec![ChainEntry {
        depth: 0,
        receipt: start,
    }];

    if matches!(direction, ChainDirection::Ancestors | ChainDirection::Both) {
        walk_side(store, &mut entries, &mut visited, max_depth, Side::Ancestors).await?;
    }
    if matches!(direction, ChainDirection::Descendants | ChainDirection::Both) {
        walk_side(store, &mut entries, &mut visited, max_depth, Side::Descendants).await?;
    }

    Ok(entries)
}

#[derive(Clone, Copy)]
enum Side {
    Ancestors,
    Descendants,
}

async fn walk_side(
    store: &dyn ReceiptStore,
    entries: &mut Vec<ChainEntry>,
    visited: &mut HashSet<String>,
    max_depth: usize,
    side: Side,
) -> Result<(), ReceiptGateError> {
    let start = entries[0].receipt.clone();
    let mut stack: Vec<(Receipt, u32)> = vec![(start, 0)];

    while let Some((current, depth)) = stack.pop() {
        if depth as usize >= max_depth {
            continue;
        }
        let neighbours = match side {
            Side::Ancestors => store.parents_of(&current.receipt_id).await?,
            Side::Descendants => store.children_of(&current.receipt_id).await?,
        };
        // Reverse so the first neighbour is explored first (depth-first).
        for neighbour in neighbours.into_iter().rev() {
            if !visited.insert(neighbour.receipt_id.clone()) {
                continue;
            }
            entries.push(ChainEntry {
                depth: depth + 1,
                receipt: neighbour.clone(),
            });
            stack.push((neighbour, depth + 1));
        }
    }
    Ok(())
}
