//! Positional scheduler
//!
//! An ordered multi-map keyed by integer position. Items at the same
//! position keep their insertion order. Resource enlistment and
//! synchronization callbacks are ordered with it so that resources which must
//! always act first or last do so regardless of when they were enlisted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Position of items that must always come before any other.
pub const ALWAYS_FIRST_POSITION: i32 = i32::MIN;

/// Position used when nothing else was asked for.
pub const DEFAULT_POSITION: i32 = 0;

/// Position of items that must always come after any other.
pub const ALWAYS_LAST_POSITION: i32 = i32::MAX;

/// Scheduler errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Item not found in scheduler")]
    NotFound,
}

/// Identity comparison used by [`Scheduler::remove`].
///
/// Removal is by identity, not by value equality: two distinct enlistments
/// of equal-looking resources are different items.
pub trait SameItem {
    fn same_item(&self, other: &Self) -> bool;
}

impl<T: ?Sized> SameItem for Arc<T> {
    fn same_item(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(self), Arc::as_ptr(other))
    }
}

/// Iteration order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Ascending position, insertion order within a position
    Natural,
    /// Exact reverse of `Natural`
    Reverse,
}

/// Ordered multi-map of items keyed by position.
pub struct Scheduler<T> {
    // Slots emptied by a cursor stay as `None` until the cursor is dropped
    buckets: BTreeMap<i32, Vec<Option<T>>>,
    len: usize,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            len: 0,
        }
    }

    /// Append an item at a position, after the items already there.
    pub fn add(&mut self, item: T, position: i32) {
        self.buckets.entry(position).or_default().push(Some(item));
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }

    /// Positions holding at least one item, ascending.
    pub fn natural_order_positions(&self) -> Vec<i32> {
        self.buckets
            .iter()
            .filter(|(_, items)| items.iter().any(Option::is_some))
            .map(|(position, _)| *position)
            .collect()
    }

    /// Positions holding at least one item, descending.
    pub fn reverse_order_positions(&self) -> Vec<i32> {
        let mut positions = self.natural_order_positions();
        positions.reverse();
        positions
    }

    /// Items at one position, in insertion order.
    pub fn by_natural_order_for_position(&self, position: i32) -> impl Iterator<Item = &T> {
        self.buckets
            .get(&position)
            .into_iter()
            .flat_map(|items| items.iter().flatten())
    }

    /// Items at one position, in reverse insertion order.
    pub fn by_reverse_order_for_position(&self, position: i32) -> impl Iterator<Item = &T> {
        self.buckets
            .get(&position)
            .into_iter()
            .flat_map(|items| items.iter().rev().flatten())
    }

    /// All items by ascending position then insertion order.
    pub fn natural_order_iter(&self) -> impl Iterator<Item = &T> {
        self.buckets.values().flat_map(|items| items.iter().flatten())
    }

    /// Exact reverse of [`Scheduler::natural_order_iter`].
    pub fn reverse_order_iter(&self) -> impl Iterator<Item = &T> {
        self.buckets
            .values()
            .rev()
            .flat_map(|items| items.iter().rev().flatten())
    }

    /// Cursor that can remove the item it is on without disturbing the walk.
    pub fn cursor(&mut self, order: Order) -> Cursor<'_, T> {
        let mut positions: Vec<i32> = self.buckets.keys().copied().collect();
        if order == Order::Reverse {
            positions.reverse();
        }
        let mut cursor = Cursor {
            scheduler: self,
            order,
            positions,
            position_index: 0,
            next_slot: 0,
            current: None,
            removed_any: false,
        };
        cursor.reset_slot();
        cursor
    }

    /// Keep only the items matching the predicate.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        let mut cursor = self.cursor(Order::Natural);
        while let Some(item) = cursor.next() {
            if !keep(item) {
                cursor.remove_current();
            }
        }
    }

    fn compact(&mut self) {
        self.buckets.retain(|_, items| {
            items.retain(Option::is_some);
            !items.is_empty()
        });
    }
}

impl<T: SameItem> Scheduler<T> {
    /// Remove the first occurrence of `item`, compared by identity.
    pub fn remove(&mut self, item: &T) -> Result<T, SchedulerError> {
        let mut found = None;
        for (position, items) in self.buckets.iter() {
            if let Some(index) = items
                .iter()
                .position(|slot| slot.as_ref().is_some_and(|candidate| candidate.same_item(item)))
            {
                found = Some((*position, index));
                break;
            }
        }

        let (position, index) = found.ok_or(SchedulerError::NotFound)?;
        let items = self
            .buckets
            .get_mut(&position)
            .ok_or(SchedulerError::NotFound)?;
        let removed = items.remove(index).ok_or(SchedulerError::NotFound)?;
        if items.is_empty() {
            self.buckets.remove(&position);
        }
        self.len -= 1;
        Ok(removed)
    }

    /// Whether `item` (by identity) is scheduled.
    pub fn contains(&self, item: &T) -> bool {
        self.natural_order_iter().any(|candidate| candidate.same_item(item))
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (position, items) in &self.buckets {
            let live: Vec<&T> = items.iter().flatten().collect();
            if !live.is_empty() {
                map.entry(position, &live);
            }
        }
        map.finish()
    }
}

impl<T> fmt::Display for Scheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a Scheduler with {} object(s) in {} position(s)",
            self.len,
            self.natural_order_positions().len()
        )
    }
}

/// Walks a scheduler in one order and can remove the current item.
///
/// Removal only empties the slot; the slot is reclaimed when the cursor is
/// dropped, so the walk neither skips nor repeats an item.
pub struct Cursor<'a, T> {
    scheduler: &'a mut Scheduler<T>,
    order: Order,
    positions: Vec<i32>,
    position_index: usize,
    // Natural: index of the next slot to look at.
    // Reverse: one past the index of the next slot to look at.
    next_slot: usize,
    current: Option<(i32, usize)>,
    removed_any: bool,
}

impl<T> Cursor<'_, T> {
    /// Advance to the next item.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&T> {
        loop {
            let position = *self.positions.get(self.position_index)?;
            let found = match self.scheduler.buckets.get(&position) {
                Some(items) => match self.order {
                    Order::Natural => {
                        let mut found = None;
                        while self.next_slot < items.len() {
                            let slot = self.next_slot;
                            self.next_slot += 1;
                            if items[slot].is_some() {
                                found = Some(slot);
                                break;
                            }
                        }
                        found
                    }
                    Order::Reverse => {
                        let mut found = None;
                        while self.next_slot > 0 {
                            self.next_slot -= 1;
                            if items[self.next_slot].is_some() {
                                found = Some(self.next_slot);
                                break;
                            }
                        }
                        found
                    }
                },
                None => None,
            };

            match found {
                Some(slot) => {
                    self.current = Some((position, slot));
                    return self
                        .scheduler
                        .buckets
                        .get(&position)
                        .and_then(|items| items[slot].as_ref());
                }
                None => {
                    self.position_index += 1;
                    self.reset_slot();
                }
            }
        }
    }

    /// Remove the item returned by the last call to `next`.
    pub fn remove_current(&mut self) -> Option<T> {
        let (position, slot) = self.current.take()?;
        let removed = self
            .scheduler
            .buckets
            .get_mut(&position)
            .and_then(|items| items[slot].take())?;
        self.scheduler.len -= 1;
        self.removed_any = true;
        Some(removed)
    }

    fn reset_slot(&mut self) {
        self.next_slot = match self.order {
            Order::Natural => 0,
            Order::Reverse => self
                .positions
                .get(self.position_index)
                .and_then(|position| self.scheduler.buckets.get(position))
                .map_or(0, Vec::len),
        };
    }
}

impl<T> Drop for Cursor<'_, T> {
    fn drop(&mut self) {
        if self.removed_any {
            self.scheduler.compact();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect<T: Clone>(iter: impl Iterator<Item = T>) -> Vec<T> {
        iter.collect()
    }

    #[test]
    fn test_natural_and_reverse_order() {
        let mut scheduler = Scheduler::new();
        scheduler.add("default-1", DEFAULT_POSITION);
        scheduler.add("last", ALWAYS_LAST_POSITION);
        scheduler.add("first", ALWAYS_FIRST_POSITION);
        scheduler.add("default-2", DEFAULT_POSITION);
        scheduler.add("ten", 10);

        assert_eq!(scheduler.len(), 5);
        assert_eq!(
            collect(scheduler.natural_order_iter().copied()),
            vec!["first", "default-1", "default-2", "ten", "last"]
        );
        assert_eq!(
            collect(scheduler.reverse_order_iter().copied()),
            vec!["last", "ten", "default-2", "default-1", "first"]
        );
        assert_eq!(
            scheduler.natural_order_positions(),
            vec![ALWAYS_FIRST_POSITION, 0, 10, ALWAYS_LAST_POSITION]
        );
        assert_eq!(
            collect(scheduler.by_reverse_order_for_position(0).copied()),
            vec!["default-2", "default-1"]
        );
    }

    #[test]
    fn test_remove_is_by_identity() {
        let a1 = Arc::new("a");
        let a2 = Arc::new("a");
        let mut scheduler = Scheduler::new();
        scheduler.add(a1.clone(), 0);
        scheduler.add(a2.clone(), 0);

        let removed = scheduler.remove(&a2).unwrap();
        assert!(Arc::ptr_eq(&removed, &a2));
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.contains(&a1));
        assert!(!scheduler.contains(&a2));

        assert_eq!(scheduler.remove(&a2), Err(SchedulerError::NotFound));
        scheduler.remove(&a1).unwrap();
        assert!(scheduler.is_empty());
        assert!(scheduler.natural_order_positions().is_empty());
    }

    #[test]
    fn test_cursor_removal_does_not_skip() {
        let mut scheduler = Scheduler::new();
        for (i, position) in [0, 0, 1, 1, 1, 2].iter().enumerate() {
            scheduler.add(i, *position);
        }

        let mut visited = Vec::new();
        {
            let mut cursor = scheduler.cursor(Order::Natural);
            while let Some(item) = cursor.next() {
                let item = *item;
                visited.push(item);
                if item % 2 == 0 {
                    cursor.remove_current();
                }
            }
        }

        assert_eq!(visited, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(collect(scheduler.natural_order_iter().copied()), vec![1, 3, 5]);
        assert_eq!(scheduler.len(), 3);
    }

    #[test]
    fn test_reverse_cursor_removal() {
        let mut scheduler = Scheduler::new();
        scheduler.add('a', 0);
        scheduler.add('b', 0);
        scheduler.add('c', 5);

        let mut visited = Vec::new();
        {
            let mut cursor = scheduler.cursor(Order::Reverse);
            while let Some(item) = cursor.next() {
                visited.push(*item);
                cursor.remove_current();
            }
        }

        assert_eq!(visited, vec!['c', 'b', 'a']);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_retain() {
        let mut scheduler = Scheduler::new();
        for i in 0..10 {
            scheduler.add(i, i % 3);
        }
        scheduler.retain(|i| *i > 4);
        assert_eq!(scheduler.len(), 5);
        assert_eq!(
            collect(scheduler.natural_order_iter().copied()),
            vec![6, 9, 7, 5, 8]
        );
    }

    #[test]
    fn test_display() {
        let mut scheduler = Scheduler::new();
        scheduler.add(1, 0);
        scheduler.add(2, 3);
        assert_eq!(
            scheduler.to_string(),
            "a Scheduler with 2 object(s) in 2 position(s)"
        );
    }

    proptest! {
        #[test]
        fn prop_natural_order_groups_by_position(positions in proptest::collection::vec(-3i32..3, 0..64)) {
            let mut scheduler = Scheduler::new();
            for (i, position) in positions.iter().enumerate() {
                scheduler.add((i, *position), *position);
            }

            let natural: Vec<(usize, i32)> = scheduler.natural_order_iter().copied().collect();
            let mut expected: Vec<(usize, i32)> = positions.iter().copied().enumerate().collect();
            // Stable sort keeps insertion order within a position
            expected.sort_by_key(|(_, position)| *position);
            prop_assert_eq!(&natural, &expected);

            let mut reverse: Vec<(usize, i32)> = scheduler.reverse_order_iter().copied().collect();
            reverse.reverse();
            prop_assert_eq!(&reverse, &natural);
        }

        #[test]
        fn prop_cursor_removal_visits_every_item_once(
            positions in proptest::collection::vec(-3i32..3, 0..64),
            mask in proptest::collection::vec(any::<bool>(), 64),
        ) {
            let mut scheduler = Scheduler::new();
            for (i, position) in positions.iter().enumerate() {
                scheduler.add(i, *position);
            }
            let expected: Vec<usize> = scheduler.reverse_order_iter().copied().collect();

            let mut visited = Vec::new();
            {
                let mut cursor = scheduler.cursor(Order::Reverse);
                while let Some(item) = cursor.next() {
                    let item = *item;
                    visited.push(item);
                    if mask[item] {
                        cursor.remove_current();
                    }
                }
            }

            prop_assert_eq!(&visited, &expected);
            let kept: Vec<usize> = expected.iter().copied().filter(|i| !mask[*i]).collect();
            let remaining: Vec<usize> = scheduler.reverse_order_iter().copied().collect();
            prop_assert_eq!(remaining, kept);
        }
    }
}
