//! The wheel itself.
//!
//! Entries live in a generational slab so an [`EntryId`] stays valid (and
//! `delete` stays a cheap, checked O(1) unlink) even after the slot it
//! named has been reused. This replaces the intrusive, pinned-node lists
//! a kernel-side timer would use with plain indices — there is no
//! equivalent pinning requirement in a userspace scheduler where entries
//! are owned by the wheel outright.

use crate::Ticks;
use std::collections::VecDeque;

const FRONT_END_CAP: usize = 8;
const TIER1_BUCKETS: usize = 64;
const DEFAULT_MIN_WIDTH: Ticks = 1;
const DEFAULT_MAX_WIDTH: Ticks = 1 << 20;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Location {
    FrontEnd,
    Tier1(usize),
    Tier2,
}

struct Slot<T> {
    generation: u32,
    occupant: Option<Occupant<T>>,
}

struct Occupant<T> {
    deadline: Ticks,
    location: Location,
    value: T,
}

enum SlabEntry<T> {
    Vacant { next_free: Option<u32>, generation: u32 },
    Occupied(Slot<T>),
}

/// Schedules values to become ready at a future tick.
pub struct TimeWheel<T> {
    slots: Vec<SlabEntry<T>>,
    free_head: Option<u32>,
    len: usize,

    front_end: Vec<u32>,

    tier1_base: Ticks,
    tier1_width: Ticks,
    tier1: Vec<VecDeque<u32>>,
    tier1_cursor: usize,
    tier1_live: bool,

    tier2: Vec<u32>,
    tier2_sorted: bool,

    min_width: Ticks,
    max_width: Ticks,
}

impl<T> Default for TimeWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeWheel<T> {
    pub fn new() -> Self {
        Self::with_width_bounds(DEFAULT_MIN_WIDTH, DEFAULT_MAX_WIDTH)
    }

    pub fn with_width_bounds(min_width: Ticks, max_width: Ticks) -> Self {
        assert!(min_width >= 1 && min_width <= max_width);
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
            front_end: Vec::new(),
            tier1_base: 0,
            tier1_width: min_width,
            tier1: (0..TIER1_BUCKETS).map(|_| VecDeque::new()).collect(),
            tier1_cursor: 0,
            tier1_live: false,
            tier2: Vec::new(),
            tier2_sorted: true,
            min_width,
            max_width,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Schedules `value` to become ready at `deadline`.
    pub fn insert(&mut self, value: T, deadline: Ticks) -> EntryId {
        let index = self.slab_insert(value, deadline);
        self.place(index, deadline);
        self.len += 1;
        let generation = self.generation_of(index);
        EntryId { index, generation }
    }

    /// Unlinks and returns the value at `id`, if it is still scheduled
    /// (i.e. hasn't already been popped by [`TimeWheel::pop_ready`]).
    pub fn delete(&mut self, id: EntryId) -> Option<T> {
        let slot = self.slot_mut(id)?;
        let occupant = slot.occupant.take()?;
        self.unlink(id.index, occupant.location);
        self.len -= 1;
        Some(occupant.value)
    }

    /// Removes and returns every entry whose deadline is `<= now`, in
    /// ascending deadline order.
    pub fn pop_ready(&mut self, now: Ticks) -> Vec<T> {
        let mut ready = Vec::new();
        loop {
            self.refill_front_end();
            let Some(&index) = self.front_end.first() else {
                break;
            };
            let deadline = self.deadline_of(index);
            if deadline > now {
                break;
            }
            self.front_end.remove(0);
            let slot = self.slot_mut_by_index(index);
            let occupant = slot.occupant.take().expect("front-end entry must be occupied");
            self.free(index);
            self.len -= 1;
            ready.push(occupant.value);
        }
        ready
    }

    /// The earliest deadline still scheduled, performing whatever tier
    /// promotion/rebuild is necessary to answer accurately. Does not
    /// remove anything.
    pub fn next_deadline(&mut self) -> Option<Ticks> {
        self.refill_front_end();
        self.front_end.first().map(|&index| self.deadline_of(index))
    }

    fn refill_front_end(&mut self) {
        while self.front_end.len() < FRONT_END_CAP {
            let Some(index) = self.pop_tier1_min() else {
                break;
            };
            self.front_end_insert_sorted(index);
            self.set_location(index, Location::FrontEnd);
        }
    }

    fn place(&mut self, index: u32, deadline: Ticks) {
        if self.front_end.len() < FRONT_END_CAP {
            self.front_end_insert_sorted(index);
            self.set_location(index, Location::FrontEnd);
            return;
        }

        let tail_deadline = self
            .front_end
            .last()
            .map(|&i| self.deadline_of(i))
            .unwrap_or(Ticks::MAX);

        if deadline < tail_deadline {
            let evicted = self.front_end.pop().expect("checked non-empty above");
            self.front_end_insert_sorted(index);
            self.set_location(index, Location::FrontEnd);
            self.place_overflow(evicted);
        } else {
            self.place_overflow(index);
        }
    }

    fn place_overflow(&mut self, index: u32) {
        let deadline = self.deadline_of(index);
        if self.tier1_live
            && deadline >= self.tier1_base
            && deadline < self.tier1_base + self.tier1_width * TIER1_BUCKETS as Ticks
        {
            let bucket = (((deadline - self.tier1_base) / self.tier1_width) as usize)
                .min(TIER1_BUCKETS - 1);
            self.tier1[bucket].push_back(index);
            self.set_location(index, Location::Tier1(bucket));
        } else {
            self.tier2.push(index);
            self.tier2_sorted = false;
            self.set_location(index, Location::Tier2);
        }
    }

    /// Drains the next entry from tier 1 (in deadline order, approximately
    /// — within a bucket entries are FIFO, not sub-sorted), rebuilding
    /// tier 1 from tier 2 when it runs dry.
    fn pop_tier1_min(&mut self) -> Option<u32> {
        loop {
            if let Some(index) = self.drain_next_tier1_bucket() {
                return Some(index);
            }

            if self.tier2.len() == 1 {
                let index = self.tier2.pop().expect("checked len == 1");
                return Some(index);
            }
            if self.tier2.is_empty() {
                return None;
            }
            self.rebuild_tier1_from_tier2();
        }
    }

    fn drain_next_tier1_bucket(&mut self) -> Option<u32> {
        for _ in 0..TIER1_BUCKETS {
            let bucket = self.tier1_cursor;
            if let Some(index) = self.tier1[bucket].pop_front() {
                return Some(index);
            }
            self.tier1_cursor = (self.tier1_cursor + 1) % TIER1_BUCKETS;
        }
        self.tier1_live = false;
        None
    }

    fn rebuild_tier1_from_tier2(&mut self) {
        if !self.tier2_sorted {
            let deadlines: Vec<Ticks> = self.tier2.iter().map(|&i| self.deadline_of(i)).collect();
            let mut order: Vec<usize> = (0..self.tier2.len()).collect();
            order.sort_unstable_by_key(|&i| deadlines[i]);
            self.tier2 = order.into_iter().map(|i| self.tier2[i]).collect();
            self.tier2_sorted = true;
        }

        let min = self.deadline_of(self.tier2[0]);
        let max = self.deadline_of(*self.tier2.last().expect("checked non-empty by caller"));
        let span = max.saturating_sub(min).max(1);
        let width = (span / TIER1_BUCKETS as Ticks).clamp(self.min_width, self.max_width);

        self.tier1_base = min;
        self.tier1_width = width;
        self.tier1_cursor = 0;
        self.tier1_live = true;

        let moved: Vec<u32> = self.tier2.drain(..).collect();
        for index in moved {
            self.place_overflow(index);
        }
    }

    fn front_end_insert_sorted(&mut self, index: u32) {
        let deadline = self.deadline_of(index);
        let pos = self
            .front_end
            .partition_point(|&i| self.deadline_of(i) <= deadline);
        self.front_end.insert(pos, index);
    }

    fn unlink(&mut self, index: u32, location: Location) {
        match location {
            Location::FrontEnd => {
                if let Some(pos) = self.front_end.iter().position(|&i| i == index) {
                    self.front_end.remove(pos);
                }
            }
            Location::Tier1(bucket) => {
                if let Some(pos) = self.tier1[bucket].iter().position(|&i| i == index) {
                    self.tier1[bucket].remove(pos);
                }
            }
            Location::Tier2 => {
                if let Some(pos) = self.tier2.iter().position(|&i| i == index) {
                    self.tier2.remove(pos);
                }
            }
        }
        self.free(index);
    }

    fn free(&mut self, index: u32) {
        let i = index as usize;
        let generation = self.generation_of(index).wrapping_add(1);
        self.slots[i] = SlabEntry::Vacant { next_free: self.free_head, generation };
        self.free_head = Some(index);
    }

    fn slab_insert(&mut self, value: T, deadline: Ticks) -> u32 {
        let occupant = Occupant { deadline, location: Location::Tier2, value };
        if let Some(index) = self.free_head {
            let i = index as usize;
            let generation = match &self.slots[i] {
                SlabEntry::Vacant { generation, .. } => *generation,
                SlabEntry::Occupied(_) => unreachable!("free list pointed at an occupied slot"),
            };
            self.free_head = match &self.slots[i] {
                SlabEntry::Vacant { next_free, .. } => *next_free,
                SlabEntry::Occupied(_) => unreachable!("free list pointed at an occupied slot"),
            };
            self.slots[i] = SlabEntry::Occupied(Slot { generation, occupant: Some(occupant) });
            index
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(SlabEntry::Occupied(Slot { generation: 0, occupant: Some(occupant) }));
            index
        }
    }

    fn generation_of(&self, index: u32) -> u32 {
        match &self.slots[index as usize] {
            SlabEntry::Occupied(slot) => slot.generation,
            SlabEntry::Vacant { .. } => 0,
        }
    }

    fn deadline_of(&self, index: u32) -> Ticks {
        match &self.slots[index as usize] {
            SlabEntry::Occupied(slot) => {
                slot.occupant.as_ref().expect("index must be occupied while queued").deadline
            }
            SlabEntry::Vacant { .. } => unreachable!("deadline_of called on a vacant slot"),
        }
    }

    fn set_location(&mut self, index: u32, location: Location) {
        if let SlabEntry::Occupied(slot) = &mut self.slots[index as usize] {
            if let Some(occupant) = &mut slot.occupant {
                occupant.location = location;
            }
        }
    }

    fn slot_mut(&mut self, id: EntryId) -> Option<&mut Slot<T>> {
        match self.slots.get_mut(id.index as usize)? {
            SlabEntry::Occupied(slot) if slot.generation == id.generation => Some(slot),
            _ => None,
        }
    }

    fn slot_mut_by_index(&mut self, index: u32) -> &mut Slot<T> {
        match &mut self.slots[index as usize] {
            SlabEntry::Occupied(slot) => slot,
            SlabEntry::Vacant { .. } => unreachable!("slot_mut_by_index on a vacant slot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_ready_entries_in_deadline_order() {
        let mut wheel = TimeWheel::new();
        wheel.insert("c", 30);
        wheel.insert("a", 10);
        wheel.insert("b", 20);

        assert_eq!(wheel.pop_ready(25), vec!["a", "b"]);
        assert_eq!(wheel.pop_ready(100), vec!["c"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn delete_unlinks_before_expiry() {
        let mut wheel = TimeWheel::new();
        let id = wheel.insert("x", 50);
        wheel.insert("y", 60);

        assert_eq!(wheel.delete(id), Some("x"));
        assert_eq!(wheel.delete(id), None);
        assert_eq!(wheel.pop_ready(100), vec!["y"]);
    }

    #[test]
    fn overflow_beyond_front_end_cap_still_expires_in_order() {
        let mut wheel = TimeWheel::new();
        let mut expected = Vec::new();
        for i in 0..500u64 {
            let deadline = (499 - i) * 10;
            wheel.insert(deadline, deadline);
            expected.push(deadline);
        }
        expected.sort_unstable();

        let mut popped = Vec::new();
        while !wheel.is_empty() {
            let next = wheel.next_deadline().expect("non-empty wheel has a next deadline");
            popped.extend(wheel.pop_ready(next));
        }
        assert_eq!(popped, expected);
    }

    #[test]
    fn next_deadline_reflects_earliest_without_removing() {
        let mut wheel = TimeWheel::new();
        wheel.insert("late", 1000);
        wheel.insert("early", 5);
        assert_eq!(wheel.next_deadline(), Some(5));
        assert_eq!(wheel.len(), 2);
    }
}
