#![forbid(unsafe_code)]
//! Per-transaction object index: open addressing keyed by identifier.

use crate::ident::GhostId;
use crate::layout::Ghost;

/// Smallest slot table; the index never shrinks below this.
pub const MIN_CAPACITY: usize = 16;

struct Slot {
    id: GhostId,
    body: Ghost,
}

/// Open-addressing map from identifier to live body.
///
/// Capacity is always a power of two. The table grows when load crosses
/// 75% and shrinks when it drops under 25%, never below [`MIN_CAPACITY`].
/// Removal back-shifts the probe chain so lookups never have to scan past
/// a true gap; there are no tombstone slots.
pub struct GhostIndex {
    slots: Vec<Option<Slot>>,
    len: usize,
}

impl Default for GhostIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl GhostIndex {
    /// Creates an empty index at the minimum capacity.
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Builds an index with at least `capacity` slots, rounded up to a
    /// power of two with the [`MIN_CAPACITY`] floor.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn bucket(&self, id: &GhostId) -> usize {
        ((id.header_word() ^ id.random()) as usize) & (self.slots.len() - 1)
    }

    /// Inserts a body keyed by `id`, returning the body it replaced.
    pub fn set(&mut self, id: GhostId, body: Ghost) -> Option<Ghost> {
        if (self.len + 1) * 4 > self.slots.len() * 3 {
            self.rehash(self.slots.len() * 2);
        }
        let mask = self.slots.len() - 1;
        let mut at = self.bucket(&id);
        loop {
            match &mut self.slots[at] {
                Some(slot) if slot.id == id => {
                    return Some(std::mem::replace(&mut slot.body, body));
                }
                Some(_) => at = (at + 1) & mask,
                empty @ None => {
                    *empty = Some(Slot { id, body });
                    self.len += 1;
                    return None;
                }
            }
        }
    }

    /// Looks a body up; absence is ordinary, not an error.
    pub fn get(&self, id: &GhostId) -> Option<&Ghost> {
        let mask = self.slots.len() - 1;
        let mut at = self.bucket(id);
        loop {
            match &self.slots[at] {
                Some(slot) if slot.id == *id => return Some(&slot.body),
                Some(_) => at = (at + 1) & mask,
                None => return None,
            }
        }
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, id: &GhostId) -> Option<&mut Ghost> {
        let mask = self.slots.len() - 1;
        let mut at = self.bucket(id);
        loop {
            match &self.slots[at] {
                Some(slot) if slot.id == *id => break,
                Some(_) => at = (at + 1) & mask,
                None => return None,
            }
        }
        self.slots[at].as_mut().map(|slot| &mut slot.body)
    }

    /// Removes and returns a body, back-shifting the probe chain behind it.
    pub fn remove(&mut self, id: &GhostId) -> Option<Ghost> {
        let mask = self.slots.len() - 1;
        let mut at = self.bucket(id);
        loop {
            match &self.slots[at] {
                Some(slot) if slot.id == *id => break,
                Some(_) => at = (at + 1) & mask,
                None => return None,
            }
        }
        let removed = self.slots[at].take().map(|slot| slot.body);
        self.len -= 1;

        // Pull back every entry whose probe sequence passed through the
        // vacated slot, stopping at the first true gap.
        let mut hole = at;
        let mut probe = at;
        loop {
            probe = (probe + 1) & mask;
            let home = match &self.slots[probe] {
                Some(slot) => self.bucket(&slot.id),
                None => break,
            };
            let movable = if hole <= probe {
                home <= hole || home > probe
            } else {
                home <= hole && home > probe
            };
            if movable {
                self.slots[hole] = self.slots[probe].take();
                hole = probe;
            }
        }

        if self.slots.len() > MIN_CAPACITY && self.len * 4 < self.slots.len() {
            self.rehash((self.slots.len() / 2).max(MIN_CAPACITY));
        }
        removed
    }

    /// Drops all entries, keeping the current table.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.len = 0;
    }

    /// Forward iteration over live entries, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&GhostId, &Ghost)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|slot| (&slot.id, &slot.body)))
    }

    fn rehash(&mut self, capacity: usize) {
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        if capacity == self.slots.len() {
            return;
        }
        let old: Vec<Option<Slot>> = std::mem::replace(
            &mut self.slots,
            (0..capacity).map(|_| None).collect(),
        );
        self.len = 0;
        for slot in old.into_iter().flatten() {
            self.set(slot.id, slot.body);
        }
    }
}
