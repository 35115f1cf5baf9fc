//! Bounded generational arena.
//!
//! The FCF registry and the VN2VN peer table own their records here and
//! hand out [`Index`] values instead of references. A removed slot bumps its
//! generation, so an index held across a removal resolves to `None` rather
//! than to whatever record reuses the slot.

/// Handle to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Index {
    slot: u32,
    generation: u32,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    capacity: usize,
}

impl<T> Arena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Store `value`. Hands it back when the arena is at capacity.
    pub fn insert(&mut self, value: T) -> Result<Index, T> {
        if self.is_full() {
            return Err(value);
        }
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            let generation = match entry {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            *entry = Slot::Occupied { generation, value };
            return Ok(Index { slot, generation });
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        Ok(Index {
            slot,
            generation: 0,
        })
    }

    pub fn get(&self, idx: Index) -> Option<&T> {
        match self.slots.get(idx.slot as usize)? {
            Slot::Occupied { generation, value } if *generation == idx.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, idx: Index) -> Option<&mut T> {
        match self.slots.get_mut(idx.slot as usize)? {
            Slot::Occupied { generation, value } if *generation == idx.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, idx: Index) -> Option<T> {
        let entry = self.slots.get_mut(idx.slot as usize)?;
        match entry {
            Slot::Occupied { generation, .. } if *generation == idx.generation => {
                let next = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
                let old = std::mem::replace(entry, next);
                self.free.push(idx.slot);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => None,
                }
            }
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { generation, value } => Some((
                Index {
                    slot: i as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Index, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { generation, value } => Some((
                Index {
                    slot: i as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    /// Indices of every live record, for removal while walking.
    pub fn indices(&self) -> Vec<Index> {
        self.iter().map(|(i, _)| i).collect()
    }

    /// Remove everything. Outstanding indices all go stale.
    pub fn clear(&mut self) {
        for idx in self.indices() {
            self.remove(idx);
        }
    }
}
