//! Generational slab used for every object that is referenced by handle.
//!
//! A handle is `(index, generation)`. Freeing a slot bumps its generation, so
//! handles held past an object's destruction resolve to `None` instead of to
//! whatever reused the slot.

use alloc::vec::Vec;

/// Raw slot handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct RawId {
    pub index: u32,
    pub generation: u32,
}

impl RawId {
    /// Pack into a non-zero `u64` (zero means "none" for atomic slots)
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32 | self.index as u64) + 1
    }

    pub const fn from_bits(bits: u64) -> Option<Self> {
        if bits == 0 {
            None
        } else {
            let v = bits - 1;
            Some(RawId {
                index: v as u32,
                generation: (v >> 32) as u32,
            })
        }
    }
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
        pub struct $name(pub $crate::arena::RawId);

        impl $name {
            pub const fn to_bits(self) -> u64 {
                self.0.to_bits()
            }

            pub const fn from_bits(bits: u64) -> Option<Self> {
                match $crate::arena::RawId::from_bits(bits) {
                    Some(raw) => Some(Self(raw)),
                    None => None,
                }
            }
        }

        impl From<$crate::arena::RawId> for $name {
            fn from(raw: $crate::arena::RawId) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for $crate::arena::RawId {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}
pub(crate) use define_id;

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> RawId {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own handle
    pub fn insert_with(&mut self, f: impl FnOnce(RawId) -> T) -> RawId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => unreachable!("free list holds an occupied slot"),
            };
            let id = RawId { index, generation };
            *slot = Slot::Occupied {
                generation,
                value: f(id),
            };
            id
        } else {
            let id = RawId {
                index: self.slots.len() as u32,
                generation: 0,
            };
            self.slots.push(Slot::Occupied {
                generation: 0,
                value: f(id),
            });
            id
        }
    }

    pub fn get(&self, id: RawId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: RawId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: RawId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let next = Slot::Vacant {
            generation: id.generation.wrapping_add(1),
        };
        match core::mem::replace(slot, next) {
            Slot::Occupied { value, .. } => {
                self.free.push(id.index);
                self.len -= 1;
                Some(value)
            }
            Slot::Vacant { .. } => None,
        }
    }

    pub fn contains(&self, id: RawId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { generation, value } => Some((
                RawId {
                    index: i as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
