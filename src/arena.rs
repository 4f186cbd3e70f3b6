// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Generation-checked arena owning every storable picture of a DPB instance,
//! together with the shared "no reference" sentinel picture.
//!
//! Pictures are addressed through [`PicId`] handles; attachment points store
//! a [`PicRef`], whose `Sentinel` variant stands in wherever a reference is
//! requested but absent. Removing a picture bumps its slot generation, so a
//! second removal through a stale handle is a checked no-op and a stale
//! reference degrades to the sentinel instead of aliasing a recycled slot.

use log::debug;

use crate::picture::PictureStructure;
use crate::picture::StorablePicture;
use crate::sps::Sps;

/// Handle to a picture held in a [`PictureArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PicId {
    index: u32,
    generation: u32,
}

/// An attachment point for a picture: either a real arena entry or the shared
/// sentinel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PicRef {
    /// The shared "no reference" picture.
    #[default]
    Sentinel,
    Real(PicId),
}

impl PicRef {
    pub fn id(self) -> Option<PicId> {
        match self {
            PicRef::Sentinel => None,
            PicRef::Real(id) => Some(id),
        }
    }

    pub fn is_sentinel(self) -> bool {
        matches!(self, PicRef::Sentinel)
    }
}

struct Slot {
    generation: u32,
    pic: Option<StorablePicture>,
}

pub struct PictureArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
    sentinel: StorablePicture,
    live_bytes: usize,
}

impl PictureArena {
    /// Creates an arena and its sentinel picture, a mid-grey frame whose
    /// structure links are degenerate: asking it for any of its field or
    /// frame representations yields the sentinel again.
    pub fn new(sps: &Sps) -> Self {
        let mut sentinel = StorablePicture::new(sps, PictureStructure::Frame);
        sentinel.luma.fill(128);

        Self {
            slots: Vec::new(),
            free: Vec::new(),
            sentinel,
            live_bytes: 0,
        }
    }

    pub fn insert(&mut self, pic: StorablePicture) -> PicId {
        self.live_bytes += pic.mem_bytes();

        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.pic = Some(pic);
                PicId {
                    index: index as u32,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    pic: Some(pic),
                });
                PicId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    /// Removes and returns the picture, or `None` if the handle is stale.
    pub fn remove(&mut self, id: PicId) -> Option<StorablePicture> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            debug!("Ignoring removal through stale picture handle {:?}", id);
            return None;
        }

        let pic = slot.pic.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index as usize);
        self.live_bytes -= pic.mem_bytes();

        Some(pic)
    }

    pub fn get(&self, id: PicId) -> Option<&StorablePicture> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.pic.as_ref()
    }

    pub fn get_mut(&mut self, id: PicId) -> Option<&mut StorablePicture> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.pic.as_mut()
    }

    pub fn contains(&self, id: PicId) -> bool {
        self.get(id).is_some()
    }

    /// Resolves an attachment point, substituting the sentinel for stale
    /// handles as well: a dangling reference conceals like a missing one.
    pub fn resolve(&self, picref: PicRef) -> &StorablePicture {
        match picref {
            PicRef::Sentinel => &self.sentinel,
            PicRef::Real(id) => self.get(id).unwrap_or(&self.sentinel),
        }
    }

    pub fn sentinel(&self) -> &StorablePicture {
        &self.sentinel
    }

    /// Buffer bytes of all live pictures, the sentinel excluded.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl std::fmt::Debug for PictureArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PictureArena")
            .field("live_count", &self.live_count())
            .field("live_bytes", &self.live_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sps::SpsBuilder;

    fn test_sps() -> Sps {
        SpsBuilder::new().resolution(64, 64).build()
    }

    #[test]
    fn alloc_free_byte_accounting_round_trip() {
        let sps = test_sps();
        let mut arena = PictureArena::new(&sps);
        let before = arena.live_bytes();
        assert_eq!(before, 0);

        let id = arena.insert(StorablePicture::new(&sps, PictureStructure::Frame));
        assert!(arena.live_bytes() > 0);
        assert_eq!(arena.live_count(), 1);

        arena.remove(id).unwrap();
        assert_eq!(arena.live_bytes(), before);
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn double_remove_is_a_no_op() {
        let sps = test_sps();
        let mut arena = PictureArena::new(&sps);

        let id = arena.insert(StorablePicture::new(&sps, PictureStructure::Frame));
        assert!(arena.remove(id).is_some());
        assert!(arena.remove(id).is_none());
        assert_eq!(arena.live_bytes(), 0);
    }

    #[test]
    fn stale_handle_resolves_to_sentinel() {
        let sps = test_sps();
        let mut arena = PictureArena::new(&sps);

        let id = arena.insert(StorablePicture::new(&sps, PictureStructure::Frame));
        let stale = PicRef::Real(id);
        arena.remove(id).unwrap();

        let resolved = arena.resolve(stale);
        assert_eq!(resolved.luma.row(0)[0], 128);
        assert!(!arena.contains(id));
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let sps = test_sps();
        let mut arena = PictureArena::new(&sps);

        let first = arena.insert(StorablePicture::new(&sps, PictureStructure::Frame));
        arena.remove(first).unwrap();
        let second = arena.insert(StorablePicture::new(&sps, PictureStructure::Frame));

        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert!(arena.get(second).is_some());
    }
}
