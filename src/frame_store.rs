// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame stores: the bookkeeping unit of the DPB. One store covers one
//! timeline slot and holds up to three pictures: a frame and/or a
//! complementary top/bottom field pair.

use anyhow::anyhow;
use anyhow::Context;
use log::debug;

use crate::arena::PicId;
use crate::arena::PicRef;
use crate::arena::PictureArena;
use crate::picture::PictureStructure;
use crate::picture::Plane;
use crate::picture::StorablePicture;
use crate::sps::Sps;

/// Bit in the `is_used`/`is_reference`/`is_long_term` masks for the top
/// field.
pub const TOP: u8 = 0b01;
/// Bit for the bottom field.
pub const BOTTOM: u8 = 0b10;
/// Both bits: a frame, or a completed field pair.
pub const FRAME: u8 = 0b11;

fn parity_mask(structure: PictureStructure) -> u8 {
    match structure {
        PictureStructure::Frame => FRAME,
        PictureStructure::TopField => TOP,
        PictureStructure::BottomField => BOTTOM,
    }
}

/// One DPB slot.
///
/// The mask fields follow the original bookkeeping: bit 0 tracks the top
/// field, bit 1 the bottom field, and a coded frame sets both. The store is
/// the unit of reference counting and eviction; the pictures it points at
/// live in the [`PictureArena`].
#[derive(Debug)]
pub struct FrameStore {
    /// Which parts of the slot hold decoded pictures.
    pub is_used: u8,
    /// Which parts are used for reference.
    pub is_reference: u8,
    /// Which parts are long-term references.
    pub is_long_term: u8,
    /// Reference status at insertion time, before any marking commands.
    pub is_orig_reference: u8,
    /// Which parts were inferred for a frame_num gap.
    pub is_non_existent: u8,
    /// Whether the slot content has been sent to the output consumer.
    pub is_output: bool,

    pub frame_num: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: u32,
    pub poc: i32,

    pub frame: PicRef,
    pub top_field: PicRef,
    pub bottom_field: PicRef,

    pub view_id: i32,
    /// Per-field inter-view prediction flags, top then bottom.
    pub inter_view_flag: [bool; 2],
    pub anchor_pic_flag: [bool; 2],
}

impl Default for FrameStore {
    fn default() -> Self {
        Self {
            is_used: 0,
            is_reference: 0,
            is_long_term: 0,
            is_orig_reference: 0,
            is_non_existent: 0,
            is_output: false,
            frame_num: 0,
            frame_num_wrap: 0,
            long_term_frame_idx: 0,
            poc: 0,
            frame: PicRef::Sentinel,
            top_field: PicRef::Sentinel,
            bottom_field: PicRef::Sentinel,
            view_id: -1,
            inter_view_flag: [false; 2],
            anchor_pic_flag: [false; 2],
        }
    }
}

impl FrameStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.is_used == 0
    }

    /// Whether the slot holds a full frame's worth of samples.
    pub fn is_complete(&self) -> bool {
        self.is_used == FRAME
    }

    /// Whether the slot holds a single field still awaiting its pair.
    pub fn is_partial_field(&self) -> bool {
        self.is_used == TOP || self.is_used == BOTTOM
    }

    pub fn has_reference(&self) -> bool {
        self.is_reference != 0
    }

    pub fn has_short_term_reference(&self) -> bool {
        self.is_reference & !self.is_long_term != 0
    }

    pub fn has_long_term_reference(&self) -> bool {
        self.is_reference & self.is_long_term != 0
    }

    fn attachment(&self, structure: PictureStructure) -> PicRef {
        match structure {
            PictureStructure::Frame => self.frame,
            PictureStructure::TopField => self.top_field,
            PictureStructure::BottomField => self.bottom_field,
        }
    }

    /// The attached picture ids, frame first.
    pub fn picture_ids(&self) -> impl Iterator<Item = PicId> {
        [self.frame, self.top_field, self.bottom_field]
            .into_iter()
            .filter_map(PicRef::id)
    }

    /// Attaches a completed picture to this slot, splitting frames of
    /// interlaced sequences into field views and combining completed field
    /// pairs into a frame.
    pub fn insert_picture(
        &mut self,
        arena: &mut PictureArena,
        sps: &Sps,
        id: PicId,
    ) -> anyhow::Result<()> {
        let pic = arena.get(id).context("inserting a stale picture handle")?;

        let structure = pic.structure;
        let mask = parity_mask(structure);
        let used_for_reference = pic.used_for_reference;
        let is_long_term = pic.is_long_term;
        let long_term_frame_idx = pic.long_term_frame_idx;
        let non_existing = pic.non_existing;
        let poc = pic.poc;
        let frame_num = pic.frame_num;
        let view_id = pic.view_id;
        let inter_view_flag = pic.inter_view_flag;
        let anchor_pic_flag = pic.anchor_pic_flag;

        debug!(
            "Attaching {:?} picture POC {} frame_num {} to a frame store",
            structure, poc, frame_num
        );

        match structure {
            PictureStructure::Frame => {
                if !self.is_empty() {
                    return Err(anyhow!("frame inserted into an occupied frame store"));
                }
                self.frame = PicRef::Real(id);
                self.is_used = FRAME;
                self.poc = poc;
                self.view_id = view_id;
                self.inter_view_flag = [inter_view_flag; 2];
                self.anchor_pic_flag = [anchor_pic_flag; 2];
                if non_existing {
                    self.is_non_existent = FRAME;
                }
                if used_for_reference {
                    self.is_reference = FRAME;
                    self.is_orig_reference = FRAME;
                    if is_long_term {
                        self.is_long_term = FRAME;
                        self.long_term_frame_idx = long_term_frame_idx;
                    }
                    // Field views of the frame are only needed when later
                    // pictures may be field-coded.
                    if !sps.frame_mbs_only_flag {
                        self.split_frame(arena, sps, id)?;
                    }
                }
            }
            PictureStructure::TopField | PictureStructure::BottomField => {
                if self.is_used & mask != 0 {
                    return Err(anyhow!(
                        "{:?} inserted into a store already holding that parity",
                        structure
                    ));
                }
                match structure {
                    PictureStructure::TopField => self.top_field = PicRef::Real(id),
                    _ => self.bottom_field = PicRef::Real(id),
                }
                let field_slot = (structure == PictureStructure::BottomField) as usize;
                self.view_id = view_id;
                self.inter_view_flag[field_slot] = inter_view_flag;
                self.anchor_pic_flag[field_slot] = anchor_pic_flag;
                if non_existing {
                    self.is_non_existent |= mask;
                }
                if self.is_used == 0 {
                    // First field of the pair carries the slot identity.
                    self.poc = poc;
                }
                self.is_used |= mask;
                if used_for_reference {
                    self.is_reference |= mask;
                    self.is_orig_reference |= mask;
                    if is_long_term {
                        self.is_long_term |= mask;
                        self.long_term_frame_idx = long_term_frame_idx;
                    }
                }
                if self.is_used == FRAME {
                    self.combine_fields(arena, sps)?;
                }
            }
        }

        self.frame_num = frame_num;

        Ok(())
    }

    /// Builds the field views of a stored reference frame by de-interleaving
    /// its rows, so field-coded pictures can reference it per parity.
    fn split_frame(&mut self, arena: &mut PictureArena, sps: &Sps, frame_id: PicId) -> anyhow::Result<()> {
        let frame = arena.get(frame_id).context("splitting a stale frame")?;

        let mut top = StorablePicture::new(sps, PictureStructure::TopField);
        let mut bottom = StorablePicture::new(sps, PictureStructure::BottomField);

        for y in 0..top.luma.height() {
            top.luma.row_mut(y).copy_from_slice(frame.luma.row(2 * y));
            bottom
                .luma
                .row_mut(y)
                .copy_from_slice(frame.luma.row(2 * y + 1));
        }
        if let (Some(tc), Some(bc), Some(fc)) =
            (top.chroma.as_mut(), bottom.chroma.as_mut(), frame.chroma.as_ref())
        {
            for plane in 0..2 {
                for y in 0..tc[plane].height() {
                    tc[plane].row_mut(y).copy_from_slice(fc[plane].row(2 * y));
                    bc[plane]
                        .row_mut(y)
                        .copy_from_slice(fc[plane].row(2 * y + 1));
                }
            }
        }
        for r in 0..top.mv_info.height() {
            top.mv_info.copy_row_from(r, &frame.mv_info, 2 * r);
            bottom.mv_info.copy_row_from(r, &frame.mv_info, 2 * r + 1);
        }

        for (field, parity_poc) in [(&mut top, frame.top_poc), (&mut bottom, frame.bottom_poc)] {
            field.poc = parity_poc;
            field.frame_num = frame.frame_num;
            field.frame_num_wrap = frame.frame_num_wrap;
            field.used_for_reference = frame.used_for_reference;
            field.is_long_term = frame.is_long_term;
            field.long_term_frame_idx = frame.long_term_frame_idx;
            field.non_existing = frame.non_existing;
            field.view_id = frame.view_id;
            field.inter_view_flag = frame.inter_view_flag;
            field.anchor_pic_flag = frame.anchor_pic_flag;
            field.coded_frame = true;
        }
        top.top_poc = frame.top_poc;
        bottom.bottom_poc = frame.bottom_poc;

        let top_id = arena.insert(top);
        let bottom_id = arena.insert(bottom);

        // Wire the structure links of all three pictures.
        for id in [top_id, bottom_id, frame_id] {
            if let Some(pic) = arena.get_mut(id) {
                pic.frame = PicRef::Real(frame_id);
                pic.top_field = PicRef::Real(top_id);
                pic.bottom_field = PicRef::Real(bottom_id);
            }
        }

        self.top_field = PicRef::Real(top_id);
        self.bottom_field = PicRef::Real(bottom_id);

        Ok(())
    }

    /// Builds the frame picture of a completed field pair by interleaving the
    /// two fields' rows. The combined frame is what reaches the output
    /// consumer and what frame-coded pictures reference.
    fn combine_fields(&mut self, arena: &mut PictureArena, sps: &Sps) -> anyhow::Result<()> {
        let top_id = self.top_field.id().ok_or_else(|| anyhow!("no top field"))?;
        let bottom_id = self
            .bottom_field
            .id()
            .ok_or_else(|| anyhow!("no bottom field"))?;

        let mut frame = StorablePicture::new(sps, PictureStructure::Frame);
        {
            let top = arena.get(top_id).context("combining a stale top field")?;
            let bottom = arena
                .get(bottom_id)
                .context("combining a stale bottom field")?;

            for y in 0..top.luma.height() {
                frame.luma.row_mut(2 * y).copy_from_slice(top.luma.row(y));
                frame
                    .luma
                    .row_mut(2 * y + 1)
                    .copy_from_slice(bottom.luma.row(y));
            }
            if let (Some(fc), Some(tc), Some(bc)) =
                (frame.chroma.as_mut(), top.chroma.as_ref(), bottom.chroma.as_ref())
            {
                for plane in 0..2 {
                    for y in 0..tc[plane].height() {
                        fc[plane].row_mut(2 * y).copy_from_slice(tc[plane].row(y));
                        fc[plane]
                            .row_mut(2 * y + 1)
                            .copy_from_slice(bc[plane].row(y));
                    }
                }
            }
            for r in 0..top.mv_info.height() {
                frame.mv_info.copy_row_from(2 * r, &top.mv_info, r);
                frame.mv_info.copy_row_from(2 * r + 1, &bottom.mv_info, r);
            }

            frame.poc = std::cmp::min(top.poc, bottom.poc);
            frame.top_poc = top.poc;
            frame.bottom_poc = bottom.poc;
            frame.frame_num = top.frame_num;
            frame.frame_num_wrap = top.frame_num_wrap;
            frame.used_for_reference = top.used_for_reference && bottom.used_for_reference;
            frame.is_long_term = top.is_long_term && bottom.is_long_term;
            frame.non_existing = top.non_existing && bottom.non_existing;
            if frame.is_long_term {
                frame.long_term_frame_idx = top.long_term_frame_idx;
            }
            frame.coded_frame = false;
            frame.view_id = top.view_id;
        }

        let combined_poc = frame.poc;
        let frame_id = arena.insert(frame);

        for id in [top_id, bottom_id, frame_id] {
            if let Some(pic) = arena.get_mut(id) {
                pic.frame = PicRef::Real(frame_id);
                pic.top_field = PicRef::Real(top_id);
                pic.bottom_field = PicRef::Real(bottom_id);
            }
        }

        self.frame = PicRef::Real(frame_id);
        self.poc = combined_poc;

        Ok(())
    }

    /// Marks the whole slot as unused for reference.
    pub fn unmark_for_reference(&mut self, arena: &mut PictureArena) {
        for id in self.picture_ids() {
            if let Some(pic) = arena.get_mut(id) {
                pic.used_for_reference = false;
            }
        }
        self.is_reference = 0;
    }

    /// Marks the whole slot as unused for reference and drops its long-term
    /// status.
    pub fn unmark_long_term(&mut self, arena: &mut PictureArena) {
        for id in self.picture_ids() {
            if let Some(pic) = arena.get_mut(id) {
                pic.used_for_reference = false;
                pic.is_long_term = false;
            }
        }
        self.is_reference = 0;
        self.is_long_term = 0;
    }

    /// Marks one field as unused for reference. Once neither field remains a
    /// reference the frame picture follows.
    pub fn unmark_field_for_reference(
        &mut self,
        arena: &mut PictureArena,
        parity: PictureStructure,
    ) {
        let mask = parity_mask(parity);
        if let Some(pic) = self.attachment(parity).id().and_then(|id| arena.get_mut(id)) {
            pic.used_for_reference = false;
        }
        self.is_reference &= !mask;
        if self.is_reference == 0 {
            if let Some(pic) = self.frame.id().and_then(|id| arena.get_mut(id)) {
                pic.used_for_reference = false;
            }
        }
    }

    /// Field-granular version of [`FrameStore::unmark_long_term`].
    pub fn unmark_field_long_term(&mut self, arena: &mut PictureArena, parity: PictureStructure) {
        let mask = parity_mask(parity);
        if let Some(pic) = self.attachment(parity).id().and_then(|id| arena.get_mut(id)) {
            pic.used_for_reference = false;
            pic.is_long_term = false;
        }
        self.is_reference &= !mask;
        self.is_long_term &= !mask;
        if self.is_reference == 0 {
            if let Some(pic) = self.frame.id().and_then(|id| arena.get_mut(id)) {
                pic.used_for_reference = false;
                pic.is_long_term = false;
            }
        }
    }

    /// Converts the whole slot into a long-term reference with the given
    /// index.
    pub fn mark_long_term(&mut self, arena: &mut PictureArena, long_term_frame_idx: u32) {
        for id in self.picture_ids() {
            if let Some(pic) = arena.get_mut(id) {
                pic.used_for_reference = true;
                pic.is_long_term = true;
                pic.long_term_frame_idx = long_term_frame_idx;
            }
        }
        self.is_reference = self.is_used;
        self.is_long_term = self.is_used;
        self.long_term_frame_idx = long_term_frame_idx;
    }

    /// Converts one field into a long-term reference with the given index.
    pub fn mark_field_long_term(
        &mut self,
        arena: &mut PictureArena,
        parity: PictureStructure,
        long_term_frame_idx: u32,
    ) {
        let mask = parity_mask(parity);
        if let Some(pic) = self.attachment(parity).id().and_then(|id| arena.get_mut(id)) {
            pic.used_for_reference = true;
            pic.is_long_term = true;
            pic.long_term_frame_idx = long_term_frame_idx;
        }
        self.is_reference |= mask;
        self.is_long_term |= mask;
        self.long_term_frame_idx = long_term_frame_idx;

        // Both fields long-term promotes the frame as well.
        if self.is_long_term == FRAME {
            if let Some(pic) = self.frame.id().and_then(|id| arena.get_mut(id)) {
                pic.used_for_reference = true;
                pic.is_long_term = true;
                pic.long_term_frame_idx = long_term_frame_idx;
            }
        }
    }

    /// Returns owned output planes for the slot: the combined frame, or a
    /// lone field interleaved with mid-grey rows in place of its missing
    /// pair.
    pub fn output_planes(
        &self,
        arena: &PictureArena,
        sps: &Sps,
    ) -> anyhow::Result<(Plane, Option<Box<[Plane; 2]>>)> {
        if self.is_complete() {
            let frame = arena.resolve(self.frame);
            return Ok((frame.luma.clone(), frame.chroma.clone()));
        }

        let (field_ref, parity) = match self.is_used {
            TOP => (self.top_field, 0usize),
            BOTTOM => (self.bottom_field, 1usize),
            _ => return Err(anyhow!("outputting an empty frame store")),
        };

        let field = arena.resolve(field_ref);
        let mut out = StorablePicture::new(sps, PictureStructure::Frame);
        out.luma.fill(128);

        for y in 0..field.luma.height() {
            out.luma
                .row_mut(2 * y + parity)
                .copy_from_slice(field.luma.row(y));
        }
        if let (Some(oc), Some(fc)) = (out.chroma.as_mut(), field.chroma.as_ref()) {
            for plane in 0..2 {
                for y in 0..fc[plane].height() {
                    oc[plane]
                        .row_mut(2 * y + parity)
                        .copy_from_slice(fc[plane].row(y));
                }
            }
        }

        Ok((out.luma, out.chroma))
    }

    /// Detaches and frees every picture, returning the slot to its empty
    /// state. Safe to call on an empty slot.
    pub fn clear(&mut self, arena: &mut PictureArena) {
        let ids: Vec<_> = self.picture_ids().collect();
        for id in ids {
            arena.remove(id);
        }
        *self = FrameStore::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sps::SpsBuilder;

    fn interlaced_sps() -> Sps {
        SpsBuilder::new()
            .frame_mbs_only_flag(false)
            .resolution(64, 64)
            .max_num_ref_frames(2)
            .build()
    }

    fn new_field(
        arena: &mut PictureArena,
        sps: &Sps,
        structure: PictureStructure,
        poc: i32,
        fill: u8,
    ) -> PicId {
        let mut pic = StorablePicture::new(sps, structure);
        pic.poc = poc;
        for y in 0..pic.luma.height() {
            pic.luma.row_mut(y).fill(fill);
        }
        arena.insert(pic)
    }

    #[test]
    fn field_pair_combines_into_interleaved_frame() {
        let sps = interlaced_sps();
        let mut arena = PictureArena::new(&sps);
        let mut fs = FrameStore::new();

        let top = new_field(&mut arena, &sps, PictureStructure::TopField, 0, 10);
        let bottom = new_field(&mut arena, &sps, PictureStructure::BottomField, 1, 20);

        fs.insert_picture(&mut arena, &sps, top).unwrap();
        assert!(fs.is_partial_field());

        fs.insert_picture(&mut arena, &sps, bottom).unwrap();
        assert!(fs.is_complete());
        assert_eq!(fs.poc, 0);

        let frame = arena.resolve(fs.frame);
        assert_eq!(frame.poc, 0);
        assert_eq!(frame.top_poc, 0);
        assert_eq!(frame.bottom_poc, 1);
        assert!(frame.luma.row(0).iter().all(|&p| p == 10));
        assert!(frame.luma.row(1).iter().all(|&p| p == 20));
        assert!(!frame.coded_frame);
    }

    #[test]
    fn reference_frame_splits_into_fields() {
        let sps = interlaced_sps();
        let mut arena = PictureArena::new(&sps);
        let mut fs = FrameStore::new();

        let mut pic = StorablePicture::new(&sps, PictureStructure::Frame);
        pic.used_for_reference = true;
        pic.top_poc = 4;
        pic.bottom_poc = 5;
        pic.poc = 4;
        for y in 0..pic.luma.height() {
            pic.luma.row_mut(y).fill(if y % 2 == 0 { 1 } else { 2 });
        }
        let id = arena.insert(pic);

        fs.insert_picture(&mut arena, &sps, id).unwrap();

        assert!(fs.is_complete());
        assert_eq!(fs.is_reference, FRAME);
        let top = arena.resolve(fs.top_field);
        let bottom = arena.resolve(fs.bottom_field);
        assert!(top.luma.row(0).iter().all(|&p| p == 1));
        assert!(bottom.luma.row(0).iter().all(|&p| p == 2));
        assert_eq!(top.poc, 4);
        assert_eq!(bottom.poc, 5);
        assert!(top.used_for_reference && bottom.used_for_reference);
    }

    #[test]
    fn unpaired_field_outputs_against_grey() {
        let sps = interlaced_sps();
        let mut arena = PictureArena::new(&sps);
        let mut fs = FrameStore::new();

        let top = new_field(&mut arena, &sps, PictureStructure::TopField, 0, 30);
        fs.insert_picture(&mut arena, &sps, top).unwrap();

        let (luma, _) = fs.output_planes(&arena, &sps).unwrap();
        assert!(luma.row(0).iter().all(|&p| p == 30));
        assert!(luma.row(1).iter().all(|&p| p == 128));
    }

    #[test]
    fn clear_returns_pictures_to_arena() {
        let sps = interlaced_sps();
        let mut arena = PictureArena::new(&sps);
        let mut fs = FrameStore::new();

        let top = new_field(&mut arena, &sps, PictureStructure::TopField, 0, 0);
        let bottom = new_field(&mut arena, &sps, PictureStructure::BottomField, 1, 0);
        fs.insert_picture(&mut arena, &sps, top).unwrap();
        fs.insert_picture(&mut arena, &sps, bottom).unwrap();

        // Two fields plus the combined frame.
        assert_eq!(arena.live_count(), 3);

        fs.clear(&mut arena);
        assert!(fs.is_empty());
        assert_eq!(arena.live_count(), 0);
        assert_eq!(arena.live_bytes(), 0);
    }

    #[test]
    fn field_granular_unmarking_clears_the_frame_last() {
        let sps = interlaced_sps();
        let mut arena = PictureArena::new(&sps);
        let mut fs = FrameStore::new();

        for (structure, poc) in [
            (PictureStructure::TopField, 0),
            (PictureStructure::BottomField, 1),
        ] {
            let id = new_field(&mut arena, &sps, structure, poc, 0);
            arena.get_mut(id).unwrap().used_for_reference = true;
            fs.insert_picture(&mut arena, &sps, id).unwrap();
        }

        assert!(fs.has_short_term_reference());
        assert!(arena.resolve(fs.frame).used_for_reference);

        fs.unmark_field_for_reference(&mut arena, PictureStructure::TopField);
        assert!(fs.has_reference());
        assert!(arena.resolve(fs.frame).used_for_reference);

        fs.unmark_field_for_reference(&mut arena, PictureStructure::BottomField);
        assert!(!fs.has_reference());
        assert!(!arena.resolve(fs.frame).used_for_reference);
    }
}
