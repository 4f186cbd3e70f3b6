// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer: a fixed pool of frame stores sized from the
//! stream level, the reference marking rules that decide which stored
//! pictures stay, and the bumping process that hands pictures to the output
//! consumer in picture-order-count order.

use std::collections::VecDeque;

use log::debug;
use thiserror::Error;

use crate::arena::PicId;
use crate::arena::PictureArena;
use crate::frame_store::FrameStore;
use crate::frame_store::BOTTOM;
use crate::frame_store::FRAME;
use crate::frame_store::TOP;
use crate::marking::Marking;
use crate::marking::MaxLongTermFrameIdx;
use crate::marking::MmcoOp;
use crate::picture::PictureStructure;
use crate::picture::Plane;
use crate::picture::StorablePicture;
use crate::picture::ToneMapping;
use crate::sps::Level;
use crate::sps::Sps;
use crate::ChromaFormat;
use crate::Rect;
use crate::Resolution;

/// Absolute ceiling of the DPB size in frames, from Table A.1.
pub const MAX_DPB_FRAMES: usize = 16;

#[derive(Debug, Error)]
pub enum DpbSizeError {
    #[error("undefined level {0}")]
    UndefinedLevel(u8),
    #[error(
        "max_dec_frame_buffering ({max_dec_frame_buffering}) larger than the \
         level-derived DPB size ({computed})"
    )]
    MaxDecFrameBufferingTooLarge {
        max_dec_frame_buffering: u32,
        computed: usize,
    },
}

#[derive(Debug, Error)]
pub enum DpbInitError {
    #[error(transparent)]
    Size(#[from] DpbSizeError),
    #[error(
        "DPB size at the specified level ({size}) is smaller than the signaled \
         number of reference frames ({num_ref_frames})"
    )]
    RefFramesExceedCapacity { size: usize, num_ref_frames: usize },
}

#[derive(Debug, Error)]
pub enum MmcoError {
    #[error("could not find a short-term picture to mark in the DPB")]
    NoShortTermPic,
    #[error("could not find a long-term picture to mark in the DPB")]
    NoLongTermPic,
    #[error("a non-existing picture cannot be marked long-term")]
    ExpectedExisting,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output POC {poc} precedes the last output POC {last_output_poc}")]
    NonMonotonicOutput { poc: i32, last_output_poc: i32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stale picture handle")]
    StalePicture,
    #[error("duplicate frame_num {0} in the short-term reference buffer")]
    DuplicateFrameNum(i32),
    #[error("DPB is full and nothing can be output or evicted")]
    CapacityExceeded,
    #[error(transparent)]
    Mmco(#[from] MmcoError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// log2 rounded to the nearest integer, as used by the MVC DPB bound.
fn round_log2(value: u32) -> u32 {
    let mut ret = 0;
    let square = u64::from(value) * u64::from(value);
    while (1u64 << (ret + 1)) <= square {
        ret += 1;
    }
    (ret + 1) >> 1
}

fn apply_adjustment(size: usize, dpb_plus: i32) -> usize {
    std::cmp::max(1, size as i64 + i64::from(dpb_plus)) as usize
}

/// Returns the DPB size in frame stores for the given sequence parameters.
///
/// `dpb_plus` is a caller-supplied signed adjustment trading memory for
/// tolerance to reordering latency; it is applied last.
pub fn dpb_size(sps: &Sps, dpb_plus: i32) -> Result<usize, DpbSizeError> {
    let level = Level::n(sps.level_idc).ok_or(DpbSizeError::UndefinedLevel(sps.level_idc))?;

    // Table A.1, MaxDpbMbs.
    let max_dpb_mbs: u32 = match level {
        // No level defined: experimental usage, be generous.
        Level::L0 => return Ok(apply_adjustment(MAX_DPB_FRAMES, dpb_plus)),
        Level::L1B | Level::L1 => 396,
        // level_idc 11 doubles as level 1b for the non-FRExt profiles.
        Level::L1_1 => {
            if !sps.is_frext_profile() && sps.constraint_set3_flag {
                396
            } else {
                900
            }
        }
        Level::L1_2 | Level::L1_3 | Level::L2_0 => 2376,
        Level::L2_1 => 4752,
        Level::L2_2 | Level::L3 => 8100,
        Level::L3_1 => 18000,
        Level::L3_2 => 20480,
        Level::L4 | Level::L4_1 => 32768,
        Level::L4_2 => 34816,
        Level::L5 => 110400,
        Level::L5_1 | Level::L5_2 => 184320,
        Level::L6 | Level::L6_1 | Level::L6_2 => 696320,
    };

    let mut size = (max_dpb_mbs / sps.pic_size_in_mbs()) as usize;

    if sps.is_multiview_profile() {
        let num_views = std::cmp::max(1, sps.num_views) as usize;
        let bound = std::cmp::max(1, round_log2(num_views as u32) as usize) * MAX_DPB_FRAMES;
        size = std::cmp::min(2 * size, bound) / num_views;
    } else {
        size = std::cmp::min(size, MAX_DPB_FRAMES);
    }

    if sps.vui_parameters_present_flag && sps.vui_parameters.bitstream_restriction_flag {
        let max_dec_frame_buffering = sps.vui_parameters.max_dec_frame_buffering;
        if max_dec_frame_buffering as usize > size {
            return Err(DpbSizeError::MaxDecFrameBufferingTooLarge {
                max_dec_frame_buffering,
                computed: size,
            });
        }
        size = std::cmp::max(1, max_dec_frame_buffering as usize);
    }

    Ok(apply_adjustment(size, dpb_plus))
}

/// One picture handed to the presentation consumer, with the metadata needed
/// to display it.
#[derive(Debug)]
pub struct DecodedFrame {
    pub resolution: Resolution,
    pub visible_rect: Rect<u32>,
    pub format: ChromaFormat,
    pub poc: i32,
    pub view_id: i32,
    pub luma: Plane,
    pub chroma: Option<Box<[Plane; 2]>>,
    pub tone_mapping: Option<ToneMapping>,
}

/// The decoded picture buffer.
///
/// Owns the picture arena and a pool of `size` frame stores allocated up
/// front; slots `0..used_size` are occupied, in decode order. All state
/// transitions happen synchronously inside the entry points, once per
/// completed picture.
pub struct Dpb {
    arena: PictureArena,
    stores: Vec<FrameStore>,
    size: usize,
    used_size: usize,
    /// The sliding window bound, from the active SPS.
    num_ref_frames: usize,
    /// Indices of stores holding short-term references, decode order.
    ref_list: Vec<usize>,
    /// Indices of stores holding long-term references, decode order.
    ltref_list: Vec<usize>,
    /// Slot holding a lone field awaiting its complementary pair.
    last_picture: Option<usize>,
    last_output_poc: i32,
    last_output_view_id: i32,
    max_long_term_pic_idx: MaxLongTermFrameIdx,
    outputs: VecDeque<DecodedFrame>,
    /// The inter-layer reference slot of a multiview stream.
    inter_layer_store: Option<Box<FrameStore>>,
    sps: Sps,
}

impl Dpb {
    /// Builds a DPB for the given active sequence parameters.
    ///
    /// A parameter-set change (resolution switch, level change) is handled by
    /// constructing a fresh DPB; dropping the old one tears down every store
    /// and picture.
    pub fn new(sps: &Sps, dpb_plus: i32) -> Result<Self, DpbInitError> {
        let size = dpb_size(sps, dpb_plus)?;
        let num_ref_frames = sps.max_num_ref_frames as usize;

        if size < num_ref_frames {
            return Err(DpbInitError::RefFramesExceedCapacity {
                size,
                num_ref_frames,
            });
        }

        debug!(
            "Initializing a DPB of {} frame stores for {}x{}",
            size,
            sps.width(),
            sps.height()
        );

        Ok(Self {
            arena: PictureArena::new(sps),
            stores: (0..size).map(|_| FrameStore::new()).collect(),
            size,
            used_size: 0,
            num_ref_frames,
            ref_list: Vec::new(),
            ltref_list: Vec::new(),
            last_picture: None,
            last_output_poc: i32::MIN,
            last_output_view_id: -1,
            max_long_term_pic_idx: Default::default(),
            outputs: VecDeque::new(),
            inter_layer_store: sps
                .is_multiview_profile()
                .then(|| Box::new(FrameStore::new())),
            sps: sps.clone(),
        })
    }

    /// The maximum number of frame stores.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of occupied frame stores.
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    pub fn is_empty(&self) -> bool {
        self.used_size == 0
    }

    pub fn num_short_term_refs(&self) -> usize {
        self.ref_list.len()
    }

    pub fn num_long_term_refs(&self) -> usize {
        self.ltref_list.len()
    }

    pub fn max_long_term_frame_idx(&self) -> MaxLongTermFrameIdx {
        self.max_long_term_pic_idx
    }

    /// The occupied frame stores, in decode order.
    pub fn frame_stores(&self) -> &[FrameStore] {
        &self.stores[..self.used_size]
    }

    /// Indices into [`Dpb::frame_stores`] of the short-term reference slots.
    pub fn short_term_refs(&self) -> &[usize] {
        &self.ref_list
    }

    /// Indices into [`Dpb::frame_stores`] of the long-term reference slots.
    pub fn long_term_refs(&self) -> &[usize] {
        &self.ltref_list
    }

    pub fn inter_layer_store(&self) -> Option<&FrameStore> {
        self.inter_layer_store.as_deref()
    }

    pub fn arena(&self) -> &PictureArena {
        &self.arena
    }

    pub fn sps(&self) -> &Sps {
        &self.sps
    }

    /// Begins a new picture: allocates it in the arena, sized for the active
    /// sequence parameters, and returns a handle for the decode pipeline to
    /// fill through [`Dpb::picture_mut`].
    pub fn new_picture(&mut self, structure: PictureStructure) -> PicId {
        self.arena.insert(StorablePicture::new(&self.sps, structure))
    }

    pub fn picture(&self, id: PicId) -> Option<&StorablePicture> {
        self.arena.get(id)
    }

    pub fn picture_mut(&mut self, id: PicId) -> Option<&mut StorablePicture> {
        self.arena.get_mut(id)
    }

    /// Number of frames already bumped and waiting to be collected with
    /// [`Dpb::bump_frame`].
    pub fn pending_outputs(&self) -> usize {
        self.outputs.len()
    }

    fn update_ref_lists(&mut self) {
        self.ref_list.clear();
        self.ltref_list.clear();
        for i in 0..self.used_size {
            if self.stores[i].has_short_term_reference() {
                self.ref_list.push(i);
            }
            if self.stores[i].has_long_term_reference() {
                self.ltref_list.push(i);
            }
        }
    }

    /// 8.2.4.1, decoding process for picture numbers: refreshes
    /// `frame_num_wrap`, `pic_num` and `long_term_pic_num` of every stored
    /// reference relative to the picture about to be decoded. Must run before
    /// marking operations that address pictures by number.
    pub fn update_pic_nums(&mut self, current: PicId) -> Result<(), StoreError> {
        let cur = self.arena.get(current).ok_or(StoreError::StalePicture)?;
        let cur_structure = cur.structure;
        let cur_frame_num = cur.frame_num;
        let max_frame_num = self.sps.max_frame_num() as i32;

        for i in 0..self.used_size {
            for id in self.stores[i].picture_ids() {
                let Some(pic) = self.arena.get_mut(id) else {
                    continue;
                };
                if !pic.used_for_reference {
                    continue;
                }

                if pic.is_long_term {
                    pic.long_term_pic_num = if cur_structure == PictureStructure::Frame {
                        pic.long_term_frame_idx
                    } else if pic.structure == cur_structure {
                        2 * pic.long_term_frame_idx + 1
                    } else {
                        2 * pic.long_term_frame_idx
                    };
                } else {
                    pic.frame_num_wrap = if pic.frame_num > cur_frame_num {
                        pic.frame_num - max_frame_num
                    } else {
                        pic.frame_num
                    };

                    pic.pic_num = if cur_structure == PictureStructure::Frame {
                        pic.frame_num_wrap
                    } else if pic.structure == cur_structure {
                        2 * pic.frame_num_wrap + 1
                    } else {
                        2 * pic.frame_num_wrap
                    };
                }
            }

            let store = &mut self.stores[i];
            if store.has_short_term_reference() {
                store.frame_num_wrap = if store.frame_num > cur_frame_num {
                    store.frame_num - max_frame_num
                } else {
                    store.frame_num
                };
            }
        }

        Ok(())
    }

    /// Whether the lone field waiting in `slot` and `id` form a
    /// complementary pair: same frame_num, opposite parity, matching
    /// original reference status.
    fn pairs_with(&self, slot: usize, id: PicId) -> bool {
        let Some(pic) = self.arena.get(id) else {
            return false;
        };
        let store = &self.stores[slot];

        if store.frame_num != pic.frame_num {
            return false;
        }

        let complementary = match pic.structure {
            PictureStructure::TopField => store.is_used == BOTTOM,
            PictureStructure::BottomField => store.is_used == TOP,
            PictureStructure::Frame => false,
        };
        if !complementary {
            return false;
        }

        (store.is_orig_reference != 0) == pic.used_for_reference
    }

    /// Stores a completed picture, applying its marking directives and
    /// bumping older pictures out as needed. The per-picture insertion entry
    /// point of the buffer.
    pub fn store_picture(&mut self, id: PicId) -> Result<(), StoreError> {
        let pic = self.arena.get(id).ok_or(StoreError::StalePicture)?;
        let structure = pic.structure;
        let frame_num = pic.frame_num;
        let used_for_reference = pic.used_for_reference;
        let is_idr = pic.is_idr;
        let long_term_reference_flag = pic.long_term_reference_flag;
        let non_existing = pic.non_existing;
        let marking = pic.marking.clone();

        debug!(
            "Storing {:?} picture POC {} frame_num {} (reference: {})",
            structure, pic.poc, frame_num, used_for_reference
        );

        // The second field of an awaited complementary pair completes the
        // slot of its first field instead of taking a new one. Marking was
        // already applied when the first field arrived; the fields of an
        // access unit carry identical directives.
        if structure.is_field() {
            if let Some(slot) = self.last_picture.filter(|&slot| self.pairs_with(slot, id)) {
                if is_idr && long_term_reference_flag {
                    if let Some(pic) = self.arena.get_mut(id) {
                        pic.is_long_term = true;
                        pic.long_term_frame_idx = 0;
                    }
                }
                self.stores[slot].insert_picture(&mut self.arena, &self.sps, id)?;
                self.last_picture = None;
                self.update_ref_lists();
                return Ok(());
            }
        }

        if is_idr {
            self.idr_memory_management(id)?;
        } else if used_for_reference {
            if let Marking::Adaptive(ops) = &marking {
                self.adaptive_memory_management(id, ops)?;
            }
        }

        // Sliding window, 8.2.5.3.
        if !is_idr && used_for_reference && !marking.is_adaptive() {
            self.sliding_window_marking(id);
        }

        if self.used_size == self.size {
            self.remove_unused();
        }

        while self.used_size == self.size {
            if !used_for_reference && structure == PictureStructure::Frame {
                let cur_poc = self.arena.get(id).ok_or(StoreError::StalePicture)?.poc;
                let precedes_all = self
                    .smallest_pending_poc()
                    .map_or(true, |(poc, _)| cur_poc < poc);
                if precedes_all {
                    return self.direct_output(id);
                }
            }

            if !self.output_one_frame()? {
                return Err(StoreError::CapacityExceeded);
            }
            self.remove_unused();
        }

        // Conformance: frame_num must be unique among short-term reference
        // frames.
        let pic = self.arena.get(id).ok_or(StoreError::StalePicture)?;
        if pic.used_for_reference && !pic.is_long_term {
            for &slot in &self.ref_list {
                if self.stores[slot].frame_num == frame_num {
                    return Err(StoreError::DuplicateFrameNum(frame_num));
                }
            }
        }

        let slot = self.used_size;
        self.stores[slot].insert_picture(&mut self.arena, &self.sps, id)?;
        if non_existing {
            // Inferred pictures only ever provide reference placeholders.
            self.stores[slot].is_output = true;
        }
        self.last_picture = structure.is_field().then_some(slot);
        self.used_size += 1;
        self.update_ref_lists();

        Ok(())
    }

    /// 8.2.5.3, sliding window decoded reference picture marking: once the
    /// short-term set fills the window, the oldest short-term store in decode
    /// order loses its reference status.
    fn sliding_window_marking(&mut self, current: PicId) {
        let window = std::cmp::max(1, self.num_ref_frames) as i64;
        let num_short = self.ref_list.len() as i64;
        let num_long = self.ltref_list.len() as i64;

        if num_short >= window - num_long {
            for i in 0..self.used_size {
                if self.stores[i].has_reference() && self.stores[i].is_long_term == 0 {
                    debug!(
                        "Sliding window unmarking store {} (frame_num {})",
                        i, self.stores[i].frame_num
                    );
                    self.stores[i].unmark_for_reference(&mut self.arena);
                    self.update_ref_lists();
                    break;
                }
            }
        }

        if let Some(pic) = self.arena.get_mut(current) {
            pic.is_long_term = false;
        }
    }

    /// 8.2.5.1, decoding process for an IDR picture: the buffer empties,
    /// with or without output, and the watermark restarts.
    fn idr_memory_management(&mut self, id: PicId) -> Result<(), StoreError> {
        let pic = self.arena.get(id).ok_or(StoreError::StalePicture)?;
        let no_output = pic.no_output_of_prior_pics;
        let long_term_flag = pic.long_term_reference_flag;

        if no_output {
            debug!(
                "IDR with no_output_of_prior_pics_flag, dropping {} stores",
                self.used_size
            );
            for i in 0..self.used_size {
                self.stores[i].clear(&mut self.arena);
            }
            self.used_size = 0;
            self.last_picture = None;
            self.update_ref_lists();
            self.last_output_poc = i32::MIN;
            self.last_output_view_id = -1;
        } else {
            self.flush_internal()?;
        }

        let pic = self.arena.get_mut(id).ok_or(StoreError::StalePicture)?;
        if long_term_flag {
            self.max_long_term_pic_idx = MaxLongTermFrameIdx::Idx(0);
            pic.is_long_term = true;
            pic.long_term_frame_idx = 0;
        } else {
            self.max_long_term_pic_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
            pic.is_long_term = false;
        }

        Ok(())
    }

    /// 8.2.5.4, adaptive memory control decoded reference picture marking.
    fn adaptive_memory_management(
        &mut self,
        current: PicId,
        ops: &[MmcoOp],
    ) -> Result<(), StoreError> {
        let mut has_clear_all = false;

        for op in ops {
            log::trace!("DPB state before {:?}: {:#?}", op, self);
            match *op {
                MmcoOp::UnmarkShortTerm {
                    difference_of_pic_nums_minus1,
                } => self.mmco_unmark_short_term(current, difference_of_pic_nums_minus1)?,
                MmcoOp::UnmarkLongTerm { long_term_pic_num } => {
                    self.mmco_unmark_long_term(current, long_term_pic_num)?
                }
                MmcoOp::AssignLongTermIdx {
                    difference_of_pic_nums_minus1,
                    long_term_frame_idx,
                } => self.mmco_assign_long_term(
                    current,
                    difference_of_pic_nums_minus1,
                    long_term_frame_idx,
                )?,
                MmcoOp::SetMaxLongTermIdx {
                    max_long_term_frame_idx,
                } => self.mmco_set_max_long_term_idx(max_long_term_frame_idx),
                MmcoOp::UnmarkAll => {
                    self.mmco_unmark_all();
                    has_clear_all = true;
                }
                MmcoOp::MarkCurrentLongTerm {
                    long_term_frame_idx,
                } => self.mmco_mark_current_long_term(current, long_term_frame_idx)?,
            }
            self.update_ref_lists();
        }

        if has_clear_all {
            // The current picture is inferred to have frame_num 0 and its
            // order counts rebased to zero for all subsequent use.
            let pic = self.arena.get_mut(current).ok_or(StoreError::StalePicture)?;
            pic.frame_num = 0;
            pic.frame_num_wrap = 0;
            pic.pic_num = 0;
            match pic.structure {
                PictureStructure::TopField => {
                    pic.top_poc = 0;
                    pic.poc = 0;
                }
                PictureStructure::BottomField => {
                    pic.bottom_poc = 0;
                    pic.poc = 0;
                }
                PictureStructure::Frame => {
                    pic.top_poc -= pic.poc;
                    pic.bottom_poc -= pic.poc;
                    pic.poc = std::cmp::min(pic.top_poc, pic.bottom_poc);
                }
            }
            self.flush_internal()?;
        }

        Ok(())
    }

    /// Finds the short-term reference with the given `pic_num`. In frame
    /// mode only whole reference frames are considered; in field mode only
    /// individual fields.
    fn find_short_term_with_pic_num(
        &self,
        pic_num: i32,
        field_mode: bool,
    ) -> Option<(usize, Option<PictureStructure>)> {
        for i in 0..self.used_size {
            let store = &self.stores[i];

            if !field_mode {
                if store.is_reference == FRAME
                    && store.is_long_term == 0
                    && self.arena.resolve(store.frame).pic_num == pic_num
                {
                    debug!("find_short_term_with_pic_num: {} in store {}", pic_num, i);
                    return Some((i, None));
                }
            } else {
                for (parity, mask, attachment) in [
                    (PictureStructure::TopField, TOP, store.top_field),
                    (PictureStructure::BottomField, BOTTOM, store.bottom_field),
                ] {
                    if store.is_reference & mask != 0
                        && store.is_long_term & mask == 0
                        && self.arena.resolve(attachment).pic_num == pic_num
                    {
                        debug!(
                            "find_short_term_with_pic_num: {} in store {} ({:?})",
                            pic_num, i, parity
                        );
                        return Some((i, Some(parity)));
                    }
                }
            }
        }

        debug!("find_short_term_with_pic_num: {} not found", pic_num);
        None
    }

    /// Finds the long-term reference with the given `long_term_pic_num`,
    /// with the same frame/field granularity as the short-term lookup.
    fn find_long_term_with_pic_num(
        &self,
        long_term_pic_num: u32,
        field_mode: bool,
    ) -> Option<(usize, Option<PictureStructure>)> {
        for i in 0..self.used_size {
            let store = &self.stores[i];

            if !field_mode {
                if store.is_long_term == FRAME
                    && store.is_reference == FRAME
                    && self.arena.resolve(store.frame).long_term_pic_num == long_term_pic_num
                {
                    return Some((i, None));
                }
            } else {
                for (parity, mask, attachment) in [
                    (PictureStructure::TopField, TOP, store.top_field),
                    (PictureStructure::BottomField, BOTTOM, store.bottom_field),
                ] {
                    if store.is_reference & mask != 0
                        && store.is_long_term & mask != 0
                        && self.arena.resolve(attachment).long_term_pic_num == long_term_pic_num
                    {
                        return Some((i, Some(parity)));
                    }
                }
            }
        }

        None
    }

    /// MMCO operation 1: unmark a short-term picture.
    fn mmco_unmark_short_term(
        &mut self,
        current: PicId,
        difference_of_pic_nums_minus1: u32,
    ) -> Result<(), StoreError> {
        let cur = self.arena.get(current).ok_or(StoreError::StalePicture)?;
        let field_mode = cur.structure.is_field();
        let pic_num_x = cur.pic_num - (difference_of_pic_nums_minus1 as i32 + 1);

        debug!("MMCO unmark short term, pic_num_x {}", pic_num_x);

        let (slot, parity) = self
            .find_short_term_with_pic_num(pic_num_x, field_mode)
            .ok_or(MmcoError::NoShortTermPic)?;

        match parity {
            None => self.stores[slot].unmark_for_reference(&mut self.arena),
            Some(parity) => self.stores[slot].unmark_field_for_reference(&mut self.arena, parity),
        }

        Ok(())
    }

    /// MMCO operation 2: unmark a long-term picture.
    fn mmco_unmark_long_term(
        &mut self,
        current: PicId,
        long_term_pic_num: u32,
    ) -> Result<(), StoreError> {
        let cur = self.arena.get(current).ok_or(StoreError::StalePicture)?;
        let field_mode = cur.structure.is_field();

        debug!("MMCO unmark long term, long_term_pic_num {}", long_term_pic_num);

        let (slot, parity) = self
            .find_long_term_with_pic_num(long_term_pic_num, field_mode)
            .ok_or(MmcoError::NoLongTermPic)?;

        match parity {
            None => self.stores[slot].unmark_long_term(&mut self.arena),
            Some(parity) => self.stores[slot].unmark_field_long_term(&mut self.arena, parity),
        }

        Ok(())
    }

    /// Drops the previous holder of `long_term_frame_idx`, if any, sparing
    /// `keep`: the store that is gaining the index (so a field pair can be
    /// completed) or the pair of the current picture.
    fn unmark_long_term_frame_idx_holder(&mut self, long_term_frame_idx: u32, keep: Option<usize>) {
        for i in 0..self.used_size {
            if Some(i) == keep {
                continue;
            }
            if !(self.stores[i].has_long_term_reference()
                && self.stores[i].long_term_frame_idx == long_term_frame_idx)
            {
                continue;
            }

            if self.stores[i].is_long_term == FRAME {
                self.stores[i].unmark_long_term(&mut self.arena);
            } else if self.stores[i].is_long_term & TOP != 0 {
                self.stores[i].unmark_field_long_term(&mut self.arena, PictureStructure::TopField);
            } else {
                self.stores[i]
                    .unmark_field_long_term(&mut self.arena, PictureStructure::BottomField);
            }
            break;
        }
    }

    /// MMCO operation 3: turn a short-term picture into a long-term one.
    fn mmco_assign_long_term(
        &mut self,
        current: PicId,
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    ) -> Result<(), StoreError> {
        let cur = self.arena.get(current).ok_or(StoreError::StalePicture)?;
        let field_mode = cur.structure.is_field();
        let pic_num_x = cur.pic_num - (difference_of_pic_nums_minus1 as i32 + 1);

        debug!(
            "MMCO assign long_term_frame_idx {} to pic_num_x {}",
            long_term_frame_idx, pic_num_x
        );

        let (slot, parity) = self
            .find_short_term_with_pic_num(pic_num_x, field_mode)
            .ok_or(MmcoError::NoShortTermPic)?;

        let target_mask = match parity {
            None => FRAME,
            Some(PictureStructure::TopField) => TOP,
            _ => BOTTOM,
        };
        if self.stores[slot].is_non_existent & target_mask != 0 {
            return Err(MmcoError::ExpectedExisting.into());
        }

        self.unmark_long_term_frame_idx_holder(long_term_frame_idx, Some(slot));

        match parity {
            None => self.stores[slot].mark_long_term(&mut self.arena, long_term_frame_idx),
            Some(parity) => {
                self.stores[slot].mark_field_long_term(&mut self.arena, parity, long_term_frame_idx)
            }
        }

        Ok(())
    }

    /// MMCO operation 4: set the maximum long-term frame index, unmarking
    /// the long-term references above it.
    fn mmco_set_max_long_term_idx(&mut self, max_long_term_frame_idx: MaxLongTermFrameIdx) {
        debug!(
            "MMCO set max_long_term_frame_idx to {:?}",
            max_long_term_frame_idx
        );

        self.max_long_term_pic_idx = max_long_term_frame_idx;

        for i in 0..self.used_size {
            if self.stores[i].has_long_term_reference()
                && max_long_term_frame_idx < self.stores[i].long_term_frame_idx
            {
                self.stores[i].unmark_long_term(&mut self.arena);
            }
        }
    }

    /// MMCO operation 5: unmark every reference picture.
    fn mmco_unmark_all(&mut self) {
        debug!("MMCO unmark all reference pictures");

        for i in 0..self.used_size {
            self.stores[i].unmark_for_reference(&mut self.arena);
        }
        self.max_long_term_pic_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
    }

    /// MMCO operation 6: mark the current picture long-term.
    fn mmco_mark_current_long_term(
        &mut self,
        current: PicId,
        long_term_frame_idx: u32,
    ) -> Result<(), StoreError> {
        debug!(
            "MMCO mark current long term, long_term_frame_idx {}",
            long_term_frame_idx
        );

        // The pair of the current field may already hold this index; it must
        // survive so the pair completes as one long-term unit.
        let pair_slot = match self.last_picture {
            Some(slot) if self.pairs_with(slot, current) => Some(slot),
            _ => None,
        };
        self.unmark_long_term_frame_idx_holder(long_term_frame_idx, pair_slot);

        let pic = self.arena.get_mut(current).ok_or(StoreError::StalePicture)?;
        pic.is_long_term = true;
        pic.long_term_frame_idx = long_term_frame_idx;

        Ok(())
    }

    /// Lowest-POC store still pending output. Slots awaiting a complementary
    /// field are skipped: a frame store is atomic for bumping purposes.
    fn smallest_pending_poc(&self) -> Option<(i32, usize)> {
        let mut best: Option<(i32, usize)> = None;

        for i in 0..self.used_size {
            let store = &self.stores[i];
            if store.is_empty() || store.is_output {
                continue;
            }
            if self.last_picture == Some(i) && store.is_partial_field() {
                continue;
            }
            if best.map_or(true, |(poc, _)| store.poc < poc) {
                best = Some((store.poc, i));
            }
        }

        best
    }

    fn decoded_frame_for(&self, pos: usize) -> anyhow::Result<DecodedFrame> {
        let store = &self.stores[pos];
        let (luma, chroma) = store.output_planes(&self.arena, &self.sps)?;

        let source = match store.is_used {
            TOP => store.top_field,
            BOTTOM => store.bottom_field,
            _ => store.frame,
        };
        let tone_mapping = self.arena.resolve(source).tone_mapping.clone();

        Ok(DecodedFrame {
            resolution: self.sps.resolution(),
            visible_rect: self.sps.visible_rectangle(),
            format: self.sps.chroma_format(),
            poc: store.poc,
            view_id: store.view_id,
            luma,
            chroma,
            tone_mapping,
        })
    }

    /// C.4.5.3, the bumping process: outputs the lowest-POC pending store
    /// and evicts it once it holds no reference. Returns false when nothing
    /// is pending.
    fn output_one_frame(&mut self) -> Result<bool, OutputError> {
        let Some((poc, pos)) = self.smallest_pending_poc() else {
            return Ok(false);
        };

        if self.last_output_poc > i32::MIN && poc < self.last_output_poc {
            return Err(OutputError::NonMonotonicOutput {
                poc,
                last_output_poc: self.last_output_poc,
            });
        }

        debug!("Bumping store {} (POC {}) for output", pos, poc);

        let frame = self.decoded_frame_for(pos)?;

        self.stores[pos].is_output = true;
        for id in self.stores[pos].picture_ids() {
            if let Some(pic) = self.arena.get_mut(id) {
                pic.is_output = true;
            }
        }

        self.last_output_poc = poc;
        self.last_output_view_id = self.stores[pos].view_id;
        self.outputs.push_back(frame);

        if !self.stores[pos].has_reference() {
            self.remove_frame(pos);
        }

        Ok(true)
    }

    /// Outputs a picture that never enters the pool: a non-reference frame
    /// preceding everything pending while the buffer is full.
    fn direct_output(&mut self, id: PicId) -> Result<(), StoreError> {
        let poc = self.arena.get(id).ok_or(StoreError::StalePicture)?.poc;

        if self.last_output_poc > i32::MIN && poc < self.last_output_poc {
            return Err(OutputError::NonMonotonicOutput {
                poc,
                last_output_poc: self.last_output_poc,
            }
            .into());
        }

        debug!("Directly outputting non-reference picture POC {}", poc);

        let mut pic = self.arena.remove(id).ok_or(StoreError::StalePicture)?;
        pic.is_output = true;

        let frame = DecodedFrame {
            resolution: self.sps.resolution(),
            visible_rect: self.sps.visible_rectangle(),
            format: self.sps.chroma_format(),
            poc,
            view_id: pic.view_id,
            luma: pic.luma,
            chroma: pic.chroma,
            tone_mapping: pic.tone_mapping,
        };

        self.last_output_poc = poc;
        self.last_output_view_id = frame.view_id;
        self.outputs.push_back(frame);

        Ok(())
    }

    /// Drops every already-output store that holds no reference. Returns
    /// whether anything was removed.
    fn remove_unused(&mut self) -> bool {
        let mut removed = false;
        let mut i = 0;

        while i < self.used_size {
            let store = &self.stores[i];
            if !store.is_empty() && store.is_output && !store.has_reference() {
                self.remove_frame(i);
                removed = true;
            } else {
                i += 1;
            }
        }

        removed
    }

    /// Frees the pictures of one slot and recycles its shell at the end of
    /// the pool.
    fn remove_frame(&mut self, pos: usize) {
        debug!(
            "Removing frame store {} (POC {}) from the DPB",
            pos, self.stores[pos].poc
        );

        self.stores[pos].clear(&mut self.arena);
        self.stores[pos..].rotate_left(1);
        self.used_size -= 1;

        match self.last_picture {
            Some(p) if p == pos => self.last_picture = None,
            Some(p) if p > pos => self.last_picture = Some(p - 1),
            _ => {}
        }

        self.update_ref_lists();
    }

    /// Empties the buffer through the output queue: every pending picture is
    /// bumped (unpaired fields padded with grey), references released, and
    /// the watermark reset. Used on end of stream and before
    /// re-initialization.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.flush_internal()
    }

    fn flush_internal(&mut self) -> Result<(), OutputError> {
        debug!("Flushing the DPB");

        for i in 0..self.used_size {
            self.stores[i].unmark_for_reference(&mut self.arena);
        }
        self.last_picture = None;
        self.update_ref_lists();

        self.remove_unused();
        while self.output_one_frame()? {}

        self.last_output_poc = i32::MIN;
        self.last_output_view_id = -1;

        Ok(())
    }

    /// Returns the next picture in output order, or `None` when nothing is
    /// pending: first any frame already bumped by buffer pressure, then the
    /// lowest-POC picture still resident.
    pub fn bump_frame(&mut self) -> Result<Option<DecodedFrame>, OutputError> {
        if self.outputs.is_empty() {
            self.output_one_frame()?;
        }
        Ok(self.outputs.pop_front())
    }
}

impl std::fmt::Debug for Dpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dpb")
            .field("size", &self.size)
            .field("used_size", &self.used_size)
            .field("num_ref_frames", &self.num_ref_frames)
            .field("ref_list", &self.ref_list)
            .field("ltref_list", &self.ltref_list)
            .field("last_output_poc", &self.last_output_poc)
            .field("last_output_view_id", &self.last_output_view_id)
            .field("stores", &&self.stores[..self.used_size])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sps::Profile;
    use crate::sps::SpsBuilder;

    fn sps_1080p(level: Level) -> Sps {
        SpsBuilder::new()
            .profile_idc(Profile::High)
            .level_idc(level)
            .resolution(1920, 1088)
            .max_num_ref_frames(2)
            .build()
    }

    /// A small-picture SPS whose level-derived size is clipped to 16, with
    /// the VUI override pinning the exact capacity.
    fn sps_with_capacity(capacity: u32, num_ref_frames: u8) -> Sps {
        SpsBuilder::new()
            .profile_idc(Profile::High)
            .level_idc(Level::L3_1)
            .resolution(64, 64)
            .max_num_ref_frames(num_ref_frames)
            .max_dec_frame_buffering(capacity)
            .build()
    }

    fn store_frame(dpb: &mut Dpb, poc: i32, frame_num: i32, reference: bool) -> PicId {
        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.poc = poc;
            pic.top_poc = poc;
            pic.bottom_poc = poc;
            pic.frame_num = frame_num;
            pic.pic_num = frame_num;
            pic.used_for_reference = reference;
        }
        dpb.store_picture(id).unwrap();
        id
    }

    #[test]
    fn capacity_for_level_3_1_at_1080p() {
        let sps = sps_1080p(Level::L3_1);
        // 18000 / 8160 macroblocks.
        assert_eq!(dpb_size(&sps, 0).unwrap(), 2);
        assert_eq!(dpb_size(&sps, 1).unwrap(), 3);
    }

    #[test]
    fn capacity_is_monotonic_in_picture_size() {
        let mut last = usize::MAX;
        for (width, height) in [(176, 144), (352, 288), (720, 576), (1280, 720), (1920, 1088)] {
            let sps = SpsBuilder::new()
                .profile_idc(Profile::High)
                .level_idc(Level::L3_1)
                .resolution(width, height)
                .build();
            let size = dpb_size(&sps, 0).unwrap();

            assert!((1..=16).contains(&size));
            assert!(size <= last);
            last = size;
        }
    }

    #[test]
    fn vui_override_replaces_computed_size() {
        // Level 4 at 1080p computes to 4 frames.
        let base = sps_1080p(Level::L4);
        assert_eq!(dpb_size(&base, 0).unwrap(), 4);

        let mut sps = base.clone();
        sps.vui_parameters_present_flag = true;
        sps.vui_parameters.bitstream_restriction_flag = true;
        sps.vui_parameters.max_dec_frame_buffering = 3;
        assert_eq!(dpb_size(&sps, 0).unwrap(), 3);

        // A zero override is floored at one frame.
        sps.vui_parameters.max_dec_frame_buffering = 0;
        assert_eq!(dpb_size(&sps, 0).unwrap(), 1);
    }

    #[test]
    fn vui_override_beyond_bound_is_fatal() {
        let mut sps = sps_1080p(Level::L4);
        sps.vui_parameters_present_flag = true;
        sps.vui_parameters.bitstream_restriction_flag = true;
        sps.vui_parameters.max_dec_frame_buffering = 5;

        assert!(matches!(
            dpb_size(&sps, 0),
            Err(DpbSizeError::MaxDecFrameBufferingTooLarge {
                max_dec_frame_buffering: 5,
                computed: 4,
            })
        ));
    }

    #[test]
    fn undefined_level_is_fatal() {
        let mut sps = sps_1080p(Level::L3_1);
        sps.level_idc = 15;

        assert!(matches!(
            dpb_size(&sps, 0),
            Err(DpbSizeError::UndefinedLevel(15))
        ));
    }

    #[test]
    fn level_zero_is_unconstrained() {
        let sps = SpsBuilder::new().resolution(1920, 1088).build();
        assert_eq!(sps.level_idc, 0);
        assert_eq!(dpb_size(&sps, 0).unwrap(), 16);
    }

    #[test]
    fn multiview_capacity_divides_by_views() {
        // Level 5 at 1080p computes to 13 frames single-view.
        let single = sps_1080p(Level::L5);
        assert_eq!(dpb_size(&single, 0).unwrap(), 13);

        let stereo = SpsBuilder::new()
            .profile_idc(Profile::StereoHigh)
            .level_idc(Level::L5)
            .resolution(1920, 1088)
            .num_views(2)
            .build();
        // min(2 * 13, 16) / 2.
        assert_eq!(dpb_size(&stereo, 0).unwrap(), 8);
    }

    #[test]
    fn init_rejects_more_ref_frames_than_capacity() {
        let mut sps = sps_1080p(Level::L3_1);
        sps.max_num_ref_frames = 4;

        assert!(matches!(
            Dpb::new(&sps, 0),
            Err(DpbInitError::RefFramesExceedCapacity {
                size: 2,
                num_ref_frames: 4,
            })
        ));
    }

    #[test]
    fn multiview_dpb_has_an_inter_layer_slot() {
        let stereo = SpsBuilder::new()
            .profile_idc(Profile::StereoHigh)
            .level_idc(Level::L5)
            .resolution(1920, 1088)
            .num_views(2)
            .build();

        let dpb = Dpb::new(&stereo, 0).unwrap();
        assert!(dpb.inter_layer_store().is_some());

        let single = Dpb::new(&sps_1080p(Level::L3_1), 0).unwrap();
        assert!(single.inter_layer_store().is_none());
    }

    #[test]
    fn non_reference_pictures_bump_in_poc_order() {
        let sps = sps_with_capacity(2, 0);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        store_frame(&mut dpb, 0, 0, false);
        store_frame(&mut dpb, 4, 1, false);
        assert_eq!(dpb.used_size(), 2);

        // The buffer is full: storing POC 2 bumps POC 0 out first.
        store_frame(&mut dpb, 2, 2, false);
        assert_eq!(dpb.used_size(), 2);

        let first = dpb.bump_frame().unwrap().unwrap();
        assert_eq!(first.poc, 0);

        let second = dpb.bump_frame().unwrap().unwrap();
        assert_eq!(second.poc, 2);

        // POC 4 is still resident.
        assert_eq!(dpb.used_size(), 1);
        assert_eq!(dpb.frame_stores()[0].poc, 4);
    }

    #[test]
    fn output_order_is_non_decreasing_in_poc() {
        let _ = env_logger::try_init();

        let sps = sps_with_capacity(16, 8);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        for (frame_num, poc) in [(0, 0), (1, 8), (2, 4), (3, 2), (4, 6)] {
            store_frame(&mut dpb, poc, frame_num, frame_num % 2 == 0);
        }

        dpb.flush().unwrap();

        let mut pocs = vec![];
        while let Some(frame) = dpb.bump_frame().unwrap() {
            pocs.push(frame.poc);
        }
        assert_eq!(pocs, vec![0, 2, 4, 6, 8]);
        assert!(dpb.is_empty());
    }

    #[test]
    fn bumping_below_the_watermark_is_fatal() {
        let sps = sps_with_capacity(2, 0);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        store_frame(&mut dpb, 10, 0, false);
        assert_eq!(dpb.bump_frame().unwrap().unwrap().poc, 10);

        store_frame(&mut dpb, 5, 1, false);
        assert!(matches!(
            dpb.bump_frame(),
            Err(OutputError::NonMonotonicOutput {
                poc: 5,
                last_output_poc: 10,
            })
        ));
    }

    #[test]
    fn clear_all_marking_resets_the_output_watermark() {
        let sps = sps_with_capacity(4, 3);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        for (frame_num, poc) in [(0, 0), (1, 16), (2, 40)] {
            store_frame(&mut dpb, poc, frame_num, true);
        }
        while dpb.bump_frame().unwrap().is_some() {}

        // "Clear all references" on the next stored picture rebases it to
        // POC 0; output must restart without tripping the watermark.
        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.poc = 44;
            pic.top_poc = 44;
            pic.bottom_poc = 44;
            pic.frame_num = 3;
            pic.used_for_reference = true;
            pic.marking = Marking::Adaptive(vec![MmcoOp::UnmarkAll]);
        }
        dpb.store_picture(id).unwrap();

        assert_eq!(dpb.used_size(), 1);
        let frame = dpb.bump_frame().unwrap().unwrap();
        assert_eq!(frame.poc, 0);
    }

    #[test]
    fn sliding_window_unmarks_the_oldest_short_term() {
        let sps = sps_with_capacity(16, 2);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        store_frame(&mut dpb, 0, 0, true);
        store_frame(&mut dpb, 2, 1, true);
        assert_eq!(dpb.num_short_term_refs(), 2);

        store_frame(&mut dpb, 4, 2, true);
        assert_eq!(dpb.num_short_term_refs(), 2);

        // The oldest store lost its reference status but is still resident,
        // pending output.
        assert!(!dpb.frame_stores()[0].has_reference());
        assert_eq!(dpb.frame_stores()[0].frame_num, 0);
        assert_eq!(dpb.used_size(), 3);
    }

    #[test]
    fn long_term_references_are_immune_to_the_sliding_window() {
        let sps = sps_with_capacity(16, 2);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.used_for_reference = true;
            pic.marking = Marking::Adaptive(vec![MmcoOp::MarkCurrentLongTerm {
                long_term_frame_idx: 0,
            }]);
        }
        dpb.store_picture(id).unwrap();
        assert_eq!(dpb.num_long_term_refs(), 1);

        for frame_num in 1..5 {
            store_frame(&mut dpb, frame_num * 2, frame_num, true);
        }

        assert_eq!(dpb.num_long_term_refs(), 1);
        // Window of two minus one pinned long-term leaves one short-term.
        assert_eq!(dpb.num_short_term_refs(), 1);
    }

    #[test]
    fn mmco_unmarks_a_short_term_by_pic_num() {
        let sps = sps_with_capacity(16, 3);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        store_frame(&mut dpb, 0, 0, true);
        store_frame(&mut dpb, 2, 1, true);

        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.poc = 4;
            pic.frame_num = 2;
            pic.pic_num = 2;
            pic.used_for_reference = true;
            // pic_num_x = 2 - (1 + 1) = 0: unmark frame_num 0.
            pic.marking = Marking::Adaptive(vec![MmcoOp::UnmarkShortTerm {
                difference_of_pic_nums_minus1: 1,
            }]);
        }
        dpb.update_pic_nums(id).unwrap();
        dpb.store_picture(id).unwrap();

        assert_eq!(dpb.num_short_term_refs(), 2);
        assert!(!dpb.frame_stores()[0].has_reference());
        assert_eq!(dpb.frame_stores()[0].frame_num, 0);
    }

    #[test]
    fn mmco_assigns_and_removes_a_long_term_index() {
        let sps = sps_with_capacity(16, 3);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        store_frame(&mut dpb, 0, 0, true);

        // Promote frame_num 0 to long-term index 1.
        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.poc = 2;
            pic.frame_num = 1;
            pic.pic_num = 1;
            pic.used_for_reference = true;
            pic.marking = Marking::Adaptive(vec![MmcoOp::AssignLongTermIdx {
                difference_of_pic_nums_minus1: 0,
                long_term_frame_idx: 1,
            }]);
        }
        dpb.update_pic_nums(id).unwrap();
        dpb.store_picture(id).unwrap();

        assert_eq!(dpb.num_long_term_refs(), 1);
        assert_eq!(dpb.num_short_term_refs(), 1);
        assert_eq!(dpb.frame_stores()[0].long_term_frame_idx, 1);

        // Now remove it by long_term_pic_num.
        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.poc = 4;
            pic.frame_num = 2;
            pic.pic_num = 2;
            pic.used_for_reference = true;
            pic.marking = Marking::Adaptive(vec![MmcoOp::UnmarkLongTerm {
                long_term_pic_num: 1,
            }]);
        }
        dpb.update_pic_nums(id).unwrap();
        dpb.store_picture(id).unwrap();

        assert_eq!(dpb.num_long_term_refs(), 0);
    }

    #[test]
    fn idr_without_output_drops_pending_pictures() {
        let sps = sps_with_capacity(4, 2);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        store_frame(&mut dpb, 0, 0, true);
        store_frame(&mut dpb, 2, 1, true);

        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.poc = 0;
            pic.frame_num = 0;
            pic.used_for_reference = true;
            pic.is_idr = true;
            pic.no_output_of_prior_pics = true;
        }
        dpb.store_picture(id).unwrap();

        assert_eq!(dpb.used_size(), 1);
        assert_eq!(dpb.pending_outputs(), 0);

        // Only the IDR itself ever reaches the output.
        let frame = dpb.bump_frame().unwrap().unwrap();
        assert_eq!(frame.poc, 0);
        assert!(dpb.bump_frame().unwrap().is_none());
    }

    #[test]
    fn full_buffer_of_references_is_a_capacity_violation() {
        let sps = sps_with_capacity(2, 2);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        // Pin both slots as long-term references.
        for frame_num in 0..2i32 {
            let id = dpb.new_picture(PictureStructure::Frame);
            {
                let pic = dpb.picture_mut(id).unwrap();
                pic.poc = frame_num * 2;
                pic.frame_num = frame_num;
                pic.used_for_reference = true;
                pic.marking = Marking::Adaptive(vec![MmcoOp::MarkCurrentLongTerm {
                    long_term_frame_idx: frame_num as u32,
                }]);
            }
            dpb.store_picture(id).unwrap();
        }
        assert_eq!(dpb.num_long_term_refs(), 2);

        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.poc = 4;
            pic.frame_num = 2;
            pic.used_for_reference = true;
        }
        assert!(matches!(
            dpb.store_picture(id),
            Err(StoreError::CapacityExceeded)
        ));
    }

    #[test]
    fn duplicate_short_term_frame_num_is_fatal() {
        let sps = sps_with_capacity(16, 3);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        store_frame(&mut dpb, 0, 0, true);

        let id = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(id).unwrap();
            pic.poc = 2;
            pic.frame_num = 0;
            pic.used_for_reference = true;
        }
        assert!(matches!(
            dpb.store_picture(id),
            Err(StoreError::DuplicateFrameNum(0))
        ));
    }

    #[test]
    fn complementary_fields_share_one_slot() {
        let sps = SpsBuilder::new()
            .profile_idc(Profile::High)
            .level_idc(Level::L3_1)
            .frame_mbs_only_flag(false)
            .resolution(64, 64)
            .max_num_ref_frames(2)
            .max_dec_frame_buffering(4)
            .build();
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        let top = dpb.new_picture(PictureStructure::TopField);
        {
            let pic = dpb.picture_mut(top).unwrap();
            pic.poc = 0;
            pic.top_poc = 0;
            pic.frame_num = 0;
            pic.used_for_reference = true;
        }
        dpb.store_picture(top).unwrap();
        assert_eq!(dpb.used_size(), 1);
        assert!(dpb.frame_stores()[0].is_partial_field());

        let bottom = dpb.new_picture(PictureStructure::BottomField);
        {
            let pic = dpb.picture_mut(bottom).unwrap();
            pic.poc = 1;
            pic.bottom_poc = 1;
            pic.frame_num = 0;
            pic.used_for_reference = true;
        }
        dpb.store_picture(bottom).unwrap();

        assert_eq!(dpb.used_size(), 1);
        assert!(dpb.frame_stores()[0].is_complete());

        dpb.flush().unwrap();
        let frame = dpb.bump_frame().unwrap().unwrap();
        assert_eq!(frame.poc, 0);
        assert!(dpb.bump_frame().unwrap().is_none());
    }

    #[test]
    fn used_size_and_reference_counts_stay_bounded() {
        let sps = sps_with_capacity(3, 2);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        for frame_num in 0..12 {
            store_frame(&mut dpb, frame_num * 2, frame_num, true);

            assert!(dpb.used_size() <= dpb.size());
            assert!(dpb.num_short_term_refs() + dpb.num_long_term_refs() <= dpb.size());
        }
    }

    #[test]
    fn non_existing_pictures_are_never_output() {
        let sps = sps_with_capacity(8, 3);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        store_frame(&mut dpb, 0, 0, true);

        // An inferred picture filling a frame_num gap.
        let gap = dpb.new_picture(PictureStructure::Frame);
        {
            let pic = dpb.picture_mut(gap).unwrap();
            pic.poc = 2;
            pic.frame_num = 1;
            pic.used_for_reference = true;
            pic.non_existing = true;
        }
        dpb.store_picture(gap).unwrap();

        store_frame(&mut dpb, 4, 2, true);

        dpb.flush().unwrap();
        let mut pocs = vec![];
        while let Some(frame) = dpb.bump_frame().unwrap() {
            pocs.push(frame.poc);
        }
        assert_eq!(pocs, vec![0, 4]);
    }

    #[test]
    fn arena_accounting_survives_a_full_session() {
        let _ = env_logger::try_init();

        let sps = sps_with_capacity(4, 2);
        let mut dpb = Dpb::new(&sps, 0).unwrap();

        for frame_num in 0..8 {
            store_frame(&mut dpb, frame_num * 2, frame_num, frame_num % 2 == 0);
        }
        dpb.flush().unwrap();
        while dpb.bump_frame().unwrap().is_some() {}

        assert!(dpb.is_empty());
        assert_eq!(dpb.arena().live_count(), 0);
        assert_eq!(dpb.arena().live_bytes(), 0);
    }
}
