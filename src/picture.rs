// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Storable pictures: the sample planes, motion data and reference metadata
//! of one decoded frame or field.

use crate::arena::PicRef;
use crate::marking::Marking;
use crate::sps::Sps;

/// Padding applied around the luma plane for the motion-compensation search
/// range.
pub const LUMA_PAD_X: usize = 32;
pub const LUMA_PAD_Y: usize = 12;
/// Chroma padding for 4:2:0; scaled up for the other formats.
pub const CHROMA_PAD_X: usize = 16;
pub const CHROMA_PAD_Y: usize = 8;

/// Motion vectors and reference indices are stored per 4x4 block.
pub const BLOCK_SIZE: usize = 4;

/// Upper bound of a reference picture list, including the slot reserved for
/// reordering.
pub const MAX_LIST_SIZE: usize = 33;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PictureStructure {
    #[default]
    Frame,
    TopField,
    BottomField,
}

impl PictureStructure {
    /// Returns the parity opposite to this one. A frame is its own opposite.
    pub fn opposite(self) -> Self {
        match self {
            PictureStructure::Frame => PictureStructure::Frame,
            PictureStructure::TopField => PictureStructure::BottomField,
            PictureStructure::BottomField => PictureStructure::TopField,
        }
    }

    pub fn is_field(self) -> bool {
        !matches!(self, PictureStructure::Frame)
    }
}

/// One padded sample plane. Rows are addressed in picture coordinates; the
/// padding borders surround them in memory.
#[derive(Clone)]
pub struct Plane {
    data: Vec<u8>,
    width: usize,
    height: usize,
    stride: usize,
    pad_x: usize,
    pad_y: usize,
}

impl Plane {
    pub fn new(width: usize, height: usize, pad_x: usize, pad_y: usize, fill: u8) -> Self {
        let stride = width + 2 * pad_x;
        let rows = height + 2 * pad_y;

        Self {
            data: vec![fill; stride * rows],
            width,
            height,
            stride,
            pad_x,
            pad_y,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pad_x(&self) -> usize {
        self.pad_x
    }

    pub fn pad_y(&self) -> usize {
        self.pad_y
    }

    /// One row of picture samples, without the padding borders.
    pub fn row(&self, y: usize) -> &[u8] {
        let start = (y + self.pad_y) * self.stride + self.pad_x;
        &self.data[start..start + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = (y + self.pad_y) * self.stride + self.pad_x;
        &mut self.data[start..start + self.width]
    }

    /// The whole buffer, padding included.
    pub fn padded_data(&self) -> &[u8] {
        &self.data
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    pub fn mem_bytes(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plane")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

/// Motion state of one 4x4 block: one vector and one reference index per
/// prediction list. An index of -1 means "not predicted from this list".
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockMotion {
    pub mv: [MotionVector; 2],
    pub ref_idx: [i8; 2],
}

impl Default for BlockMotion {
    fn default() -> Self {
        Self {
            mv: Default::default(),
            ref_idx: [-1, -1],
        }
    }
}

/// Per-4x4-block motion data of one picture.
#[derive(Clone)]
pub struct MotionGrid {
    blocks: Vec<BlockMotion>,
    /// Whether the macroblock covering the block was field-coded (MBAFF).
    mb_field: Vec<bool>,
    width: usize,
    height: usize,
}

impl MotionGrid {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            blocks: vec![Default::default(); width * height],
            mb_field: vec![false; width * height],
            width,
            height,
        }
    }

    /// Width in 4x4 blocks.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in 4x4 blocks.
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn block(&self, x: usize, y: usize) -> &BlockMotion {
        &self.blocks[y * self.width + x]
    }

    pub fn block_mut(&mut self, x: usize, y: usize) -> &mut BlockMotion {
        &mut self.blocks[y * self.width + x]
    }

    pub fn mb_field(&self, x: usize, y: usize) -> bool {
        self.mb_field[y * self.width + x]
    }

    pub fn set_mb_field(&mut self, x: usize, y: usize, value: bool) {
        self.mb_field[y * self.width + x] = value;
    }

    /// Copies one block row from `other`.
    pub fn copy_row_from(&mut self, y: usize, other: &MotionGrid, other_y: usize) {
        let dst = y * self.width;
        let src = other_y * other.width;
        let n = self.width.min(other.width);
        self.blocks[dst..dst + n].copy_from_slice(&other.blocks[src..src + n]);
        self.mb_field[dst..dst + n].copy_from_slice(&other.mb_field[src..src + n]);
    }

    pub fn mem_bytes(&self) -> usize {
        self.blocks.len() * std::mem::size_of::<BlockMotion>() + self.mb_field.len()
    }
}

impl std::fmt::Debug for MotionGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Tone-mapping side data carried from an SEI message to output time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToneMapping {
    pub coded_data_bit_depth: u8,
    pub target_bit_depth: u8,
    pub lut: Vec<u16>,
}

impl ToneMapping {
    pub fn mem_bytes(&self) -> usize {
        self.lut.len() * std::mem::size_of::<u16>()
    }
}

/// One decoded picture: a frame, or one field of an interlaced pair.
///
/// Pictures are created by the client decoder through the DPB, filled during
/// reconstruction, and handed back for storage once complete. The
/// `frame`/`top_field`/`bottom_field` links point at the other structure
/// kinds of the same frame store once fields are combined or a frame is
/// split; until then they resolve to the shared "no reference" picture.
#[derive(Debug)]
pub struct StorablePicture {
    pub structure: PictureStructure,

    pub luma: Plane,
    /// Cb and Cr planes; `None` for monochrome streams.
    pub chroma: Option<Box<[Plane; 2]>>,

    pub mv_info: MotionGrid,
    /// Motion mirrors for the three planes of a `separate_colour_plane_flag`
    /// stream.
    pub plane_mv_info: Option<Box<[MotionGrid; 3]>>,

    /// Picture order counts. For a frame, `poc` is the lower of the two field
    /// counts; a field only maintains its own.
    pub poc: i32,
    pub top_poc: i32,
    pub bottom_poc: i32,

    pub frame_num: i32,
    pub frame_num_wrap: i32,
    pub pic_num: i32,
    pub long_term_frame_idx: u32,
    pub long_term_pic_num: u32,

    pub used_for_reference: bool,
    pub is_long_term: bool,
    /// Inferred to fill a frame_num gap; contributes reference bookkeeping
    /// but never pixels or output.
    pub non_existing: bool,
    /// Whether the picture has been sent to the output consumer. Set once,
    /// never cleared.
    pub is_output: bool,

    pub is_idr: bool,
    pub no_output_of_prior_pics: bool,
    pub long_term_reference_flag: bool,
    pub marking: Marking,

    /// Whether this picture was coded as a frame.
    pub coded_frame: bool,
    pub mb_aff_frame: bool,

    pub view_id: i32,
    pub inter_view_flag: bool,
    pub anchor_pic_flag: bool,

    pub frame: PicRef,
    pub top_field: PicRef,
    pub bottom_field: PicRef,

    pub tone_mapping: Option<ToneMapping>,

    /// Per-field reference picture lists, allocated for field pictures of
    /// non-frame-only streams and populated by the slice decoder.
    pub field_ref_lists: Option<Box<[Vec<PicRef>; 2]>>,
}

impl StorablePicture {
    /// Allocates a picture sized for the active sequence parameters.
    ///
    /// Field pictures are allocated with half the frame height. Chroma
    /// padding follows the chroma format, so that the padded border covers
    /// the same sample area as the luma one.
    pub fn new(sps: &Sps, structure: PictureStructure) -> Self {
        let width = sps.width() as usize;
        let mut height = sps.height() as usize;

        let chroma_format = sps.chroma_format();
        let (width_cr, full_height_cr) = chroma_format.chroma_size(width, height);
        let mut height_cr = full_height_cr;

        if structure.is_field() {
            height /= 2;
            height_cr /= 2;
        }

        let (chroma_pad_x, chroma_pad_y) = match sps.chroma_format_idc {
            2 => (CHROMA_PAD_X, CHROMA_PAD_Y * 2),
            3 => (LUMA_PAD_X, LUMA_PAD_Y),
            _ => (CHROMA_PAD_X, CHROMA_PAD_Y),
        };

        let chroma = (width_cr > 0).then(|| {
            Box::new([
                Plane::new(width_cr, height_cr, chroma_pad_x, chroma_pad_y, 128),
                Plane::new(width_cr, height_cr, chroma_pad_x, chroma_pad_y, 128),
            ])
        });

        let blocks_x = width / BLOCK_SIZE;
        let blocks_y = height / BLOCK_SIZE;

        let plane_mv_info = sps.separate_colour_plane_flag.then(|| {
            Box::new([
                MotionGrid::new(blocks_x, blocks_y),
                MotionGrid::new(blocks_x, blocks_y),
                MotionGrid::new(blocks_x, blocks_y),
            ])
        });

        let field_ref_lists = (!sps.frame_mbs_only_flag && structure.is_field()).then(|| {
            Box::new([
                Vec::with_capacity(MAX_LIST_SIZE),
                Vec::with_capacity(MAX_LIST_SIZE),
            ])
        });

        Self {
            structure,
            luma: Plane::new(width, height, LUMA_PAD_X, LUMA_PAD_Y, 0),
            chroma,
            mv_info: MotionGrid::new(blocks_x, blocks_y),
            plane_mv_info,
            poc: 0,
            top_poc: 0,
            bottom_poc: 0,
            frame_num: 0,
            frame_num_wrap: 0,
            pic_num: 0,
            long_term_frame_idx: 0,
            long_term_pic_num: 0,
            used_for_reference: false,
            is_long_term: false,
            non_existing: false,
            is_output: false,
            is_idr: false,
            no_output_of_prior_pics: false,
            long_term_reference_flag: false,
            marking: Default::default(),
            coded_frame: matches!(structure, PictureStructure::Frame),
            mb_aff_frame: false,
            view_id: -1,
            inter_view_flag: false,
            anchor_pic_flag: false,
            frame: PicRef::Sentinel,
            top_field: PicRef::Sentinel,
            bottom_field: PicRef::Sentinel,
            tone_mapping: None,
            field_ref_lists,
        }
    }

    pub fn width(&self) -> usize {
        self.luma.width()
    }

    pub fn height(&self) -> usize {
        self.luma.height()
    }

    /// Whether the picture is a reference, either short or long term.
    pub fn is_ref(&self) -> bool {
        self.used_for_reference
    }

    pub fn is_short_term_ref(&self) -> bool {
        self.used_for_reference && !self.is_long_term
    }

    pub fn is_long_term_ref(&self) -> bool {
        self.used_for_reference && self.is_long_term
    }

    /// Total buffer bytes owned by this picture.
    pub fn mem_bytes(&self) -> usize {
        let chroma = self
            .chroma
            .as_ref()
            .map_or(0, |c| c[0].mem_bytes() + c[1].mem_bytes());
        let plane_mv = self
            .plane_mv_info
            .as_ref()
            .map_or(0, |g| g.iter().map(MotionGrid::mem_bytes).sum());
        let tone = self.tone_mapping.as_ref().map_or(0, ToneMapping::mem_bytes);

        self.luma.mem_bytes() + chroma + self.mv_info.mem_bytes() + plane_mv + tone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sps::SpsBuilder;

    #[test]
    fn frame_allocation_geometry() {
        let sps = SpsBuilder::new().resolution(320, 240).build();
        let pic = StorablePicture::new(&sps, PictureStructure::Frame);

        assert_eq!(pic.width(), 320);
        assert_eq!(pic.height(), 240);
        assert_eq!(pic.luma.stride(), 320 + 2 * LUMA_PAD_X);

        let chroma = pic.chroma.as_ref().unwrap();
        assert_eq!(chroma[0].width(), 160);
        assert_eq!(chroma[0].height(), 120);

        assert_eq!(pic.mv_info.width(), 80);
        assert_eq!(pic.mv_info.height(), 60);
        assert!(pic.field_ref_lists.is_none());
    }

    #[test]
    fn field_allocation_halves_height() {
        let sps = SpsBuilder::new()
            .frame_mbs_only_flag(false)
            .resolution(320, 256)
            .build();
        let pic = StorablePicture::new(&sps, PictureStructure::TopField);

        assert_eq!(pic.height(), 128);
        assert_eq!(pic.chroma.as_ref().unwrap()[0].height(), 64);
        assert_eq!(pic.mv_info.height(), 32);
        assert!(pic.field_ref_lists.is_some());
    }

    #[test]
    fn monochrome_has_no_chroma() {
        let sps = SpsBuilder::new()
            .chroma_format_idc(0)
            .resolution(64, 64)
            .build();
        let pic = StorablePicture::new(&sps, PictureStructure::Frame);

        assert!(pic.chroma.is_none());
    }

    #[test]
    fn default_block_motion_is_unpredicted() {
        let m = BlockMotion::default();
        assert_eq!(m.ref_idx, [-1, -1]);
        assert_eq!(m.mv[0], MotionVector::default());
    }

    #[test]
    fn plane_rows_are_unpadded() {
        let mut plane = Plane::new(16, 8, 4, 2, 0);
        plane.row_mut(0).fill(200);

        assert_eq!(plane.row(0).len(), 16);
        assert!(plane.row(0).iter().all(|&p| p == 200));
        assert!(plane.row(1).iter().all(|&p| p == 0));
        assert_eq!(plane.mem_bytes(), (16 + 8) * (8 + 4));
    }
}
