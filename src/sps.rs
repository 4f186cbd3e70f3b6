// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The slice of the active sequence parameter set consumed by the picture
//! buffer: level/profile codes for capacity computation, picture geometry for
//! allocation sizing, and the VUI buffering restrictions. Parsing these from
//! the bitstream is the client decoder's job.

use enumn::N;

use crate::ChromaFormat;
use crate::Point;
use crate::Rect;
use crate::Resolution;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    CavlcIntra = 44,
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
    MultiviewHigh = 118,
    StereoHigh = 128,
    High444P = 244,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// No level signaled; the stream is treated as unconstrained.
    L0 = 0,
    L1B = 9,
    #[default]
    L1 = 10,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// The bitstream-restriction fields of the VUI that constrain buffering.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub bitstream_restriction_flag: bool,

    /// Indicates an upper bound for the number of frames buffers that are
    /// required for reordering before output.
    pub max_num_reorder_frames: u32,

    /// Specifies the required size of the HRD decoded picture buffer in units
    /// of frame buffers. Overrides the level-derived DPB size when present.
    pub max_dec_frame_buffering: u32,
}

/// The sequence-parameter-set fields this layer reads.
///
/// A subset of the full SPS syntax structure: capacity inputs
/// (profile/level/VUI), allocation geometry, and the reference bookkeeping
/// parameters. `num_views` comes from the subset SPS for MVC streams and is 1
/// otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms.
    pub profile_idc: u8,

    /// Retains the same meaning as in the specification. See 7.4.2.1.1.
    pub constraint_set3_flag: bool,

    /// Level to which the coded video sequence conforms. Kept as the raw code
    /// so an undefined level surfaces when the capacity is computed.
    pub level_idc: u8,

    /// Specifies the chroma sampling relative to the luma sampling.
    pub chroma_format_idc: u8,

    /// Whether the three colour components of the 4:4:4 chroma format are
    /// coded separately.
    pub separate_colour_plane_flag: bool,

    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,

    /// Determines MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4), used for
    /// frame_num wrap derivations.
    pub log2_max_frame_num_minus4: u8,

    /// Specifies the method to decode picture order count.
    pub pic_order_cnt_type: u8,

    /// Maximum number of short-term and long-term reference frames,
    /// complementary reference field pairs, and non-paired reference fields.
    /// Also the size of the sliding window.
    pub max_num_ref_frames: u8,

    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Plus 1 specifies the width of each decoded picture in macroblocks.
    pub pic_width_in_mbs_minus1: u16,

    /// Plus 1 specifies the height in slice group map units of a decoded
    /// frame or field.
    pub pic_height_in_map_units_minus1: u16,

    /// Whether every coded picture of the sequence is a coded frame. If
    /// false, the sequence may contain coded fields.
    pub frame_mbs_only_flag: bool,

    pub mb_adaptive_frame_field_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,

    /// Number of coded views. 1 unless an MVC profile is in use.
    pub num_views: u32,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: 0,
            profile_idc: 0,
            constraint_set3_flag: false,
            level_idc: 0,
            chroma_format_idc: 1,
            separate_colour_plane_flag: false,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            max_num_ref_frames: 0,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            frame_cropping_flag: false,
            frame_crop_left_offset: 0,
            frame_crop_right_offset: 0,
            frame_crop_top_offset: 0,
            frame_crop_bottom_offset: 0,
            vui_parameters_present_flag: false,
            vui_parameters: Default::default(),
            num_views: 1,
        }
    }
}

impl Sps {
    /// Returns the coded width of the stream.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    pub const fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }

    /// Size of one coded frame in macroblocks. Field-coded sequences count
    /// both fields, so this is the frame size regardless of coding mode.
    pub const fn pic_size_in_mbs(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1)
            * (self.pic_height_in_map_units_minus1 as u32 + 1)
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Same as MaxFrameNum. See 7-10 in the specification.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// The sample format pictures are stored in. Streams with separately
    /// coded colour planes still carry three 4:4:4 planes.
    pub fn chroma_format(&self) -> ChromaFormat {
        ChromaFormat::from_chroma_format_idc(self.chroma_format_idc)
    }

    /// Returns `ChromaArrayType`, as computed in the specification.
    pub const fn chroma_array_type(&self) -> u8 {
        match self.separate_colour_plane_flag {
            false => self.chroma_format_idc,
            true => 0,
        }
    }

    /// Whether the profile is one of the FRExt family. Level 1b signaling
    /// depends on this.
    pub fn is_frext_profile(&self) -> bool {
        matches!(self.profile_idc, 44 | 100 | 110 | 122 | 244)
    }

    /// Whether the stream uses one of the multiview profiles.
    pub fn is_multiview_profile(&self) -> bool {
        self.profile_idc == Profile::MultiviewHigh as u8
            || self.profile_idc == Profile::StereoHigh as u8
    }

    /// Returns `SubWidthC` and `SubHeightC`. See table 6-1.
    fn sub_width_height_c(&self) -> (u32, u32) {
        match (self.chroma_format_idc, self.separate_colour_plane_flag) {
            (1, false) => (2, 2),
            (2, false) => (2, 1),
            (3, false) => (1, 1),
            // undefined.
            _ => (1, 1),
        }
    }

    /// Returns `CropUnitX` and `CropUnitY`. See 7-19 through 7-22.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        match self.chroma_array_type() {
            0 => (1, 2 - u32::from(self.frame_mbs_only_flag)),
            _ => {
                let (sub_width_c, sub_height_c) = self.sub_width_height_c();
                (
                    sub_width_c,
                    sub_height_c * (2 - u32::from(self.frame_mbs_only_flag)),
                )
            }
        }
    }

    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.frame_cropping_flag {
            return Rect {
                min: Point { x: 0, y: 0 },
                max: Point {
                    x: self.width(),
                    y: self.height(),
                },
            };
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        let crop_left = crop_unit_x * self.frame_crop_left_offset;
        let crop_right = crop_unit_x * self.frame_crop_right_offset;
        let crop_top = crop_unit_y * self.frame_crop_top_offset;
        let crop_bottom = crop_unit_y * self.frame_crop_bottom_offset;

        Rect {
            min: Point {
                x: crop_left,
                y: crop_top,
            },
            max: Point {
                x: self.width() - crop_left - crop_right,
                y: self.height() - crop_top - crop_bottom,
            },
        }
    }
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn profile_idc(mut self, value: Profile) -> Self {
        self.0.profile_idc = value as u8;
        self
    }

    pub fn constraint_set3_flag(mut self, value: bool) -> Self {
        self.0.constraint_set3_flag = value;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value as u8;
        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn separate_colour_plane_flag(mut self, value: bool) -> Self {
        self.0.separate_colour_plane_flag = value;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn gaps_in_frame_num_value_allowed_flag(mut self, value: bool) -> Self {
        self.0.gaps_in_frame_num_value_allowed_flag = value;
        self
    }

    /// Must be called before [`SpsBuilder::resolution`] to size the map units
    /// correctly for field coding.
    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn mb_adaptive_frame_field_flag(mut self, value: bool) -> Self {
        self.0.mb_adaptive_frame_field_flag = value;
        self
    }

    pub fn frame_crop_offsets(mut self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        self.0.frame_cropping_flag = true;
        self.0.frame_crop_top_offset = top;
        self.0.frame_crop_bottom_offset = bottom;
        self.0.frame_crop_left_offset = left;
        self.0.frame_crop_right_offset = right;
        self
    }

    pub fn frame_crop(self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        let sub_width_c = if self.0.chroma_format_idc > 2 { 1 } else { 2 };
        let sub_height_c = if self.0.chroma_format_idc > 1 { 1 } else { 2 };

        let crop_unit_x = sub_width_c;
        let crop_unit_y = sub_height_c * (if self.0.frame_mbs_only_flag { 1 } else { 2 });

        self.frame_crop_offsets(
            top / crop_unit_y,
            bottom / crop_unit_y,
            left / crop_unit_x,
            right / crop_unit_x,
        )
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        const MB_SIZE: u32 = 16;

        let mb_width = (width + MB_SIZE - 1) / MB_SIZE;
        let mut mb_height = (height + MB_SIZE - 1) / MB_SIZE;

        // Field coding addresses macroblock pairs; align to one.
        if !self.0.frame_mbs_only_flag {
            mb_height = (mb_height + 1) & !1;
        }

        self.0.pic_width_in_mbs_minus1 = (mb_width - 1) as u16;
        let map_units = mb_height / (2 - self.0.frame_mbs_only_flag as u32);
        self.0.pic_height_in_map_units_minus1 = (map_units - 1) as u16;

        let compressed_width = mb_width * MB_SIZE;
        let compressed_height = mb_height * MB_SIZE;

        if compressed_width != width || compressed_height != height {
            self = self.frame_crop(0, compressed_height - height, 0, compressed_width - width);
        }

        self
    }

    pub fn max_dec_frame_buffering(mut self, value: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_dec_frame_buffering = value;
        self
    }

    pub fn max_num_reorder_frames(mut self, value: u32) -> Self {
        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters.bitstream_restriction_flag = true;
        self.0.vui_parameters.max_num_reorder_frames = value;
        self
    }

    pub fn num_views(mut self, value: u32) -> Self {
        self.0.num_views = value;
        self
    }

    pub fn build(self) -> Sps {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_rounds_up_and_crops() {
        let sps = SpsBuilder::new()
            .resolution(1920, 1080)
            .build();

        assert_eq!(sps.pic_width_in_mbs_minus1, 119);
        assert_eq!(sps.pic_height_in_map_units_minus1, 67);
        assert_eq!(sps.width(), 1920);
        assert_eq!(sps.height(), 1088);
        assert_eq!(sps.pic_size_in_mbs(), 8160);

        let rect = sps.visible_rectangle();
        assert_eq!(rect.min, Point { x: 0, y: 0 });
        assert_eq!(rect.max, Point { x: 1920, y: 1080 });
    }

    #[test]
    fn interlaced_map_units() {
        let sps = SpsBuilder::new()
            .frame_mbs_only_flag(false)
            .resolution(1920, 1088)
            .build();

        // 68 macroblock rows, 34 map units of field macroblock pairs.
        assert_eq!(sps.pic_height_in_map_units_minus1, 33);
        assert_eq!(sps.height(), 1088);
        assert_eq!(sps.pic_size_in_mbs(), 8160);
    }

    #[test]
    fn level_codes_map() {
        assert_eq!(Level::n(31), Some(Level::L3_1));
        assert_eq!(Level::n(9), Some(Level::L1B));
        assert_eq!(Level::n(15), None);
    }

    #[test]
    fn chroma_sizes() {
        assert_eq!(ChromaFormat::Yuv420.chroma_size(1920, 1088), (960, 544));
        assert_eq!(ChromaFormat::Yuv422.chroma_size(1920, 1088), (960, 1088));
        assert_eq!(ChromaFormat::Monochrome.chroma_size(1920, 1088), (0, 0));
    }
}
