// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-picture marking directives, decoded from the
//! `dec_ref_pic_marking` slice-header syntax by the client and applied by the
//! DPB when the picture is stored.

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an
/// unsigned integer with a special value indicating "no long-term frame
/// indices". This type allows easy conversion between the actual and "plus1"
/// representation, while ensuring that the special value is always handled by
/// the code.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value to the representation used by
    /// `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }
}

impl PartialEq<u32> for MaxLongTermFrameIdx {
    fn eq(&self, other: &u32) -> bool {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => false,
            MaxLongTermFrameIdx::Idx(idx) => idx.eq(other),
        }
    }
}

impl PartialOrd<u32> for MaxLongTermFrameIdx {
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        match self {
            MaxLongTermFrameIdx::NoLongTermFrameIndices => Some(std::cmp::Ordering::Less),
            MaxLongTermFrameIdx::Idx(idx) => Some(idx.cmp(other)),
        }
    }
}

/// One memory management control operation, Table 7-9.
///
/// The numeric `memory_management_control_operation` codes and the syntax
/// elements that trail each of them are folded into one variant per
/// operation, so a directive can never carry fields its operation does not
/// use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmcoOp {
    /// Op 1: mark a short-term reference picture, addressed by
    /// `difference_of_pic_nums_minus1`, as unused for reference.
    UnmarkShortTerm { difference_of_pic_nums_minus1: u32 },

    /// Op 2: mark the long-term reference picture with this
    /// `long_term_pic_num` as unused for reference.
    UnmarkLongTerm { long_term_pic_num: u32 },

    /// Op 3: assign `long_term_frame_idx` to the short-term reference picture
    /// addressed by `difference_of_pic_nums_minus1`.
    AssignLongTermIdx {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },

    /// Op 4: set the maximum long-term frame index; long-term references
    /// above it become unused.
    SetMaxLongTermIdx {
        max_long_term_frame_idx: MaxLongTermFrameIdx,
    },

    /// Op 5: mark all reference pictures as unused and reset the buffer
    /// ("clear all references").
    UnmarkAll,

    /// Op 6: assign `long_term_frame_idx` to the current picture.
    MarkCurrentLongTerm { long_term_frame_idx: u32 },
}

/// How the reference status of previously-decoded pictures changes when a
/// reference picture is stored, Table 7-8.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Marking {
    /// First-in-first-out removal of the oldest short-term reference once the
    /// signaled reference count is reached.
    #[default]
    SlidingWindow,

    /// Explicit memory management control operations, applied in order.
    Adaptive(Vec<MmcoOp>),
}

impl Marking {
    pub fn is_adaptive(&self) -> bool {
        matches!(self, Marking::Adaptive(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_long_term_frame_idx_plus1_round_trip() {
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(0),
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(3),
            MaxLongTermFrameIdx::Idx(2)
        );
        assert_eq!(MaxLongTermFrameIdx::Idx(2).to_value_plus1(), 3);
        assert_eq!(
            MaxLongTermFrameIdx::NoLongTermFrameIndices.to_value_plus1(),
            0
        );
    }

    #[test]
    fn max_long_term_frame_idx_compares_below_everything_when_unset() {
        assert!(MaxLongTermFrameIdx::NoLongTermFrameIndices < 0);
        assert!(MaxLongTermFrameIdx::Idx(1) < 2);
        assert!(MaxLongTermFrameIdx::Idx(2) == 2);
    }
}
