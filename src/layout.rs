//! Mapping between logical tensor indices and linear storage offsets.
//!
//! Every tensor carries a [`LayoutTag`] which fixes the physical order of its
//! axes in memory. Accessors for logical axis sizes invert the tag's
//! permutation, so a transposed tensor still reports the same logical extents
//! while its offsets follow the new physical order. The functions in this
//! module are pure; ownership of storage is handled in
//! [`tensor`](crate::tensor).

/// A logical tensor axis.
///
/// The 4-axis family (batch, head, sequence, dimension) is used for
/// transformer activations and weights. The 5-axis family (batch, channel,
/// time, height, width) is used for vision inputs. A tensor belongs to
/// exactly one family, determined by its [`LayoutTag`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Axis {
    Batch,
    Head,
    Sequence,
    Dimension,
    Channel,
    Time,
    Height,
    Width,
    /// The combined time/height/width block, used only in layout transform
    /// requests for the 5-axis family.
    Thw,
}

/// Physical ordering of a tensor's axes in memory.
///
/// The tag name lists the axes in their physical (outermost first) order.
/// `Bshd` is the default for the 4-axis family and `Bcthw` for the 5-axis
/// family.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LayoutTag {
    /// batch, sequence, head, dimension
    #[default]
    Bshd,
    /// batch, head, dimension, sequence
    Bhds,
    /// sequence, batch, head, dimension
    Sbhd,
    /// batch, channel, time, height, width
    Bcthw,
    /// batch, time, height, width, channel
    Bthwc,
}

impl LayoutTag {
    /// Return true if this tag belongs to the 5-axis
    /// (batch/channel/time/height/width) family.
    pub fn is_five_axis(self) -> bool {
        matches!(self, LayoutTag::Bcthw | LayoutTag::Bthwc)
    }

    /// Return the physical shape slot holding the logical size of `axis`, or
    /// `None` if the axis does not belong to this tag's family.
    pub fn axis_position(self, axis: Axis) -> Option<usize> {
        use Axis::*;
        use LayoutTag::*;
        let pos = match (self, axis) {
            (Bshd, Batch) => 0,
            (Bshd, Sequence) => 1,
            (Bshd, Head) => 2,
            (Bshd, Dimension) => 3,
            (Bhds, Batch) => 0,
            (Bhds, Head) => 1,
            (Bhds, Dimension) => 2,
            (Bhds, Sequence) => 3,
            (Sbhd, Sequence) => 0,
            (Sbhd, Batch) => 1,
            (Sbhd, Head) => 2,
            (Sbhd, Dimension) => 3,
            (Bcthw, Batch) => 0,
            (Bcthw, Channel) => 1,
            (Bcthw, Time) => 2,
            (Bcthw, Height) => 3,
            (Bcthw, Width) => 4,
            (Bthwc, Batch) => 0,
            (Bthwc, Time) => 1,
            (Bthwc, Height) => 2,
            (Bthwc, Width) => 3,
            (Bthwc, Channel) => 4,
            _ => return None,
        };
        Some(pos)
    }

    /// Map logical (batch, head, sequence, dimension) extents to physical
    /// shape order.
    ///
    /// Panics if this tag is not in the 4-axis family.
    pub fn physical_shape_4(self, logical: [usize; 4]) -> [usize; 4] {
        let [b, h, s, d] = logical;
        match self {
            LayoutTag::Bshd => [b, s, h, d],
            LayoutTag::Bhds => [b, h, d, s],
            LayoutTag::Sbhd => [s, b, h, d],
            _ => panic!("layout {:?} does not have batch/head/sequence/dimension axes", self),
        }
    }

    /// Map logical (batch, channel, time, height, width) extents to physical
    /// shape order.
    ///
    /// Panics if this tag is not in the 5-axis family.
    pub fn physical_shape_5(self, logical: [usize; 5]) -> [usize; 5] {
        let [b, c, t, h, w] = logical;
        match self {
            LayoutTag::Bcthw => [b, c, t, h, w],
            LayoutTag::Bthwc => [b, t, h, w, c],
            _ => panic!("layout {:?} does not have channel/time/height/width axes", self),
        }
    }

    /// Return the tag that results from transposing `axis_a` and `axis_b`,
    /// or `None` if the combination is not a supported transition.
    ///
    /// Supported pairs toggle between two tags, so applying the same pair
    /// twice returns to the original layout:
    ///
    /// - (Sequence, Dimension): `Bshd` ⇄ `Bhds`
    /// - (Batch, Sequence): `Bshd` ⇄ `Sbhd`
    /// - (Thw, Channel): `Bcthw` ⇄ `Bthwc`
    pub fn transposed(self, axis_a: Axis, axis_b: Axis) -> Option<LayoutTag> {
        use Axis::*;
        use LayoutTag::*;
        match (axis_a, axis_b, self) {
            (Sequence, Dimension, Bshd) => Some(Bhds),
            (Sequence, Dimension, Bhds) => Some(Bshd),
            (Batch, Sequence, Bshd) => Some(Sbhd),
            (Batch, Sequence, Sbhd) => Some(Bshd),
            (Thw, Channel, Bcthw) => Some(Bthwc),
            (Thw, Channel, Bthwc) => Some(Bcthw),
            _ => None,
        }
    }
}

/// Read a physical shape entry, treating missing trailing axes as size 1.
///
/// This lets 4-axis indexing work on tensors created from shorter shape
/// sequences (eg. a `[rows, cols]` weight matrix addressed as batch/sequence).
pub fn dim_or_one(shape: &[usize], index: usize) -> usize {
    shape.get(index).copied().unwrap_or(1)
}

/// Map a logical (batch, head, sequence, dimension) index to a linear element
/// offset for a tensor with the given tag and physical shape.
///
/// Panics if `tag` is not in the 4-axis family.
pub fn offset_4d(tag: LayoutTag, shape: &[usize], index: [usize; 4]) -> usize {
    let [b, h, s, d] = index;
    let e = |i| dim_or_one(shape, i);
    match tag {
        LayoutTag::Bshd => ((b * e(1) + s) * e(2) + h) * e(3) + d,
        LayoutTag::Bhds => ((b * e(1) + h) * e(2) + d) * e(3) + s,
        LayoutTag::Sbhd => ((s * e(1) + b) * e(2) + h) * e(3) + d,
        _ => panic!("layout {:?} cannot be indexed with batch/head/sequence/dimension", tag),
    }
}

/// Map a child tensor's logical index to an offset in its master's storage.
///
/// `master_extents` is the master's logical (batch, head, sequence,
/// dimension) shape recorded at bind time and `axis_offset` the child's
/// per-axis start within it. Each index wraps modulo the master extent, which
/// implements broadcast/repeat addressing: a small child index space aliases
/// cyclically over a larger master extent.
pub fn offset_4d_windowed(
    tag: LayoutTag,
    master_extents: [usize; 4],
    axis_offset: [usize; 4],
    index: [usize; 4],
) -> usize {
    let [mb, mh, ms, md] = master_extents;
    let b = (index[0] + axis_offset[0]) % mb;
    let h = (index[1] + axis_offset[1]) % mh;
    let s = (index[2] + axis_offset[2]) % ms;
    let d = (index[3] + axis_offset[3]) % md;
    match tag {
        LayoutTag::Bshd => ((b * ms + s) * mh + h) * md + d,
        LayoutTag::Bhds => ((b * mh + h) * md + d) * ms + s,
        LayoutTag::Sbhd => ((s * mb + b) * mh + h) * md + d,
        _ => panic!("layout {:?} cannot be indexed with batch/head/sequence/dimension", tag),
    }
}

/// Map a logical (batch, channel, time, height, width) index to a linear
/// element offset.
///
/// Panics if `tag` is not in the 5-axis family.
pub fn offset_5d(tag: LayoutTag, shape: &[usize], index: [usize; 5]) -> usize {
    let [b, c, t, h, w] = index;
    let e = |i| dim_or_one(shape, i);
    match tag {
        LayoutTag::Bcthw => (((b * e(1) + c) * e(2) + t) * e(3) + h) * e(4) + w,
        LayoutTag::Bthwc => (((b * e(1) + t) * e(2) + h) * e(3) + w) * e(4) + c,
        _ => panic!("layout {:?} cannot be indexed with channel/time/height/width", tag),
    }
}
