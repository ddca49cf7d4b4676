//! The tensor entity and the arena that owns every tensor's storage graph.
//!
//! Tensors are entries in a [`TensorArena`] addressed by [`TensorId`]. An
//! entry is exactly one of:
//!
//! - an *owner*, holding its own aligned host buffer,
//! - a *view* (child), aliasing a master entry's buffer with an optional
//!   per-axis offset and modular wraparound addressing,
//! - a *join* (aggregate), a logical concatenation of component entries
//!   along one axis, presented through a single index space.
//!
//! Views and joins store ids rather than pointers, so the ownership graph is
//! checkable: binding or aggregating rejects cycles, a buffer is released
//! exactly once by its owner, and reading through a view whose master has
//! been released panics instead of touching freed memory.

use std::mem;
use std::num::NonZero;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::dtype::{DataType, Element};
use crate::errors::UnsupportedTransform;
use crate::layout::{self, dim_or_one, Axis, LayoutTag};
use crate::storage::{Alloc, HostBuffer, SystemAlloc};

/// ID of a tensor in a [`TensorArena`].
///
/// Tensor IDs are u32 values <= `i32::MAX`.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TensorId(NonZero<u32>);

impl TensorId {
    /// Return the underlying u32 value of the ID.
    pub fn as_u32(self) -> u32 {
        self.0.get() - 1
    }

    /// Return the underlying ID value as a usize, for slice indexing.
    pub fn as_usize(self) -> usize {
        self.as_u32() as usize
    }

    /// Construct a tensor ID from a u32 value.
    ///
    /// Panics if the value exceeds `i32::MAX`.
    pub fn from_u32(value: u32) -> TensorId {
        assert!(value <= i32::MAX as u32);

        // Valid IDs are in the range `[0, i32::MAX]`, so we store them as
        // values in `[1, i32::MAX + 1]` internally and reserve 0 as a niche to
        // make `Option<TensorId>` the same size as `TensorId`.
        TensorId(unsafe {
            // Safety: `value + 1` cannot be zero
            NonZero::new_unchecked(value + 1)
        })
    }
}

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_u32().fmt(f)
    }
}

impl std::fmt::Debug for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TensorId({})", self.as_u32())
    }
}

/// Axis along which components of an aggregate tensor are joined.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum JoinAxis {
    Head,
    Sequence,
    Dimension,
    /// Flattened dimension index split as (head, component, dimension).
    ///
    /// Every component must have identical head and dimension extents.
    DimHeads,
    /// Flattened dimension index split as (component, head, dimension).
    ///
    /// Every component must have identical head and dimension extents.
    HeadDims,
}

/// Shape storage. 5 inline entries covers both axis families.
type Shape = SmallVec<[usize; 5]>;

/// Storage relationship of one tensor entry.
enum TensorVariant {
    /// The entry owns its buffer and is solely responsible for releasing it.
    Owner { buffer: Option<HostBuffer> },

    /// The entry aliases `master`'s buffer.
    ///
    /// When `axis_offset` is set, `master_shape` holds the master's logical
    /// (batch, head, sequence, dimension) extents recorded at bind time and
    /// indexing wraps modulo those extents (see
    /// [`offset_4d_windowed`](crate::layout::offset_4d_windowed)).
    View {
        master: TensorId,
        axis_offset: Option<[usize; 4]>,
        master_shape: Option<[usize; 4]>,
    },

    /// The entry is a logical concatenation of `components` along `axis`.
    ///
    /// `splits` holds cumulative component sizes along the join axis; it is
    /// empty for the interleaved modes, which route by division instead.
    Joined {
        components: Vec<TensorId>,
        axis: JoinAxis,
        splits: Vec<usize>,
    },
}

struct TensorEntry {
    name: Option<String>,
    dtype: DataType,
    tag: LayoutTag,
    shape: Shape,
    count: usize,
    /// Largest count this entry has ever reached. Grow-only, so repeated
    /// reshapes to smaller sizes never reallocate.
    capacity: usize,
    transposed: bool,
    undiffused: bool,
    children: Vec<TensorId>,
    variant: TensorVariant,
}

impl TensorEntry {
    fn new(tag: LayoutTag) -> TensorEntry {
        TensorEntry {
            name: None,
            dtype: DataType::F32,
            tag,
            shape: Shape::new(),
            count: 0,
            capacity: 0,
            transposed: false,
            undiffused: false,
            children: Vec::new(),
            variant: TensorVariant::Owner { buffer: None },
        }
    }
}

/// Locate the component owning `index` in a prefix-sum table and return the
/// component position together with the index local to it.
fn split_index(splits: &[usize], index: usize) -> (usize, usize) {
    for (i, &cumulative) in splits.iter().enumerate() {
        if index < cumulative {
            let start = if i == 0 { 0 } else { splits[i - 1] };
            return (i, index - start);
        }
    }
    panic!("index {} is outside the aggregated range {:?}", index, splits);
}

/// Arena owning a graph of tensors and the allocator backing their buffers.
///
/// All tensor operations are methods on the arena taking a [`TensorId`]. The
/// arena provides no internal locking; callers must serialize writes with
/// other access to the same buffer, including across every view and
/// aggregate component that aliases it.
pub struct TensorArena {
    entries: Vec<TensorEntry>,
    alloc: Arc<dyn Alloc>,
}

impl Default for TensorArena {
    fn default() -> TensorArena {
        TensorArena::new()
    }
}

impl TensorArena {
    /// Create an arena that allocates through [`SystemAlloc`].
    pub fn new() -> TensorArena {
        TensorArena::with_alloc(Arc::new(SystemAlloc))
    }

    /// Create an arena that allocates through a custom backend.
    pub fn with_alloc(alloc: Arc<dyn Alloc>) -> TensorArena {
        TensorArena {
            entries: Vec::new(),
            alloc,
        }
    }

    fn entry(&self, id: TensorId) -> &TensorEntry {
        &self.entries[id.as_usize()]
    }

    fn entry_mut(&mut self, id: TensorId) -> &mut TensorEntry {
        &mut self.entries[id.as_usize()]
    }

    fn push_entry(&mut self, tag: LayoutTag) -> TensorId {
        let id = TensorId::from_u32(self.entries.len() as u32);
        self.entries.push(TensorEntry::new(tag));
        id
    }

    fn display_name(&self, id: TensorId) -> String {
        match &self.entry(id).name {
            Some(name) => name.clone(),
            None => format!("#{}", id),
        }
    }

    /// Create a 4-axis tensor with logical extents
    /// (batch, head, sequence, dimension) and the default `Bshd` layout.
    pub fn create(
        &mut self,
        batch: usize,
        head: usize,
        sequence: usize,
        dimension: usize,
    ) -> TensorId {
        let id = self.push_entry(LayoutTag::Bshd);
        self.reshape(id, batch, head, sequence, dimension);
        id
    }

    /// Create a 5-axis tensor with logical extents
    /// (batch, channel, time, height, width) and the default `Bcthw` layout.
    pub fn create_5d(
        &mut self,
        batch: usize,
        channel: usize,
        time: usize,
        height: usize,
        width: usize,
    ) -> TensorId {
        let id = self.push_entry(LayoutTag::Bcthw);
        self.reshape_5d(id, batch, channel, time, height, width);
        id
    }

    /// Create a tensor whose physical shape is `shape` verbatim, under the
    /// default `Bshd` layout. Used to mirror another tensor's shape.
    pub fn create_from_shape(&mut self, shape: &[usize]) -> TensorId {
        let id = self.push_entry(LayoutTag::Bshd);
        self.set_shape(id, shape);
        id
    }

    /// Replace the shape and recompute the element count.
    ///
    /// Capacity only grows. Returns true if the new count exceeds the
    /// previous capacity, meaning the caller must [`alloc`](Self::alloc)
    /// before accessing elements; otherwise the existing buffer is kept
    /// untouched (it is neither zeroed nor shrunk).
    fn set_shape(&mut self, id: TensorId, shape: &[usize]) -> bool {
        let mut count: usize = 1;
        for &size in shape {
            count = count
                .checked_mul(size)
                .expect("tensor element count overflows");
            assert!(
                count <= i32::MAX as usize,
                "tensor shape {:?} exceeds the supported element count",
                shape
            );
        }
        let entry = self.entry_mut(id);
        entry.shape = SmallVec::from_slice(shape);
        entry.count = count;
        if count > entry.capacity {
            entry.capacity = count;
            true
        } else {
            false
        }
    }

    /// Reshape a 4-axis tensor by its logical extents.
    ///
    /// Returns true if the tensor must be reallocated (see
    /// [`set_shape`](Self::set_shape) semantics).
    pub fn reshape(
        &mut self,
        id: TensorId,
        batch: usize,
        head: usize,
        sequence: usize,
        dimension: usize,
    ) -> bool {
        let tag = self.entry(id).tag;
        assert!(
            !tag.is_five_axis(),
            "tensor {} has layout {:?}; use reshape_5d",
            self.display_name(id),
            tag
        );
        let physical = tag.physical_shape_4([batch, head, sequence, dimension]);
        self.set_shape(id, &physical)
    }

    /// Reshape a 5-axis tensor by its logical extents.
    pub fn reshape_5d(
        &mut self,
        id: TensorId,
        batch: usize,
        channel: usize,
        time: usize,
        height: usize,
        width: usize,
    ) -> bool {
        let tag = self.entry(id).tag;
        assert!(
            tag.is_five_axis(),
            "tensor {} has layout {:?}; use reshape",
            self.display_name(id),
            tag
        );
        let physical = tag.physical_shape_5([batch, channel, time, height, width]);
        self.set_shape(id, &physical)
    }

    /// Set the data type and, for owner tensors, (re)allocate the buffer at
    /// the current capacity.
    ///
    /// Any previously owned buffer is released first. Views alias their
    /// master's storage and aggregates forward to their components, so for
    /// those only the data type is recorded.
    pub fn alloc(&mut self, id: TensorId, dtype: DataType) {
        self.entry_mut(id).dtype = dtype;
        let capacity = self.entry(id).capacity;
        let alloc = self.alloc.clone();
        if let TensorVariant::Owner { buffer } = &mut self.entry_mut(id).variant {
            *buffer = None;
            *buffer = Some(HostBuffer::new(
                alloc,
                dtype.buffer_size(capacity),
                dtype.alignment(),
            ));
        }
    }

    /// Release an owner tensor's buffer.
    ///
    /// No-op for views (children never own the buffer they reference) and
    /// for aggregates (they have no buffer).
    pub fn release(&mut self, id: TensorId) {
        if let TensorVariant::Owner { buffer } = &mut self.entry_mut(id).variant {
            *buffer = None;
        }
    }

    /// Return true if element storage is reachable from this tensor: an
    /// owner with a live buffer, a view whose master is allocated, or an
    /// aggregate whose components all are.
    pub fn is_allocated(&self, id: TensorId) -> bool {
        match &self.entry(id).variant {
            TensorVariant::Owner { buffer } => buffer.is_some(),
            TensorVariant::View { master, .. } => self.is_allocated(*master),
            TensorVariant::Joined { components, .. } => {
                !components.is_empty() && components.iter().all(|&c| self.is_allocated(c))
            }
        }
    }

    /// Walk the master chain to the entry that provides this tensor's
    /// storage.
    fn owner_of(&self, id: TensorId) -> TensorId {
        let mut current = id;
        loop {
            match self.entry(current).variant {
                TensorVariant::View { master, .. } => current = master,
                _ => return current,
            }
        }
    }

    fn buffer(&self, id: TensorId) -> &HostBuffer {
        let owner = self.owner_of(id);
        match &self.entry(owner).variant {
            TensorVariant::Owner { buffer } => buffer
                .as_ref()
                .unwrap_or_else(|| panic!("tensor {} is not allocated", self.display_name(owner))),
            _ => panic!(
                "aggregate tensor {} has no buffer of its own",
                self.display_name(owner)
            ),
        }
    }

    fn buffer_mut(&mut self, id: TensorId) -> &mut HostBuffer {
        let owner = self.owner_of(id);
        let label = self.display_name(owner);
        match &mut self.entries[owner.as_usize()].variant {
            TensorVariant::Owner { buffer } => buffer
                .as_mut()
                .unwrap_or_else(|| panic!("tensor {} is not allocated", label)),
            _ => panic!("aggregate tensor {} has no buffer of its own", label),
        }
    }

    // Shape introspection.

    fn logical_axis(&self, id: TensorId, axis: Axis) -> usize {
        let entry = self.entry(id);
        let pos = entry.tag.axis_position(axis).unwrap_or_else(|| {
            panic!(
                "tensor {} with layout {:?} has no {:?} axis",
                self.display_name(id),
                entry.tag,
                axis
            )
        });
        dim_or_one(&entry.shape, pos)
    }

    /// Return the logical batch size. Valid for both axis families.
    pub fn batch(&self, id: TensorId) -> usize {
        self.logical_axis(id, Axis::Batch)
    }

    /// Return the logical head count. Panics for 5-axis tensors.
    pub fn head(&self, id: TensorId) -> usize {
        self.logical_axis(id, Axis::Head)
    }

    /// Return the logical sequence length. Panics for 5-axis tensors.
    pub fn sequence(&self, id: TensorId) -> usize {
        self.logical_axis(id, Axis::Sequence)
    }

    /// Return the logical hidden dimension. Panics for 5-axis tensors.
    pub fn dimension(&self, id: TensorId) -> usize {
        self.logical_axis(id, Axis::Dimension)
    }

    /// Return the logical channel count. Panics for 4-axis tensors.
    pub fn channel(&self, id: TensorId) -> usize {
        self.logical_axis(id, Axis::Channel)
    }

    /// Return the logical time extent. Panics for 4-axis tensors.
    pub fn time(&self, id: TensorId) -> usize {
        self.logical_axis(id, Axis::Time)
    }

    /// Return the logical height. Panics for 4-axis tensors.
    pub fn height(&self, id: TensorId) -> usize {
        self.logical_axis(id, Axis::Height)
    }

    /// Return the logical width. Panics for 4-axis tensors.
    pub fn width(&self, id: TensorId) -> usize {
        self.logical_axis(id, Axis::Width)
    }

    fn logical_4(&self, id: TensorId) -> [usize; 4] {
        [
            self.batch(id),
            self.head(id),
            self.sequence(id),
            self.dimension(id),
        ]
    }

    fn logical_5(&self, id: TensorId) -> [usize; 5] {
        [
            self.batch(id),
            self.channel(id),
            self.time(id),
            self.height(id),
            self.width(id),
        ]
    }

    /// Return the total element count, the product of all shape entries.
    pub fn count(&self, id: TensorId) -> usize {
        self.entry(id).count
    }

    /// Return the number of physical axes.
    pub fn num_axes(&self, id: TensorId) -> usize {
        self.entry(id).shape.len()
    }

    /// Return the physical shape, in the order dictated by the layout tag.
    pub fn shape(&self, id: TensorId) -> &[usize] {
        &self.entry(id).shape
    }

    /// Return the number of bytes the tensor's buffer occupies, based on its
    /// capacity (which may exceed the current count after a shrinking
    /// reshape).
    pub fn byte_size(&self, id: TensorId) -> usize {
        let entry = self.entry(id);
        entry.dtype.buffer_size(entry.capacity)
    }

    /// Return the number of bytes covered by the current element count.
    pub fn count_byte_size(&self, id: TensorId) -> usize {
        let entry = self.entry(id);
        entry.dtype.buffer_size(entry.count)
    }

    /// Return the tensor's data type.
    pub fn dtype(&self, id: TensorId) -> DataType {
        self.entry(id).dtype
    }

    /// Return the tensor's layout tag.
    pub fn layout_tag(&self, id: TensorId) -> LayoutTag {
        self.entry(id).tag
    }

    /// Return true if a layout transform has been applied to this tensor.
    pub fn is_transposed(&self, id: TensorId) -> bool {
        self.entry(id).transposed
    }

    /// Return the master this tensor is bound to, if it is a child view.
    pub fn master(&self, id: TensorId) -> Option<TensorId> {
        match self.entry(id).variant {
            TensorVariant::View { master, .. } => Some(master),
            _ => None,
        }
    }

    /// Return the child views bound to this tensor.
    pub fn children(&self, id: TensorId) -> &[TensorId] {
        &self.entry(id).children
    }

    /// Set a display name used in diagnostics.
    pub fn set_name(&mut self, id: TensorId, name: impl Into<String>) {
        self.entry_mut(id).name = Some(name.into());
    }

    /// Return the tensor's display name, if one was set.
    pub fn name(&self, id: TensorId) -> Option<&str> {
        self.entry(id).name.as_deref()
    }

    /// Return the physical shape and element count as a string, eg.
    /// `"2 4 3 5 (120)"`.
    pub fn shape_string(&self, id: TensorId) -> String {
        use std::fmt::Write;
        let entry = self.entry(id);
        let mut out = String::new();
        for size in &entry.shape {
            write!(out, "{} ", size).unwrap();
        }
        write!(out, "({})", entry.count).unwrap();
        out
    }

    // Offset computation.

    /// Map a logical (batch, head, sequence, dimension) index to a linear
    /// element offset in this tensor's storage.
    ///
    /// For a child view bound with an axis offset the index is translated
    /// into the master's index space, wrapping modulo the master's extents.
    pub fn offset(
        &self,
        id: TensorId,
        batch: usize,
        head: usize,
        sequence: usize,
        dimension: usize,
    ) -> usize {
        let entry = self.entry(id);
        match &entry.variant {
            TensorVariant::View {
                axis_offset: Some(offset),
                master_shape: Some(master),
                ..
            } => layout::offset_4d_windowed(
                entry.tag,
                *master,
                *offset,
                [batch, head, sequence, dimension],
            ),
            _ => layout::offset_4d(entry.tag, &entry.shape, [batch, head, sequence, dimension]),
        }
    }

    /// Map a logical (batch, channel, time, height, width) index to a linear
    /// element offset.
    pub fn offset_5d(
        &self,
        id: TensorId,
        batch: usize,
        channel: usize,
        time: usize,
        height: usize,
        width: usize,
    ) -> usize {
        let entry = self.entry(id);
        layout::offset_5d(
            entry.tag,
            &entry.shape,
            [batch, channel, time, height, width],
        )
    }

    /// Map an index sequence to a linear element offset.
    ///
    /// Child views bound with an axis offset interpret the first four
    /// entries as (batch, head, sequence, dimension); otherwise the index is
    /// folded row-major over the physical shape, with missing trailing
    /// entries read as 0.
    pub fn offset_of(&self, id: TensorId, indices: &[usize]) -> usize {
        let entry = self.entry(id);
        if let TensorVariant::View {
            axis_offset: Some(_),
            master_shape: Some(_),
            ..
        } = entry.variant
        {
            let idx = |i: usize| indices.get(i).copied().unwrap_or(0);
            return self.offset(id, idx(0), idx(1), idx(2), idx(3));
        }
        let mut offset = 0;
        for (i, &size) in entry.shape.iter().enumerate() {
            offset = offset * size + indices.get(i).copied().unwrap_or(0);
        }
        offset
    }

    // Element access.

    /// Route an index through aggregate tensors to the component that stores
    /// it, returning the component id and the index local to it.
    fn resolve(&self, id: TensorId, index: [usize; 4]) -> (TensorId, [usize; 4]) {
        let entry = self.entry(id);
        let TensorVariant::Joined {
            components,
            axis,
            splits,
        } = &entry.variant
        else {
            return (id, index);
        };

        let [b, mut h, mut s, mut d] = index;
        let position = match axis {
            JoinAxis::Head => {
                let (position, local) = split_index(splits, h);
                h = local;
                position
            }
            JoinAxis::Sequence => {
                let (position, local) = split_index(splits, s);
                s = local;
                position
            }
            JoinAxis::Dimension => {
                let (position, local) = split_index(splits, d);
                d = local;
                position
            }
            JoinAxis::DimHeads => {
                let dim_size = self.dimension(components[0]);
                let span = dim_size * components.len();
                let rem = d % span;
                h = d / span;
                d = rem % dim_size;
                rem / dim_size
            }
            JoinAxis::HeadDims => {
                let dim_size = self.dimension(components[0]);
                let span = dim_size * self.head(components[0]);
                let position = d / span;
                let rem = d - position * span;
                h = rem / dim_size;
                d = rem % dim_size;
                position
            }
        };
        let component = components.get(position).copied().unwrap_or_else(|| {
            panic!(
                "index routes to component {} but aggregate {} has {}",
                position,
                self.display_name(id),
                components.len()
            )
        });
        self.resolve(component, [b, h, s, d])
    }

    fn checked_width<T: Element>(&self, id: TensorId) -> usize {
        let dtype = self.entry(id).dtype;
        let width = dtype
            .scalar_width()
            .unwrap_or_else(|| panic!("typed access is not supported for {} data", dtype));
        assert!(
            width == mem::size_of::<T>(),
            "element type {} does not match tensor dtype {}",
            std::any::type_name::<T>(),
            dtype
        );
        width
    }

    /// Read the element at a logical (batch, head, sequence, dimension)
    /// index.
    pub fn get<T: Element>(
        &self,
        id: TensorId,
        batch: usize,
        head: usize,
        sequence: usize,
        dimension: usize,
    ) -> T {
        let (target, [b, h, s, d]) = self.resolve(id, [batch, head, sequence, dimension]);
        let width = self.checked_width::<T>(target);
        let offset = self.offset(target, b, h, s, d);
        self.buffer(target).read(offset * width)
    }

    /// Write the element at a logical (batch, head, sequence, dimension)
    /// index.
    pub fn set<T: Element>(
        &mut self,
        id: TensorId,
        batch: usize,
        head: usize,
        sequence: usize,
        dimension: usize,
        value: T,
    ) {
        let (target, [b, h, s, d]) = self.resolve(id, [batch, head, sequence, dimension]);
        let width = self.checked_width::<T>(target);
        let offset = self.offset(target, b, h, s, d);
        self.buffer_mut(target).write(offset * width, value);
    }

    /// Return a pointer to the element at a logical index.
    pub fn ptr_at<T: Element>(
        &self,
        id: TensorId,
        batch: usize,
        head: usize,
        sequence: usize,
        dimension: usize,
    ) -> *const T {
        let (target, [b, h, s, d]) = self.resolve(id, [batch, head, sequence, dimension]);
        let width = self.checked_width::<T>(target);
        let offset = self.offset(target, b, h, s, d);
        let buffer = self.buffer(target);
        assert!(
            (offset + 1) * width <= buffer.len(),
            "element offset {} is out of bounds",
            offset
        );
        buffer.as_ptr().wrapping_add(offset * width) as *const T
    }

    /// Return the data type of the element at a logical index.
    ///
    /// Components of an aggregate may have differing data types, so this
    /// routes the index before reading the type.
    pub fn dtype_at(
        &self,
        id: TensorId,
        batch: usize,
        head: usize,
        sequence: usize,
        dimension: usize,
    ) -> DataType {
        let (target, _) = self.resolve(id, [batch, head, sequence, dimension]);
        self.entry(target).dtype
    }

    /// Read the element at an index sequence (see
    /// [`offset_of`](Self::offset_of) for how indices are interpreted).
    pub fn get_at<T: Element>(&self, id: TensorId, indices: &[usize]) -> T {
        if matches!(self.entry(id).variant, TensorVariant::Joined { .. }) {
            let idx = |i: usize| indices.get(i).copied().unwrap_or(0);
            return self.get(id, idx(0), idx(1), idx(2), idx(3));
        }
        let width = self.checked_width::<T>(id);
        let offset = self.offset_of(id, indices);
        self.buffer(id).read(offset * width)
    }

    /// Write the element at an index sequence.
    pub fn set_at<T: Element>(&mut self, id: TensorId, indices: &[usize], value: T) {
        if matches!(self.entry(id).variant, TensorVariant::Joined { .. }) {
            let idx = |i: usize| indices.get(i).copied().unwrap_or(0);
            return self.set(id, idx(0), idx(1), idx(2), idx(3), value);
        }
        let width = self.checked_width::<T>(id);
        let offset = self.offset_of(id, indices);
        self.buffer_mut(id).write(offset * width, value);
    }

    /// Read the element at a logical (batch, channel, time, height, width)
    /// index of a 5-axis tensor.
    pub fn get_5d<T: Element>(
        &self,
        id: TensorId,
        batch: usize,
        channel: usize,
        time: usize,
        height: usize,
        width: usize,
    ) -> T {
        let elem_width = self.checked_width::<T>(id);
        let offset = self.offset_5d(id, batch, channel, time, height, width);
        self.buffer(id).read(offset * elem_width)
    }

    /// Write the element at a logical (batch, channel, time, height, width)
    /// index of a 5-axis tensor.
    pub fn set_5d<T: Element>(
        &mut self,
        id: TensorId,
        batch: usize,
        channel: usize,
        time: usize,
        height: usize,
        width: usize,
        value: T,
    ) {
        let elem_width = self.checked_width::<T>(id);
        let offset = self.offset_5d(id, batch, channel, time, height, width);
        self.buffer_mut(id).write(offset * elem_width, value);
    }

    /// Return a pointer to the first byte of this tensor's storage.
    pub fn base_ptr(&self, id: TensorId) -> *const u8 {
        self.buffer(id).as_ptr()
    }

    /// Return a mutable pointer to the first byte of this tensor's storage.
    pub fn base_ptr_mut(&mut self, id: TensorId) -> *mut u8 {
        self.buffer_mut(id).as_mut_ptr()
    }

    /// Write `value` to every logical (batch, head, sequence, dimension)
    /// element.
    pub fn fill<T: Element>(&mut self, id: TensorId, value: T) {
        let [batch, head, sequence, dimension] = self.logical_4(id);
        for b in 0..batch {
            for h in 0..head {
                for s in 0..sequence {
                    for d in 0..dimension {
                        self.set(id, b, h, s, d, value);
                    }
                }
            }
        }
    }

    // Layout transforms.

    /// Swap the physical roles of two logical axes without moving data.
    ///
    /// On success the layout tag changes (see
    /// [`LayoutTag::transposed`]) while every logical accessor keeps
    /// reporting the same extents; only the index-to-offset mapping differs.
    /// If this tensor is a 4-axis child view and `undiffusion` is false, the
    /// new tag also propagates into its master. Unsupported combinations
    /// leave the tensor untouched and return an error, which callers
    /// matching the historical permissive behaviour can discard.
    pub fn trans_layout(
        &mut self,
        id: TensorId,
        axis_a: Axis,
        axis_b: Axis,
        undiffusion: bool,
    ) -> Result<(), UnsupportedTransform> {
        let tag = self.entry(id).tag;
        let Some(new_tag) = tag.transposed(axis_a, axis_b) else {
            return Err(UnsupportedTransform {
                tag,
                axis_a,
                axis_b,
            });
        };

        if new_tag.is_five_axis() {
            let [b, c, t, h, w] = self.logical_5(id);
            self.entry_mut(id).tag = new_tag;
            self.reshape_5d(id, b, c, t, h, w);
        } else {
            let [b, h, s, d] = self.logical_4(id);
            self.entry_mut(id).tag = new_tag;
            self.reshape(id, b, h, s, d);
        }
        {
            let entry = self.entry_mut(id);
            entry.transposed = true;
            entry.undiffused = undiffusion;
        }

        // A layout change on a bound child diffuses into its master unless
        // suppressed.
        if !undiffusion && !new_tag.is_five_axis() {
            if let TensorVariant::View { master, .. } = self.entry(id).variant {
                let master_tag = self.entry(master).tag;
                if master_tag != new_tag && !master_tag.is_five_axis() {
                    let [b, h, s, d] = self.logical_4(master);
                    self.entry_mut(master).tag = new_tag;
                    self.reshape(master, b, h, s, d);
                }
            }
        }
        Ok(())
    }

    // Child binding.

    /// Return true if `from` reaches `target` through its storage
    /// dependencies (master chain and aggregate components).
    fn depends_on(&self, from: TensorId, target: TensorId) -> bool {
        if from == target {
            return true;
        }
        match &self.entry(from).variant {
            TensorVariant::Owner { .. } => false,
            TensorVariant::View { master, .. } => self.depends_on(*master, target),
            TensorVariant::Joined { components, .. } => {
                components.iter().any(|&c| self.depends_on(c, target))
            }
        }
    }

    /// Bind this tensor as a child view of `master`.
    ///
    /// The child's buffer becomes the master's; capacity, count and data
    /// type are copied from the master, and the shape too when `copy_shape`
    /// is set (suppressed automatically when an `axis_offset` is supplied).
    ///
    /// If the two layout tags differ within the 4-axis family they are
    /// reconciled: a child that was already transposed rewrites the *master*
    /// to its tag, otherwise the child adopts the master's tag — unless the
    /// child is marked undiffused, in which case the tags may legitimately
    /// diverge.
    ///
    /// `axis_offset` places the child at a per-axis logical start within the
    /// master, with modular wraparound addressing. `head_repeat` supports
    /// grouped-query attention: a single-head child bound over a multi-head
    /// master records a rescaled master dimension extent so each child index
    /// cyclically aliases the repeated head range.
    ///
    /// Any children already bound to this tensor are transferred up to the
    /// new master. Panics if the binding would make a tensor its own
    /// transitive master.
    pub fn bind_as_child(
        &mut self,
        id: TensorId,
        master: TensorId,
        copy_shape: bool,
        axis_offset: Option<[usize; 4]>,
        head_repeat: usize,
    ) {
        assert!(
            !self.depends_on(master, id),
            "binding {} to {} would make a tensor its own master",
            self.display_name(id),
            self.display_name(master)
        );

        let copy_shape = copy_shape && axis_offset.is_none();

        // Reconcile the pair's layout tags: compute the joint tag first,
        // then apply it to whichever side has to change.
        let child_tag = self.entry(id).tag;
        let master_tag = self.entry(master).tag;
        if !child_tag.is_five_axis()
            && !master_tag.is_five_axis()
            && child_tag != master_tag
            && !self.entry(id).undiffused
        {
            if self.entry(id).transposed {
                let [b, h, s, d] = self.logical_4(master);
                self.entry_mut(master).tag = child_tag;
                self.reshape(master, b, h, s, d);
            } else {
                let [b, h, s, d] = self.logical_4(id);
                self.entry_mut(id).tag = master_tag;
                self.reshape(id, b, h, s, d);
            }
        }

        // Adopt the master's storage metadata. Replacing the variant drops
        // any buffer this entry previously owned.
        let master_entry = self.entry(master);
        let (capacity, count, dtype) = (master_entry.capacity, master_entry.count, master_entry.dtype);
        let shape = copy_shape.then(|| master_entry.shape.clone());
        {
            let entry = self.entry_mut(id);
            entry.capacity = capacity;
            entry.count = count;
            entry.dtype = dtype;
            if let Some(shape) = shape {
                entry.shape = shape;
            }
            entry.variant = TensorVariant::View {
                master,
                axis_offset: None,
                master_shape: None,
            };
        }

        if let Some(offset) = axis_offset {
            let mut master_shape = self.logical_4(master);
            let child_head = self.head(id);
            if master_shape[1] != child_head {
                // A single-head child aliasing a multi-head master: fold the
                // repeated head range into the recorded dimension extent so
                // the modular offset formula cycles over it.
                if child_head == 1 && head_repeat == 1 {
                    master_shape = [
                        master_shape[0],
                        1,
                        master_shape[2],
                        master_shape[3] * master_shape[1],
                    ];
                } else if child_head == 1 && head_repeat > 1 {
                    master_shape = [
                        master_shape[0],
                        1,
                        master_shape[2],
                        master_shape[3] * master_shape[1] / head_repeat,
                    ];
                }
            }
            self.entry_mut(id).variant = TensorVariant::View {
                master,
                axis_offset: Some(offset),
                master_shape: Some(master_shape),
            };
        }

        // Transfer this tensor's own pre-existing children up to the new
        // master, iterating a snapshot of the list.
        let prior_children = mem::take(&mut self.entry_mut(id).children);
        for child in prior_children {
            self.bind_as_child(child, master, false, axis_offset, head_repeat);
        }

        self.entry_mut(master).children.push(id);
    }

    // Aggregation.

    /// Turn this tensor into a logical concatenation of `components` along
    /// `axis`.
    ///
    /// For the head/sequence/dimension axes every component must match this
    /// tensor's logical extents on the non-joined axes, and the joined
    /// extents must sum to this tensor's. The interleaved modes instead
    /// require identical per-component head and dimension extents. All
    /// subsequent element access is forwarded to exactly one component.
    pub fn aggregate(&mut self, id: TensorId, components: &[TensorId], axis: JoinAxis) {
        for &component in components {
            assert!(
                !self.depends_on(component, id),
                "aggregating {} into {} would make a tensor its own component",
                self.display_name(component),
                self.display_name(id)
            );
        }

        let mut splits = Vec::new();
        match axis {
            JoinAxis::Head | JoinAxis::Sequence | JoinAxis::Dimension => {
                let joined = |arena: &TensorArena, t| match axis {
                    JoinAxis::Head => arena.head(t),
                    JoinAxis::Sequence => arena.sequence(t),
                    _ => arena.dimension(t),
                };
                let mut sum = 0;
                for &component in components {
                    assert_eq!(
                        self.batch(component),
                        self.batch(id),
                        "aggregate component batch size mismatch"
                    );
                    if axis != JoinAxis::Head {
                        assert_eq!(
                            self.head(component),
                            self.head(id),
                            "aggregate component head size mismatch"
                        );
                    }
                    if axis != JoinAxis::Sequence {
                        assert_eq!(
                            self.sequence(component),
                            self.sequence(id),
                            "aggregate component sequence size mismatch"
                        );
                    }
                    if axis != JoinAxis::Dimension {
                        assert_eq!(
                            self.dimension(component),
                            self.dimension(id),
                            "aggregate component dimension size mismatch"
                        );
                    }
                    sum += joined(self, component);
                    splits.push(sum);
                }
                assert_eq!(
                    sum,
                    joined(self, id),
                    "component sizes along the joined axis do not sum to the aggregate size"
                );
            }
            JoinAxis::DimHeads | JoinAxis::HeadDims => {
                let first = components
                    .first()
                    .copied()
                    .expect("aggregate requires at least one component");
                let head = self.head(first);
                let dimension = self.dimension(first);
                for &component in components {
                    assert!(
                        self.head(component) == head && self.dimension(component) == dimension,
                        "interleaved dimension joins require uniform per-component head and dimension extents"
                    );
                }
            }
        }

        self.entry_mut(id).variant = TensorVariant::Joined {
            components: components.to_vec(),
            axis,
            splits,
        };
    }

    // Whole-buffer copy.

    /// Copy the current element count's bytes from `src`'s buffer into
    /// `dst`'s.
    ///
    /// Panics if `dst` is bound to a master, or if the data types or element
    /// counts differ.
    pub fn copy_from(&mut self, dst: TensorId, src: TensorId) {
        assert!(
            !matches!(self.entry(dst).variant, TensorVariant::View { .. }),
            "cannot copy into {}: it is bound to a master",
            self.display_name(dst)
        );
        assert_eq!(
            self.dtype(src),
            self.dtype(dst),
            "copy requires matching data types"
        );
        assert_eq!(
            self.count(src),
            self.count(dst),
            "copy requires matching element counts"
        );
        let bytes = self.count_byte_size(dst);

        let src_owner = self.owner_of(src).as_usize();
        let dst_owner = self.owner_of(dst).as_usize();
        assert!(
            src_owner != dst_owner,
            "copy source and destination share a buffer"
        );
        let (src_entry, dst_entry) = if src_owner < dst_owner {
            let (lo, hi) = self.entries.split_at_mut(dst_owner);
            (&lo[src_owner], &mut hi[0])
        } else {
            let (lo, hi) = self.entries.split_at_mut(src_owner);
            (&hi[0], &mut lo[dst_owner])
        };
        let src_buffer = match &src_entry.variant {
            TensorVariant::Owner { buffer } => {
                buffer.as_ref().expect("copy source is not allocated")
            }
            _ => panic!("copy source has no buffer"),
        };
        let dst_buffer = match &mut dst_entry.variant {
            TensorVariant::Owner { buffer } => {
                buffer.as_mut().expect("copy destination is not allocated")
            }
            _ => panic!("copy destination has no buffer"),
        };
        dst_buffer.copy_from(src_buffer, bytes);
    }
}
