//! Aligned host memory allocation and single-owner buffers.

use std::alloc::Layout;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

/// Allocator for tensor storage.
///
/// This is the full contract the tensor core requires from a memory backend:
/// obtain a block at a caller-specified alignment and release a block
/// obtained earlier. Implementations are supplied when constructing a
/// [`TensorArena`](crate::TensorArena); [`SystemAlloc`] is the default.
pub trait Alloc: Send + Sync {
    /// Allocate `size` bytes whose first byte is a multiple of `align`.
    ///
    /// `align` must be a power of two. Panics if `size` is zero and aborts if
    /// the underlying allocation fails; allocation failure mid-inference is
    /// not recoverable.
    fn allocate(&self, size: usize, align: usize) -> NonNull<u8>;

    /// Release a block previously returned by [`allocate`](Alloc::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on the same allocator and
    /// must not be used after this call.
    unsafe fn release(&self, ptr: NonNull<u8>);
}

/// Recovery record stashed immediately before each aligned block.
///
/// `std::alloc::dealloc` needs the original pointer and the allocation size
/// back, so both are stored (the C idiom of stashing only the pointer relies
/// on `free` not taking a size).
#[repr(C)]
struct Header {
    origin: *mut u8,
    padded_size: usize,
}

const HEADER_SIZE: usize = mem::size_of::<Header>();

fn padded_layout(padded_size: usize) -> Layout {
    // The requested alignment is produced manually below, so the underlying
    // allocation only needs to be aligned for the header itself.
    Layout::from_size_align(padded_size, mem::align_of::<Header>())
        .expect("allocation size overflows")
}

/// Aligned allocator over the global allocator.
///
/// Over-allocates `size + header + align - 1` bytes, returns the first
/// address at or after `origin + header` that is a multiple of `align`, and
/// records the recovery header just before that address so
/// [`release`](Alloc::release) can find the original block.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAlloc;

impl Alloc for SystemAlloc {
    fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        assert!(size > 0, "allocation size must be non-zero");
        debug_assert!(align.is_power_of_two());
        let align = align.max(mem::align_of::<Header>());

        let padded_size = size + HEADER_SIZE + align - 1;
        let layout = padded_layout(padded_size);
        // Safety: `layout` has non-zero size.
        let origin = unsafe { std::alloc::alloc(layout) };
        if origin.is_null() {
            std::alloc::handle_alloc_error(layout);
        }

        let aligned = (origin as usize + HEADER_SIZE + align - 1) & !(align - 1);
        // Safety: `aligned` and the header slot before it are inside the
        // allocation: `origin + HEADER_SIZE <= aligned` and
        // `aligned + size <= origin + padded_size`.
        unsafe {
            let header = (aligned as *mut u8).sub(HEADER_SIZE) as *mut Header;
            header.write(Header {
                origin,
                padded_size,
            });
            NonNull::new_unchecked(aligned as *mut u8)
        }
    }

    unsafe fn release(&self, ptr: NonNull<u8>) {
        let header = ptr.as_ptr().sub(HEADER_SIZE) as *const Header;
        let Header {
            origin,
            padded_size,
        } = header.read();
        std::alloc::dealloc(origin, padded_layout(padded_size));
    }
}

/// A single-owner handle to one aligned allocation.
///
/// The buffer releases its memory exactly once, on drop, through the
/// allocator that produced it. Child views and aggregates never hold a
/// `HostBuffer`; they reach the owner's buffer through the tensor arena, so
/// "freed exactly once regardless of view count" holds structurally.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
    alloc: Arc<dyn Alloc>,
}

// Safety: HostBuffer has no interior mutability; the pointer field is what
// prevents the auto impls. Alloc is Send + Sync by its bounds.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    /// Allocate a new buffer of `len` bytes at the given alignment.
    pub fn new(alloc: Arc<dyn Alloc>, len: usize, align: usize) -> HostBuffer {
        let ptr = alloc.allocate(len, align);
        HostBuffer { ptr, len, alloc }
    }

    /// Return the buffer's size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return true if the buffer has zero length. Never true in practice as
    /// zero-byte allocations are rejected.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return a pointer to the first byte of the buffer.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Return a mutable pointer to the first byte of the buffer.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Read a `T` starting at `byte_offset`.
    ///
    /// Panics if the value would extend past the end of the buffer.
    pub fn read<T: Copy>(&self, byte_offset: usize) -> T {
        self.check_access::<T>(byte_offset);
        // Safety: the range was checked against the allocation length.
        unsafe { (self.ptr.as_ptr().add(byte_offset) as *const T).read_unaligned() }
    }

    /// Write a `T` starting at `byte_offset`.
    ///
    /// Panics if the value would extend past the end of the buffer.
    pub fn write<T: Copy>(&mut self, byte_offset: usize, value: T) {
        self.check_access::<T>(byte_offset);
        // Safety: the range was checked against the allocation length.
        unsafe { (self.ptr.as_ptr().add(byte_offset) as *mut T).write_unaligned(value) }
    }

    /// Copy `bytes` bytes from the start of `src` to the start of this buffer.
    pub fn copy_from(&mut self, src: &HostBuffer, bytes: usize) {
        assert!(bytes <= self.len && bytes <= src.len, "copy exceeds buffer size");
        // Safety: both ranges are in-bounds and the buffers are distinct
        // allocations.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr(), bytes);
        }
    }

    fn check_access<T>(&self, byte_offset: usize) {
        let end = byte_offset
            .checked_add(mem::size_of::<T>())
            .expect("offset overflows");
        assert!(
            end <= self.len,
            "access at byte {} of {}-byte value is out of bounds for {}-byte buffer",
            byte_offset,
            mem::size_of::<T>(),
            self.len
        );
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        // Safety: `ptr` came from this allocator and is dropped exactly once.
        unsafe { self.alloc.release(self.ptr) }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lmrt_testing::TestCases;

    use super::{Alloc, HostBuffer, SystemAlloc};

    #[test]
    fn test_allocate_alignment() {
        #[derive(Debug)]
        struct Case {
            size: usize,
            align: usize,
        }

        let cases = [
            Case { size: 1, align: 16 },
            Case { size: 7, align: 32 },
            Case { size: 64, align: 64 },
            Case { size: 1000, align: 128 },
            Case { size: 4096, align: 4096 },
        ];

        cases.test_each(|&Case { size, align }| {
            let alloc = SystemAlloc;
            let ptr = alloc.allocate(size, align);
            assert_eq!(ptr.as_ptr() as usize % align, 0);
            // The whole requested region must be writable.
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr(), 0xab, size);
                alloc.release(ptr);
            }
        });
    }

    #[test]
    #[should_panic(expected = "allocation size must be non-zero")]
    fn test_allocate_zero_size() {
        SystemAlloc.allocate(0, 16);
    }

    #[test]
    fn test_host_buffer_read_write() {
        let mut buf = HostBuffer::new(Arc::new(SystemAlloc), 16, 32);
        assert_eq!(buf.len(), 16);
        buf.write::<f32>(0, 1.5);
        buf.write::<f32>(12, -2.0);
        assert_eq!(buf.read::<f32>(0), 1.5);
        assert_eq!(buf.read::<f32>(12), -2.0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_host_buffer_read_out_of_bounds() {
        let buf = HostBuffer::new(Arc::new(SystemAlloc), 16, 32);
        buf.read::<f32>(13);
    }

    #[test]
    fn test_host_buffer_copy_from() {
        let alloc: Arc<dyn Alloc> = Arc::new(SystemAlloc);
        let mut src = HostBuffer::new(alloc.clone(), 8, 32);
        let mut dst = HostBuffer::new(alloc, 8, 32);
        src.write::<i32>(0, 7);
        src.write::<i32>(4, -9);
        dst.copy_from(&src, 8);
        assert_eq!(dst.read::<i32>(0), 7);
        assert_eq!(dst.read::<i32>(4), -9);
    }
}
