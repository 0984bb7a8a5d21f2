//! # Heap
//!
//! Replacements for the host's custom heap entry points.
//!
//! The host ships its own heap manager with compaction and usage
//! accounting, and several of its crashes trace back to it. The fix is to
//! route every entry point at the ambient C allocator instead: same call
//! signatures, so the redirected sites need no further changes, but
//! allocator semantics the rest of the process can trust.
//!
//! Two variants sit behind the exported entry points. The checked one pads
//! every block with the requested size and canary markers and validates
//! them at free time; the unchecked one is a plain pass-through. Diagnostic
//! builds get the checked variant, release builds the unchecked one.

use core::mem::size_of;
use core::ptr;

/// Marker written in front of and after every checked allocation.
const CANARY: u32 = 0xFDFD_FDFD;

/// Bytes in front of a checked allocation's usable space: the requested
/// size followed by the first canary.
const PROLOGUE_SIZE: usize = size_of::<usize>() + size_of::<u32>();

/// Bytes after a checked allocation's usable space: the second canary.
const EPILOGUE_SIZE: usize = size_of::<u32>();

/// Total padding a checked allocation carries.
const PADDING_SIZE: usize = PROLOGUE_SIZE + EPILOGUE_SIZE;

/// Value the host's space-availability checks read through the patched
/// "upper memory bound" slot. With the custom heap gone there is no real
/// bound to report, so they see the largest one that fits their comparison.
pub static FAKE_UPPER_BOUND: usize = 0x7FFF_FFFF;

/// Replacement for the heap manager's startup entry point. The ambient
/// allocator needs no setup.
pub extern "C" fn init() {}

/// Replacement for the heap manager's teardown entry point.
pub extern "C" fn shutdown() {}

/// Replacement allocation entry point.
///
/// Returns a zero-initialized block of `size` bytes, or null when `size`
/// is zero. The host's original allocator zeroed its blocks, and callers
/// rely on it.
pub extern "C" fn alloc(size: usize) -> *mut u8 {
    if cfg!(debug_assertions) {
        alloc_checked(size)
    } else {
        alloc_unchecked(size)
    }
}

/// Replacement deallocation entry point. Null is a no-op.
///
/// # Safety
///
/// `data` must be null or a pointer previously returned by [`alloc`].
pub unsafe extern "C" fn free(data: *mut u8) {
    if cfg!(debug_assertions) {
        free_checked(data)
    } else {
        free_unchecked(data)
    }
}

/// Plain pass-through allocation.
fn alloc_unchecked(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    unsafe { libc::calloc(size, 1) as *mut u8 }
}

/// Plain pass-through deallocation.
unsafe fn free_unchecked(data: *mut u8) {
    if !data.is_null() {
        libc::free(data as *mut _);
    }
}

/// Allocation with corruption detection.
///
/// Checked blocks are laid out as
/// `requested size | canary | usable space | canary`, with the usable
/// space's address handed to the caller.
fn alloc_checked(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }

    let memory = unsafe { libc::calloc(size + PADDING_SIZE, 1) as *mut u8 };
    assert!(
        !memory.is_null(),
        "ambient allocator returned null for {size} bytes"
    );

    unsafe {
        ptr::write_unaligned(memory as *mut usize, size);
        ptr::write_unaligned(memory.add(size_of::<usize>()) as *mut u32, CANARY);
        ptr::write_unaligned(memory.add(PROLOGUE_SIZE + size) as *mut u32, CANARY);
        memory.add(PROLOGUE_SIZE)
    }
}

/// Deallocation with corruption detection; validates both canaries and
/// releases the full padded block.
unsafe fn free_checked(data: *mut u8) {
    if data.is_null() {
        return;
    }

    let front = ptr::read_unaligned(data.sub(size_of::<u32>()) as *const u32);
    assert_eq!(front, CANARY, "corrupted block prologue at {data:p}");

    // The recorded size can be trusted once the first canary held.
    let size = ptr::read_unaligned(data.sub(PROLOGUE_SIZE) as *const usize);
    let back = ptr::read_unaligned(data.add(size) as *const u32);
    assert_eq!(back, CANARY, "corrupted block epilogue at {data:p}");

    libc::free(data.sub(PROLOGUE_SIZE) as *mut _);
}

/// Replacement for the aligned allocation entry point: a thin pass-through
/// to the ambient aligned primitive. Zero sizes return null.
pub extern "C" fn alloc_aligned(size: usize, align: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    let memory = unsafe { ambient_alloc_aligned(size, align) };
    debug_assert!(
        !memory.is_null(),
        "aligned allocation of {size} bytes failed"
    );
    memory
}

/// Replacement for the aligned deallocation entry point. Null is a no-op.
///
/// # Safety
///
/// `data` must be null or a pointer previously returned by
/// [`alloc_aligned`].
pub unsafe extern "C" fn free_aligned(data: *mut u8) {
    if !data.is_null() {
        ambient_free_aligned(data);
    }
}

/// Aligned allocation on the CRT heap.
#[cfg(windows)]
unsafe fn ambient_alloc_aligned(size: usize, align: usize) -> *mut u8 {
    libc::_aligned_malloc(size, align) as *mut u8
}

/// Aligned release on the CRT heap.
#[cfg(windows)]
unsafe fn ambient_free_aligned(data: *mut u8) {
    libc::_aligned_free(data as *mut _);
}

/// Aligned allocation elsewhere. `posix_memalign` wants an alignment that
/// is a power of two and at least a pointer wide.
#[cfg(not(windows))]
unsafe fn ambient_alloc_aligned(size: usize, align: usize) -> *mut u8 {
    let align = align.max(size_of::<*const u8>());
    let mut memory = ptr::null_mut();
    if libc::posix_memalign(&mut memory, align, size) != 0 {
        return ptr::null_mut();
    }
    memory as *mut u8
}

/// Aligned release elsewhere; `posix_memalign` blocks free normally.
#[cfg(not(windows))]
unsafe fn ambient_free_aligned(data: *mut u8) {
    libc::free(data as *mut _);
}

/// Replacement for the cleanup-site `operator delete`: frees through the
/// pointer variable and nulls it, so the host's cleanup code running twice
/// frees once.
///
/// # Safety
///
/// `slot` must point at a live pointer variable holding null or a block
/// from [`alloc`].
pub unsafe extern "C" fn free_and_null(slot: *mut *mut u8) {
    if !(*slot).is_null() {
        free(*slot);
        *slot = ptr::null_mut();
    }
}

/// Replacement for the heap's stdcall free entry point.
///
/// # Safety
///
/// Same requirements as [`free`].
pub unsafe extern "system" fn free_stdcall(data: *mut u8) {
    free(data);
}

/// Replacement for the heap's compaction step. The custom heap moved
/// blocks to defragment itself; the ambient allocator never moves
/// anything, so the block stays where it is.
pub extern "system" fn move_memory(data: *mut u8) -> *mut u8 {
    data
}

/// Replacement for the used-bytes query. Usage accounting is meaningless
/// once the custom heap is gone.
pub extern "system" fn bytes_used(_pool: i32) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use std::slice;

    use super::*;

    #[test]
    fn alloc_returns_zeroed_blocks() {
        let block = alloc(64);
        assert!(!block.is_null());
        assert!(unsafe { slice::from_raw_parts(block, 64) }.iter().all(|&b| b == 0));
        unsafe { free(block) };
    }

    #[test]
    fn zero_size_and_null_are_no_ops() {
        assert!(alloc(0).is_null());
        assert!(alloc_checked(0).is_null());
        assert!(alloc_unchecked(0).is_null());
        assert!(alloc_aligned(0, 16).is_null());
        unsafe {
            free(ptr::null_mut());
            free_checked(ptr::null_mut());
            free_unchecked(ptr::null_mut());
            free_aligned(ptr::null_mut());
        }
    }

    #[test]
    fn checked_roundtrip_with_intact_canaries() {
        let block = alloc_checked(24);
        assert!(unsafe { slice::from_raw_parts(block, 24) }.iter().all(|&b| b == 0));
        unsafe {
            slice::from_raw_parts_mut(block, 24).fill(0x5a);
            free_checked(block);
        }
    }

    #[test]
    #[should_panic(expected = "prologue")]
    fn corrupted_prologue_canary_is_fatal() {
        let block = alloc_checked(16);
        unsafe {
            *block.sub(1) = 0x00;
            free_checked(block);
        }
    }

    #[test]
    #[should_panic(expected = "epilogue")]
    fn corrupted_epilogue_canary_is_fatal() {
        let block = alloc_checked(16);
        unsafe {
            *block.add(16) = 0x00;
            free_checked(block);
        }
    }

    #[test]
    fn unchecked_free_inspects_nothing() {
        // No canaries, no recorded size: whatever the caller did to the
        // block's contents, the release is a plain pass-through.
        let block = alloc_unchecked(16);
        unsafe {
            slice::from_raw_parts_mut(block, 16).fill(0xff);
            free_unchecked(block);
        }
    }

    #[test]
    fn free_and_null_clears_the_slot_once() {
        let mut slot = alloc(8);
        unsafe { free_and_null(&mut slot) };
        assert!(slot.is_null());
        // Already null: verified no-op.
        unsafe { free_and_null(&mut slot) };
        assert!(slot.is_null());
    }

    #[test]
    fn aligned_blocks_honor_the_alignment() {
        for align in [16usize, 64, 128] {
            let block = alloc_aligned(100, align);
            assert!(!block.is_null());
            assert_eq!(block as usize % align, 0);
            unsafe { free_aligned(block) };
        }
    }

    #[test]
    fn move_stub_is_identity() {
        let block = alloc(4);
        assert_eq!(move_memory(block), block);
        assert_eq!(move_memory(ptr::null_mut()), ptr::null_mut());
        unsafe { free(block) };
    }

    #[test]
    fn bytes_used_stub_always_reports_zero() {
        assert_eq!(bytes_used(0), 0);
        assert_eq!(bytes_used(7), 0);
        assert_eq!(bytes_used(-1), 0);
    }
}
