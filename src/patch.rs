//! # Patch
//!
//! Byte writes into the live image.
//!
//! Every patch this crate makes reduces to the same operation: put these
//! bytes at that address, even when the address sits in a write-protected
//! page, and remember what was there. [`write`] is that operation. It
//! lifts the target pages' protection around the copy and hands back an
//! [`Applied`] receipt holding the overwritten bytes; dropping the receipt
//! puts them back, which is what tests want, while production patches stay
//! through [`Applied::commit`]. [`write_expecting`] refuses to touch a
//! site whose current bytes are not the ones the caller said should be
//! there, catching a mismatched build or a conflicting earlier patch
//! before anything is written.

use std::mem;
use std::ptr;
use std::slice;

use region::Protection;
use thiserror::Error;

/// Errors from a patch write.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The bytes on site differ from the caller's precondition; nothing
    /// was written.
    #[error("site {addr:#x} holds {found:02x?}, expected {expected:02x?}")]
    Mismatch {
        /// Address of the failed precondition.
        addr: usize,
        /// Bytes the caller expected on site.
        expected: Vec<u8>,
        /// Bytes actually read from the site.
        found: Vec<u8>,
    },
    /// The site's page protection could not be changed.
    #[error("could not change page protection at {addr:#x}: {source}")]
    Protection {
        /// Address of the failed write.
        addr: usize,
        /// Underlying protection error.
        source: region::Error,
    },
}

/// Receipt for one write: knows the site and the bytes the write replaced.
pub struct Applied {
    /// Address the write landed at.
    addr: usize,
    /// Bytes the write replaced.
    original: Vec<u8>,
}

/// Writes `bytes` at `addr`.
///
/// The target pages are made writable for the duration of the copy; their
/// previous protection is back in place before this returns.
///
/// # Safety
///
/// `addr` must be valid for reads and writes of `bytes.len()` bytes, and
/// must not alias memory Rust holds references into. Module images and
/// raw test buffers qualify; borrowed data does not.
pub unsafe fn write(addr: usize, bytes: &[u8]) -> Result<Applied, PatchError> {
    let target = addr as *mut u8;
    // Dropping the handle restores the previous protection on every path
    // out of this function.
    let _handle = region::protect_with_handle(target, bytes.len(), Protection::all())
        .map_err(|source| PatchError::Protection { addr, source })?;

    let original = slice::from_raw_parts(target as *const u8, bytes.len()).to_vec();
    ptr::copy(bytes.as_ptr(), target, bytes.len());
    Ok(Applied { addr, original })
}

/// Writes `bytes` at `addr` only when the `expected` bytes are currently
/// on site.
///
/// # Safety
///
/// Same requirements as [`write`], extended to reads of `expected.len()`
/// bytes.
pub unsafe fn write_expecting(
    addr: usize,
    bytes: &[u8],
    expected: &[u8],
) -> Result<Applied, PatchError> {
    let found = slice::from_raw_parts(addr as *const u8, expected.len());
    if found != expected {
        return Err(PatchError::Mismatch {
            addr,
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    write(addr, bytes)
}

impl Applied {
    /// The bytes the write replaced.
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Keeps the write in place; the receipt is consumed without
    /// restoring the site.
    pub fn commit(self) {
        mem::forget(self);
    }
}

impl Drop for Applied {
    fn drop(&mut self) {
        // The pages were writable once already; if they cannot be made
        // writable a second time the site stays patched.
        unsafe {
            let writable = region::protect_with_handle(
                self.addr as *const u8,
                self.original.len(),
                Protection::all(),
            );
            if let Ok(_handle) = writable {
                ptr::copy(self.original.as_ptr(), self.addr as *mut u8, self.original.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_the_receipt_restores_the_site() {
        let mut buf = vec![1u8, 2, 3, 4];
        let addr = buf.as_mut_ptr() as usize;

        let applied = unsafe { write(addr + 1, &[9, 9]).unwrap() };
        assert_eq!(&buf[..], [1, 9, 9, 4]);
        assert_eq!(applied.original(), [2, 3]);

        drop(applied);
        assert_eq!(&buf[..], [1, 2, 3, 4]);
    }

    #[test]
    fn committed_writes_stay() {
        let mut buf = vec![1u8, 2, 3, 4];
        let addr = buf.as_mut_ptr() as usize;

        unsafe { write(addr, &[7]).unwrap() }.commit();
        assert_eq!(&buf[..], [7, 2, 3, 4]);
    }

    #[test]
    fn matching_precondition_writes() {
        let mut buf = vec![0xc7u8, 0x45, 0xfc, 0xfe];
        let addr = buf.as_mut_ptr() as usize;

        unsafe { write_expecting(addr, &[0x90, 0x90], &[0xc7, 0x45]).unwrap() }.commit();
        assert_eq!(&buf[..], [0x90, 0x90, 0xfc, 0xfe]);
    }

    #[test]
    fn mismatched_precondition_writes_nothing() {
        let mut buf = vec![0xc7u8, 0x45, 0xfc, 0xfe];
        let addr = buf.as_mut_ptr() as usize;

        let result = unsafe { write_expecting(addr, &[0x90, 0x90], &[0xc7, 0x46]) };
        match result {
            Err(PatchError::Mismatch {
                addr: at,
                expected,
                found,
            }) => {
                assert_eq!(at, addr);
                assert_eq!(expected, [0xc7, 0x46]);
                assert_eq!(found, [0xc7, 0x45]);
            }
            _ => panic!("expected a mismatch"),
        }
        assert_eq!(&buf[..], [0xc7, 0x45, 0xfc, 0xfe]);
    }

    #[test]
    fn protection_comes_back_on_readonly_pages() {
        // A page-aligned span we can protect freely.
        let page = region::page::size();
        let mut backing = vec![0u8; page * 2];
        let start = backing.as_mut_ptr();
        let aligned = ((start as usize + page - 1) / page * page) as *mut u8;

        unsafe {
            slice::from_raw_parts_mut(aligned, 4).copy_from_slice(&[1, 2, 3, 4]);
            region::protect(aligned, page, Protection::READ).unwrap();
        }

        let applied = unsafe { write(aligned as usize, &[9, 9]).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(aligned, 4) }, [9, 9, 3, 4]);
        assert_eq!(region::query(aligned).unwrap().protection(), Protection::READ);

        // The restore on drop lifts and reverts the protection on its own.
        drop(applied);
        assert_eq!(unsafe { slice::from_raw_parts(aligned, 4) }, [1, 2, 3, 4]);
        assert_eq!(region::query(aligned).unwrap().protection(), Protection::READ);

        // Make the backing vec freeable again.
        unsafe { region::protect(aligned, page, Protection::READ_WRITE).unwrap() };
    }
}
