//! # Records
//!
//! The data-driven patch table and the applier that walks it.
//!
//! A [`PatchRecord`] says *what* happens at one address; [`apply`] knows
//! *how*, by building each record's payload with the encoders from
//! [`crate::code`] and writing it through [`crate::patch`]. Keeping the
//! two apart lets tests run the real applier against synthetic buffers
//! instead of a live process image.
//!
//! Records are applied strictly in order, and the applier stops at the first
//! failure; there is no per-record recovery.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use thiserror::Error;

use crate::code::{self, DisplacementError};
use crate::patch::{self, PatchError};

/// Action taken at a patch site.
pub enum PatchAction {
    /// Write these bytes as they are.
    Write(Vec<u8>),
    /// Overwrite the site with a `call` landing on `target`.
    RedirectCall {
        /// Absolute address the call should land on.
        target: usize,
        /// Slot receiving the call target found on site before the
        /// overwrite, for replacements that forward to the original.
        capture: Option<&'static AtomicUsize>,
    },
    /// Overwrite the site with a `jmp` landing on `target`.
    RedirectJump {
        /// Absolute address the jump should land on.
        target: usize,
    },
    /// Blank out `len` bytes with no-ops.
    NopFill(usize),
}

/// One patch site: an address, an optional bytes-on-site precondition, and
/// the action taken there.
pub struct PatchRecord {
    /// Absolute address the action applies at.
    pub addr: usize,
    /// Bytes that must be on site before the action runs, when known.
    pub expect: Option<&'static [u8]>,
    /// What to do at the site.
    pub action: PatchAction,
}

impl PatchRecord {
    /// A literal byte write.
    pub fn write(addr: usize, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            addr,
            expect: None,
            action: PatchAction::Write(bytes.into()),
        }
    }

    /// A `call` redirect.
    pub fn call(addr: usize, target: usize) -> Self {
        Self {
            addr,
            expect: None,
            action: PatchAction::RedirectCall {
                target,
                capture: None,
            },
        }
    }

    /// A `call` redirect that first stores the call target already on site
    /// into `capture`.
    pub fn call_capturing(addr: usize, target: usize, capture: &'static AtomicUsize) -> Self {
        Self {
            addr,
            expect: None,
            action: PatchAction::RedirectCall {
                target,
                capture: Some(capture),
            },
        }
    }

    /// A `jmp` redirect.
    pub fn jump(addr: usize, target: usize) -> Self {
        Self {
            addr,
            expect: None,
            action: PatchAction::RedirectJump { target },
        }
    }

    /// A no-op fill of `len` bytes.
    pub fn nop(addr: usize, len: usize) -> Self {
        Self {
            addr,
            expect: None,
            action: PatchAction::NopFill(len),
        }
    }

    /// Adds a bytes-on-site precondition to the record.
    pub fn expecting(mut self, bytes: &'static [u8]) -> Self {
        self.expect = Some(bytes);
        self
    }
}

/// Errors that stop a patch run.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A write failed; nothing later in the list ran.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// A redirect target was out of range of its site.
    #[error(transparent)]
    Displacement(#[from] DisplacementError),
}

/// Applies every record in order, stopping at the first failure.
///
/// A record may target read-only pages and may carry a precondition.
/// Applied records are permanent; their receipts are committed, not
/// dropped.
///
/// # Safety
///
/// Every record's address must be valid for reads and writes of its
/// action's length (plus [`code::REDIRECT_LEN`] reads for capturing
/// redirects) for the whole call.
pub unsafe fn apply(records: &[PatchRecord]) -> Result<(), ApplyError> {
    for record in records {
        apply_one(record)?;
    }
    Ok(())
}

/// Builds one record's payload and writes it.
unsafe fn apply_one(record: &PatchRecord) -> Result<(), ApplyError> {
    let payload = match &record.action {
        PatchAction::Write(bytes) => bytes.clone(),
        PatchAction::RedirectCall { target, capture } => {
            if let Some(slot) = capture {
                let original = code::read_rel_target(record.addr as *const u8);
                slot.store(original, Ordering::SeqCst);
            }
            code::call_rel(record.addr, *target)?.to_vec()
        }
        PatchAction::RedirectJump { target } => code::jmp_rel(record.addr, *target)?.to_vec(),
        PatchAction::NopFill(len) => code::nop_fill(*len),
    };

    let applied = match record.expect {
        Some(expected) => patch::write_expecting(record.addr, &payload, expected)?,
        None => patch::write(record.addr, &payload)?,
    };

    debug!("patched {:#x} ({} bytes)", record.addr, payload.len());
    applied.commit();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CALL_REL32, JMP_REL32, NOP, REDIRECT_LEN};

    static CAPTURED: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn literal_write_with_matching_precondition() {
        let mut buf = vec![0xc7u8, 0x45, 0xfc, 0xfe];
        let addr = buf.as_mut_ptr() as usize;

        let records = [PatchRecord::write(addr, [0x90, 0x90]).expecting(&[0xc7, 0x45])];
        unsafe { apply(&records) }.unwrap();

        assert_eq!(&buf[..], [0x90, 0x90, 0xfc, 0xfe]);
    }

    #[test]
    fn redirect_call_captures_the_prior_target() {
        let mut buf = vec![0u8; 32];
        let base = buf.as_mut_ptr() as usize;
        let old_target = base + 0x10;
        let new_target = base + 0x18;
        buf[..REDIRECT_LEN].copy_from_slice(&code::call_rel(base, old_target).unwrap());

        let records = [PatchRecord::call_capturing(base, new_target, &CAPTURED)];
        unsafe { apply(&records) }.unwrap();

        assert_eq!(CAPTURED.load(Ordering::SeqCst), old_target);
        assert_eq!(buf[0], CALL_REL32);
        assert_eq!(unsafe { code::read_rel_target(buf.as_ptr()) }, new_target);
    }

    #[test]
    fn redirect_jump_and_nop_fill() {
        let mut buf = vec![0xccu8; 16];
        let base = buf.as_mut_ptr() as usize;

        let records = [
            PatchRecord::jump(base, base + 8),
            PatchRecord::nop(base + 6, 2),
        ];
        unsafe { apply(&records) }.unwrap();

        assert_eq!(buf[0], JMP_REL32);
        assert_eq!(unsafe { code::read_rel_target(buf.as_ptr()) }, base + 8);
        assert_eq!(&buf[6..8], [NOP, NOP]);
    }

    #[test]
    fn first_failed_precondition_stops_the_run() {
        let mut buf = vec![0x11u8, 0x22, 0x33, 0x44];
        let base = buf.as_mut_ptr() as usize;

        let records = [
            PatchRecord::write(base, [0xaa]).expecting(&[0x99]),
            PatchRecord::write(base + 2, [0xbb]),
        ];
        let result = unsafe { apply(&records) };

        match result {
            Err(ApplyError::Patch(PatchError::Mismatch { addr, .. })) => assert_eq!(addr, base),
            other => panic!("expected a precondition failure, got {other:?}"),
        }
        // Neither the mismatched record nor the one after it wrote anything.
        assert_eq!(&buf[..], [0x11, 0x22, 0x33, 0x44]);
    }
}
