//! # Hijack
//!
//! Getting control at the right moment.
//!
//! The host never calls into this patcher on its own, so one of its
//! loader-resolved imports is made to do it: a routine the host is known to
//! call while starting up, after the dynamic loader has finished and before
//! any of the code the patch list touches can run. The primary strategy
//! swaps the routine's import-table slot for a trampoline. When the slot
//! cannot be found by name, the fallback overwrites the routine's own
//! prologue with a jump instead, saving the original bytes so the first
//! interception can put them back.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::code;
use crate::image;
use crate::patch::{self, PatchError};

/// Bytes saved from the hijacked routine's prologue on the fallback path.
pub const SAVED_PROLOGUE_LEN: usize = code::REDIRECT_LEN;

/// Errors while installing the interception.
#[derive(Debug, Error)]
pub enum HijackError {
    /// The import table has no usable name entry for the routine.
    #[error("{import} not found in the {module} import entries")]
    ImportNotFound {
        /// Module the import was looked for under.
        module: &'static str,
        /// Name of the missing import.
        import: &'static str,
    },
    /// The routine's address could not be resolved for the fallback.
    #[error("the hijacked routine's address could not be resolved")]
    Unresolvable,
    /// A write at the slot or the prologue failed.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// A trampoline was out of jump range of its site.
    #[error(transparent)]
    Displacement(#[from] code::DisplacementError),
}

/// How the interception ended up installed.
pub enum Hijack {
    /// The import slot was swapped.
    Import {
        /// Address the loader had bound into the slot, kept for forwarding.
        original: usize,
    },
    /// The routine's prologue was overwritten in place.
    Prologue(PrologueHook),
}

/// Swaps the resolved address in the import slot for `import` from
/// `module` in the image at `base` with `replacement`, returning the
/// address the loader had bound there.
///
/// The slot's page protection is lifted for just the one pointer write and
/// restored before returning.
///
/// # Safety
///
/// `base` must point at a loaded module image whose headers and import
/// directory are valid for reads; the found slot must be safe to rebind.
pub unsafe fn swap_import_slot(
    base: *const u8,
    module: &'static str,
    import: &'static str,
    replacement: usize,
) -> Result<usize, HijackError> {
    let slot = image::find_import_slot(base, module, import)
        .ok_or(HijackError::ImportNotFound { module, import })?;

    let original = ptr::read(slot);
    patch::write(slot as usize, &replacement.to_le_bytes())?.commit();
    Ok(original)
}

/// Fallback hijack over the routine's own first bytes.
///
/// Armed, the routine starts with a jump into the overwriting trampoline.
/// That trampoline's first duty is [`PrologueHook::restore`], which puts
/// the saved bytes back so every later call runs the routine untouched.
/// The two states are armed and fired-and-restored; there is no way back.
pub struct PrologueHook {
    /// Address of the hijacked routine.
    target: usize,
    /// Prologue bytes as they were before arming.
    saved: [u8; SAVED_PROLOGUE_LEN],
    /// Flips once, when the saved bytes go back.
    restored: AtomicBool,
}

impl PrologueHook {
    /// Saves the routine's prologue and overwrites it with a jump to
    /// `trampoline`.
    ///
    /// # Safety
    ///
    /// `target` must be a routine at least [`SAVED_PROLOGUE_LEN`] bytes
    /// long that no other thread executes while the jump is being written.
    pub unsafe fn arm(target: usize, trampoline: usize) -> Result<Self, HijackError> {
        let mut saved = [0u8; SAVED_PROLOGUE_LEN];
        ptr::copy(target as *const u8, saved.as_mut_ptr(), SAVED_PROLOGUE_LEN);

        let jump = code::jmp_rel(target, trampoline)?;
        patch::write(target, &jump)?.commit();

        Ok(Self {
            target,
            saved,
            restored: AtomicBool::new(false),
        })
    }

    /// Puts the saved prologue back. The first call does the write; every
    /// later call is a no-op. Returns whether this call restored.
    ///
    /// # Safety
    ///
    /// The routine at the target must not be executing while its first
    /// bytes are rewritten.
    pub unsafe fn restore(&self) -> Result<bool, HijackError> {
        if self.restored.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        patch::write(self.target, &self.saved)?.commit();
        Ok(true)
    }

    /// Address of the hijacked routine.
    pub fn target(&self) -> usize {
        self.target
    }

    /// The prologue bytes captured at arm time.
    pub fn saved(&self) -> &[u8; SAVED_PROLOGUE_LEN] {
        &self.saved
    }
}

/// Installs the interception: the import-table swap when the entry can be
/// found by name, the prologue overwrite otherwise.
///
/// `resolve` supplies the routine's direct address for the fallback, which
/// needs no import table. There is no further recovery: if the fallback
/// fails too, the error surfaces and the host runs unpatched.
///
/// # Safety
///
/// Combines the requirements of [`swap_import_slot`] and
/// [`PrologueHook::arm`]; `trampoline` and `overwriting_trampoline` must
/// stay callable for the life of the process.
pub unsafe fn install(
    base: *const u8,
    module: &'static str,
    import: &'static str,
    trampoline: usize,
    overwriting_trampoline: usize,
    resolve: impl FnOnce() -> Option<usize>,
) -> Result<Hijack, HijackError> {
    match swap_import_slot(base, module, import, trampoline) {
        Ok(original) => Ok(Hijack::Import { original }),
        Err(HijackError::ImportNotFound { .. }) => {
            let target = resolve().ok_or(HijackError::Unresolvable)?;
            let hook = PrologueHook::arm(target, overwriting_trampoline)?;
            Ok(Hijack::Prologue(hook))
        }
        Err(err) => Err(err),
    }
}
