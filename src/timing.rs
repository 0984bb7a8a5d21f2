//! # Timing
//!
//! The frame-timing replacement.
//!
//! Minimized, the host spins on its timer-update routine without ever
//! yielding. The replacement forwards to the original routine and then
//! waits a fixed 100 ms, turning the spin into a slow poll. The byte
//! patches that used to make the host sleep elsewhere are removed by the
//! patch list, so this wait replaces the old behavior instead of stacking
//! with it.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// How long every timer update waits before returning.
const UPDATE_WAIT: Duration = Duration::from_millis(100);

/// Signature of the host's timer-update routine.
type UpdateTimer = unsafe extern "C" fn(bool);

/// Call target found at the redirect site before it was overwritten; the
/// patch list captures it as it writes the redirect.
pub static ORIGINAL_UPDATE_TIMER: AtomicUsize = AtomicUsize::new(0);

/// Replacement timer update: runs the original routine, then waits.
///
/// # Safety
///
/// [`ORIGINAL_UPDATE_TIMER`] must hold the original routine's address,
/// which the capturing redirect record guarantees before this replacement
/// becomes reachable.
pub unsafe extern "C" fn update_timer_and_sleep(capture_input: bool) {
    let original: UpdateTimer = mem::transmute(ORIGINAL_UPDATE_TIMER.load(Ordering::SeqCst));
    original(capture_input);
    thread::sleep(UPDATE_WAIT);
}
