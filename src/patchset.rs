//! # Patchset
//!
//! Everything specific to the one supported executable build: the version
//! signature, the interception target, and the full ordered patch list.
//!
//! Every address below was lifted from that build by reverse engineering
//! and means nothing anywhere else. The signature check is what keeps the
//! list from ever running against a different image.

use crate::config;
use crate::heap;
use crate::records::PatchRecord;
use crate::timing;

/// Address of the byte sequence identifying the supported build.
pub const VERSION_CHECK_ADDR: usize = 0x0086_0c6b;

/// Sequence found at [`VERSION_CHECK_ADDR`] in the supported build only.
pub const VERSION_SIGNATURE: &[u8] = &[0xc7, 0x45, 0xfc, 0xfe, 0xff, 0xff, 0xff];

/// Shown when the signature check fails outside debug builds.
pub const WRONG_VERSION_WARNING: &str = "You are using an executable version not supported by this patch (most likely 1.154)!\n\n\
    A 1.200 executable is strongly recommended - retail versions have an official 1.200 patch, \
    and Steam installs 1.200 by default (verify the game's files if in doubt).";

/// Module whose import table carries the hijacked routine.
pub const HIJACKED_MODULE: &str = "USER32.DLL";

/// Loader-resolved routine the interception rides on. The host calls it
/// during startup, after import resolution and before any patched code can
/// run, and it is nowhere near any hot path.
pub const HIJACKED_IMPORT: &str = "SystemParametersInfoA";

/// Section holding the code patch sites.
pub const CODE_SECTION: &[u8] = b".text";

/// Configuration section the frame-cap override lives under.
pub const CONFIG_SECTION: &str = "Patch";

/// Configuration key for the frame-cap override.
pub const FPS_LIMIT_KEY: &str = "FPSLimit";

/// Flag written over the stream-open mode: overlapped instead of
/// unbuffered I/O.
const FILE_FLAG_OVERLAPPED: u32 = 0x4000_0000;

/// Builds the full ordered patch list for the supported build.
///
/// `fps_limit` is the configured frame-cap override; [`config::ABSENT`]
/// leaves the game's own cap untouched, zero or a negative value removes
/// the cap entirely.
pub fn records(fps_limit: i32) -> Vec<PatchRecord> {
    let mut records = vec![
        // The custom heap's entry points, routed onto the ambient allocator.
        PatchRecord::jump(0x5e_e630, heap::init as usize),
        PatchRecord::jump(0x5e_e5a0, heap::shutdown as usize),
        PatchRecord::jump(0x5e_e830, heap::alloc as usize),
        PatchRecord::jump(0x5e_e940, heap::free as usize),
        PatchRecord::jump(0x5e_e9c0, heap::alloc_aligned as usize),
        PatchRecord::jump(0x5e_ea70, heap::free_aligned as usize),
        PatchRecord::jump(0x5e_eef0, heap::free_stdcall as usize),
        PatchRecord::jump(0x5e_f4d0, heap::move_memory as usize),
        PatchRecord::jump(0x5e_edd0, heap::bytes_used as usize),
        // The ped-type shutdown freed its pointers twice; route the frees
        // through the nulling helper.
        PatchRecord::write(0x49_9cd8, [0x56]),
        PatchRecord::call(0x49_9cd9, heap::free_and_null as usize),
        // The audio manager's terminate path used memory its own mission
        // cleanup had already freed; drop the cleanup call.
        PatchRecord::nop(0x59_63c3, 5),
        // Streaming's space checks read their upper bound through this
        // slot; point it at the fake bound.
        PatchRecord::write(
            0xd1_41a8,
            (&heap::FAKE_UPPER_BOUND as *const usize as usize).to_le_bytes(),
        ),
        // Collision vertex loading used the wrong stride once the
        // allocator was replaced.
        PatchRecord::write(0x42_be80 + 2, [16]),
        // The in-game FPS limiter slept on its own; the timer replacement
        // waits instead.
        PatchRecord::nop(0x40_61c4, 2 + 6),
        PatchRecord::call_capturing(
            0x43_d660,
            timing::update_timer_and_sleep as usize,
            &timing::ORIGINAL_UPDATE_TIMER,
        ),
    ];

    // With a busy loop in place of the sleep, the 31 FPS cap effectively
    // becomes 30, so the cap is reprogrammable.
    if fps_limit != config::ABSENT {
        let cap = if fps_limit > 0 { fps_limit } else { i32::MAX };
        records.push(PatchRecord::write(0x40_618f + 1, cap.to_le_bytes()));
    }

    records.extend([
        // Put back the comparison bytes the third-party 60 FPS executable
        // patch rewrote; they are redundant now.
        PatchRecord::write(0x40_61be + 1, [0x04]),
        PatchRecord::write(0x40_61c2, [0x73]),
        // Unbuffered stream opens forced sector-aligned reads; overlapped
        // I/O does not.
        PatchRecord::write(0x73_abea + 6, FILE_FLAG_OVERLAPPED.to_le_bytes()),
        // These sites treated the player count as a size where an ID was
        // meant, overrunning the last slot.
        PatchRecord::nop(0x6f_b302, 6),
        PatchRecord::nop(0x6f_b3eb, 6),
        PatchRecord::nop(0x6f_c920, 2),
        PatchRecord::nop(0x6f_c945, 2),
        PatchRecord::nop(0x6f_c94f, 2),
        PatchRecord::nop(0x6f_c97c, 2),
        PatchRecord::nop(0x6f_ce91, 2),
    ]);

    records
}
