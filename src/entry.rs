//! # Entry
//!
//! Where the patcher meets the host process: the attach-time installer,
//! the interception trampolines, and the one-shot trigger that runs the
//! patch list.
//!
//! The attach entry point only records state and arms the interception.
//! All real work waits until the host itself calls the hijacked routine,
//! which is the first moment the loader is guaranteed to be done and the
//! last moment before the host's own logic starts running.

use std::ffi::c_void;
use std::fs::File;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use crate::config;
use crate::hijack::{self, Hijack, PrologueHook};
use crate::image;
use crate::patchset;
use crate::records;
use crate::verify;

/// Process-lifetime state recorded once at attach.
#[derive(Default)]
struct PatchContext {
    /// Base address of the host executable image.
    host_base: usize,
    /// This module's own path; the configuration file sits beside it.
    module_path: Option<PathBuf>,
}

lazy_static! {
    /// The one context instance; written at attach, read by the trigger.
    static ref CONTEXT: Mutex<PatchContext> = Mutex::new(PatchContext::default());
}

/// Address the trampolines forward to: the routine the loader had bound,
/// or the routine itself on the prologue-overwrite path.
static FORWARD_TO: AtomicUsize = AtomicUsize::new(0);

/// Armed fallback hook, present only when the import swap was unavailable.
static PROLOGUE_HOOK: OnceLock<PrologueHook> = OnceLock::new();

/// Flips when the patch list has run; later triggers do nothing.
static PATCHED: AtomicBool = AtomicBool::new(false);

/// ABI of the hijacked UI-settings query routine.
type SystemParametersInfo = unsafe extern "system" fn(u32, u32, *mut c_void, u32) -> i32;

/// Records attach-time state, starts logging, and arms the interception.
pub fn attach(host_base: usize, module_path: Option<PathBuf>) {
    init_logging(module_path.as_deref());
    info!("attached to host image at {host_base:#x}");

    if let Ok(mut context) = CONTEXT.lock() {
        context.host_base = host_base;
        context.module_path = module_path;
    }

    install_hooks(host_base);
}

/// Installs the loader-import interception against the host image.
fn install_hooks(host_base: usize) {
    let installed = unsafe {
        hijack::install(
            host_base as *const u8,
            patchset::HIJACKED_MODULE,
            patchset::HIJACKED_IMPORT,
            system_parameters_info_hook as usize,
            system_parameters_info_overwriting_hook as usize,
            resolve_hijacked_import,
        )
    };

    match installed {
        Ok(Hijack::Import { original }) => {
            FORWARD_TO.store(original, Ordering::SeqCst);
            debug!("import slot swapped; original routine at {original:#x}");
        }
        Ok(Hijack::Prologue(hook)) => {
            FORWARD_TO.store(hook.target(), Ordering::SeqCst);
            let _ = PROLOGUE_HOOK.set(hook);
            debug!("import entry not found by name; prologue hijack armed");
        }
        Err(err) => {
            // Nothing will ever fire the trigger; the host runs unpatched.
            error!("could not install the interception: {err}");
        }
    }
}

/// Trampoline sitting in the import slot: fires the one-shot trigger, then
/// forwards with the caller's exact arguments.
unsafe extern "system" fn system_parameters_info_hook(
    action: u32,
    ui_param: u32,
    pv_param: *mut c_void,
    win_ini: u32,
) -> i32 {
    trigger();
    let forward: SystemParametersInfo = mem::transmute(FORWARD_TO.load(Ordering::SeqCst));
    forward(action, ui_param, pv_param, win_ini)
}

/// Trampoline reached through the jump written over the routine's own
/// prologue. The first caller puts the saved bytes back; from then on the
/// forward call below runs the routine as if it had never been touched.
unsafe extern "system" fn system_parameters_info_overwriting_hook(
    action: u32,
    ui_param: u32,
    pv_param: *mut c_void,
    win_ini: u32,
) -> i32 {
    if let Some(hook) = PROLOGUE_HOOK.get() {
        if let Err(err) = hook.restore() {
            // With the jump still on site, forwarding would land straight
            // back here.
            panic!("could not restore the hijacked prologue: {err}");
        }
    }
    system_parameters_info_hook(action, ui_param, pv_param, win_ini)
}

/// Runs `body` on the first call for `flag`; every later call is a no-op.
fn run_once(flag: &AtomicBool, body: impl FnOnce()) {
    if !flag.swap(true, Ordering::SeqCst) {
        body();
    }
}

/// The idempotently guarded orchestrator trigger behind the interception.
fn trigger() {
    run_once(&PATCHED, apply_patches);
}

/// The orchestrator: verifies the build, lifts code-section protection,
/// and applies the full patch list.
fn apply_patches() {
    let (host_base, module_path) = match CONTEXT.lock() {
        Ok(context) => (context.host_base, context.module_path.clone()),
        Err(_) => return,
    };

    let supported = unsafe {
        verify::image_matches(patchset::VERSION_CHECK_ADDR, patchset::VERSION_SIGNATURE)
    };
    if !supported {
        warn!(
            "build signature mismatch at {:#x}; nothing will be patched",
            patchset::VERSION_CHECK_ADDR
        );
        warn_wrong_version();
        return;
    }

    // Code-section protection comes back when this handle drops, the early
    // return paths included. Individual records still lift protection for
    // the sites outside the section.
    let section = unsafe { image::section_bounds(host_base as *const u8, patchset::CODE_SECTION) };
    let _text_guard = section.and_then(|(start, len)| {
        unsafe {
            region::protect_with_handle(start as *const u8, len, region::Protection::all())
        }
        .map_err(|err| error!("could not lift code-section protection: {err}"))
        .ok()
    });

    let fps_limit = module_path
        .as_deref()
        .map(config::ini_path)
        .map(|path| {
            config::int_option(
                &path,
                patchset::CONFIG_SECTION,
                patchset::FPS_LIMIT_KEY,
                config::ABSENT,
            )
        })
        .unwrap_or(config::ABSENT);

    let patches = patchset::records(fps_limit);
    match unsafe { records::apply(&patches) } {
        Ok(()) => info!("applied {} patch records", patches.len()),
        Err(err) if cfg!(debug_assertions) => panic!("patch application failed: {err}"),
        Err(err) => error!("patch application aborted: {err}"),
    }
}

/// Starts the file logger beside the module. Logging is best-effort; when
/// the file cannot be created the facade stays uninitialised.
fn init_logging(module_path: Option<&Path>) {
    let Some(path) = module_path else {
        return;
    };
    if let Ok(file) = File::create(path.with_extension("log")) {
        let _ = WriteLogger::init(LevelFilter::Debug, Config::default(), file);
    }
}

/// Resolves the hijacked routine's address directly, for the fallback path
/// that works without the import table.
#[cfg(windows)]
fn resolve_hijacked_import() -> Option<usize> {
    use std::ffi::CString;

    use windows::core::PCSTR;
    use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};

    let module = CString::new(patchset::HIJACKED_MODULE).ok()?;
    let import = CString::new(patchset::HIJACKED_IMPORT).ok()?;
    unsafe {
        let handle = GetModuleHandleA(PCSTR(module.as_ptr() as *const u8)).ok()?;
        GetProcAddress(handle, PCSTR(import.as_ptr() as *const u8)).map(|address| address as usize)
    }
}

/// Without the OS loader there is nothing to resolve against.
#[cfg(not(windows))]
fn resolve_hijacked_import() -> Option<usize> {
    None
}

/// Blocks on a warning dialog naming the likely cause of the signature
/// mismatch.
#[cfg(all(windows, not(debug_assertions)))]
fn warn_wrong_version() {
    use windows::core::{w, PCWSTR};
    use windows::Win32::UI::WindowsAndMessaging::{MessageBoxW, MB_ICONWARNING, MB_OK};

    let text: Vec<u16> = patchset::WRONG_VERSION_WARNING
        .encode_utf16()
        .chain([0])
        .collect();
    unsafe {
        MessageBoxW(None, PCWSTR(text.as_ptr()), w!("retrofix"), MB_OK | MB_ICONWARNING);
    }
}

/// Debug builds and foreign platforms keep the mismatch in the log only.
#[cfg(not(all(windows, not(debug_assertions))))]
fn warn_wrong_version() {}

/// OS attach entry point: records the module handle and arms the
/// interception, nothing more. Returns success unconditionally.
#[cfg(windows)]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn DllMain(
    module: *mut c_void,
    reason: u32,
    _reserved: *mut c_void,
) -> i32 {
    /// Attach notification code; the other notifications are ignored.
    const DLL_PROCESS_ATTACH: u32 = 1;

    if reason == DLL_PROCESS_ATTACH {
        let module_path = module_file_name(module);
        let host_base = host_image_base();
        attach(host_base, module_path);
    }
    1
}

/// Path of the module loaded at `module`.
#[cfg(windows)]
fn module_file_name(module: *mut c_void) -> Option<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::GetModuleFileNameW;

    let mut buffer = [0u16; 260];
    let len = unsafe { GetModuleFileNameW(HMODULE(module), &mut buffer) } as usize;
    if len == 0 {
        return None;
    }
    Some(PathBuf::from(OsString::from_wide(&buffer[..len])))
}

/// Base address of the process's main executable image.
#[cfg(windows)]
fn host_image_base() -> usize {
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;

    unsafe { GetModuleHandleW(None) }
        .map(|handle| handle.0 as usize)
        .unwrap_or(0)
}
