//! The emulator runtime: loads a system description, spawns one host
//! process per protection domain, and wires them together with the
//! primitives `microkit-api` expects to find.
//!
//! Two binaries sit on top of this crate: `microkit-run`, the loader CLI a
//! user invokes with a system description, and `microkit-pd-host`, the
//! generic per-PD process `microkit-run` spawns, which binds a payload and
//! runs its dispatch loop. Both are thin; nearly everything lives here so
//! it can be tested without forking real processes.

pub mod binder;
pub mod dispatch;
pub mod endpoint;
pub mod loader;
pub mod registry;

pub use loader::Loader;
pub use registry::Registry;

use std::sync::atomic::AtomicU64;

use emukit_abi::manifest::HANDLES_ENV_VAR;
use emukit_abi::HandleManifest;
use nix::sys::eventfd::EventFd;
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use std::os::fd::FromRawFd;

/// The body of `microkit-pd-host`: recovers this process's handle manifest
/// and payload path from the environment, binds the payload, runs `init`,
/// then runs the dispatch loop until the system is torn down.
///
/// Returns the process exit code to use.
pub fn run_pd_host(pd_name: &str) -> i32 {
    let manifest = match read_manifest() {
        Ok(m) => m,
        Err(e) => {
            log::error!("pd {pd_name}: {e}");
            return 1;
        }
    };
    let payload_path = match std::env::var("MICROKIT_PAYLOAD") {
        Ok(p) => p,
        Err(_) => {
            log::error!("pd {pd_name}: MICROKIT_PAYLOAD is not set");
            return 1;
        }
    };

    // Safety: the loader built this manifest for exactly this process and
    // named a payload built for the microkit-api payload ABI.
    let payload = match unsafe { binder::bind(std::path::Path::new(&payload_path), &manifest.regions) } {
        Ok(p) => p,
        Err(e) => {
            log::error!("pd {pd_name}: {e}");
            return 1;
        }
    };

    // Safety: `init` is called exactly once, before the dispatch loop starts
    // delivering events, matching the payload ABI's startup contract.
    unsafe { (payload.init)() };

    // Safety: `own.notify_fd` is this process's own doorbell, inherited
    // across `exec` with CLOEXEC cleared, and owned exclusively by this
    // process from here on.
    let owned_notify = unsafe { std::os::fd::OwnedFd::from_raw_fd(manifest.own.notify_fd) };
    let notify = unsafe { EventFd::from_owned_fd(owned_notify) };
    let mask = match map_mask(manifest.own.mask_fd) {
        Ok(m) => m,
        Err(e) => {
            log::error!("pd {pd_name}: failed to map notification mask: {e}");
            return 1;
        }
    };

    // Safety: `notify`, `mask`, and `send_rx_fd` were all established by the
    // loader for this process before it was spawned.
    let dispatcher = unsafe { dispatch::Dispatcher::new(notify, mask, manifest.own.send_rx_fd) };
    dispatcher.run(&payload);
    0
}

fn read_manifest() -> Result<HandleManifest, String> {
    let raw = std::env::var(HANDLES_ENV_VAR).map_err(|_| format!("{HANDLES_ENV_VAR} is not set"))?;
    HandleManifest::from_env_value(&raw).map_err(|e| format!("malformed {HANDLES_ENV_VAR}: {e}"))
}

fn map_mask(fd: i32) -> nix::Result<*const AtomicU64> {
    // Safety: `fd` names an 8-byte `memfd` the loader created for this PD's
    // notification mask and left open across `exec`.
    let addr = unsafe {
        mmap(
            None,
            std::num::NonZeroUsize::new(std::mem::size_of::<u64>()).unwrap(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            std::os::fd::BorrowedFd::borrow_raw(fd),
            0,
        )
    }?;
    Ok(addr.as_ptr() as *const AtomicU64)
}
