//! The binder: runs inside a freshly-`exec`'d PD host process, before that
//! PD's dispatch loop starts. Loads the payload `cdylib`, patches its bound
//! shared-region symbols with the addresses this process mapped them at,
//! and resolves the three entry points the dispatch loop will call.
//!
//! Grounded on the same idea as a dynamic linker's symbol binding, just
//! happening once at startup instead of being the linker's whole job.

use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;

use emukit_abi::manifest::RegionBinding;
use emukit_abi::BindError;
use libloading::{Library, Symbol};
use nix::sys::mman::{mmap, MapFlags, ProtFlags};

pub type InitFn = unsafe extern "C" fn();
pub type NotifiedFn = unsafe extern "C" fn(u32);
pub type ProtectedFn = unsafe extern "C" fn(u32, u64) -> u64;

/// A loaded payload, with its entry points resolved. Kept alive for the
/// lifetime of the dispatch loop -- dropping `library` would unmap the code
/// these function pointers point into.
pub struct Payload {
    #[allow(dead_code)]
    library: Library,
    pub init: InitFn,
    pub notified: NotifiedFn,
    pub protected: Option<ProtectedFn>,
}

/// Maps every region binding at the address libloading will later see, then
/// loads the payload and writes each mapped address into its matching symbol.
///
/// # Safety
///
/// The caller must ensure `path` names a `cdylib` built for this payload ABI
/// -- one that exports `microkit_init`, `microkit_notified`, optionally
/// `microkit_protected`, and a pointer-sized symbol for every variable name
/// in `bindings`.
pub unsafe fn bind(path: &std::path::Path, bindings: &[RegionBinding]) -> Result<Payload, BindError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| BindError::MapFailed(format!("payload path {} is not valid UTF-8", path.display())))?;
    let library = unsafe { Library::new(path_str) }
        .map_err(|e| BindError::MapFailed(format!("failed to load payload {}: {e}", path.display())))?;

    for binding in bindings {
        let addr = map_region(binding)?;
        // Safety: the payload ABI promises a `*mut usize` symbol under this
        // name for every region it's bound to.
        unsafe {
            let symbol: Symbol<*mut usize> = library
                .get(binding.variable.as_bytes())
                .map_err(|_| BindError::MissingVariable(binding.variable.clone()))?;
            **symbol = addr;
        }
    }

    // Safety: the payload ABI promises these three symbols exist with these
    // signatures; `microkit_protected` is the one optional entry point.
    let init: InitFn = unsafe {
        *library
            .get::<InitFn>(b"microkit_init")
            .map_err(|_| BindError::MissingVariable("microkit_init".to_string()))?
    };
    let notified: NotifiedFn = unsafe {
        *library
            .get::<NotifiedFn>(b"microkit_notified")
            .map_err(|_| BindError::MissingVariable("microkit_notified".to_string()))?
    };
    let protected: Option<ProtectedFn> = unsafe {
        library
            .get::<ProtectedFn>(b"microkit_protected")
            .ok()
            .map(|s| *s)
    };

    Ok(Payload {
        library,
        init,
        notified,
        protected,
    })
}

fn map_region(binding: &RegionBinding) -> Result<usize, BindError> {
    let len = NonZeroUsize::new(binding.size)
        .ok_or_else(|| BindError::MapFailed(format!("region for {} has zero size", binding.variable)))?;
    // Safety: `binding.fd` names a `memfd` the loader created for this
    // region and left open across `exec`.
    let addr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            BorrowedFd::borrow_raw(binding.fd),
            0,
        )
    }
    .map_err(|e| BindError::MapFailed(e.to_string()))?;
    Ok(addr.as_ptr() as usize)
}
