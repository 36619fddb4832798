//! Construction of the raw host-OS primitives a protection domain is built
//! from: a doorbell `eventfd`, a pending-notification bitmask, a request/
//! reply pipe pair, and `memfd`-backed shared memory.
//!
//! Every primitive here is created with `CLOEXEC` cleared. That is the whole
//! trick behind the handle manifest: a PD process is `fork`+`exec`'d from
//! this loader process after every endpoint in the system already exists, so
//! as long as `exec` doesn't close them, the child inherits the identical
//! descriptor numbers its parent had. [`crate::registry::Registry`] hands
//! those numbers out to each child as a [`emukit_abi::HandleManifest`].

use std::os::fd::{AsFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::unistd::{ftruncate, pipe};
use std::ffi::CString;

fn clear_cloexec(fd: &impl AsFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

/// A counting doorbell: `notify_fd` in the handle manifest.
pub fn new_doorbell() -> nix::Result<OwnedFd> {
    let efd = EventFd::from_value_and_flags(0, EfdFlags::empty())?;
    clear_cloexec(&efd)?;
    Ok(OwnedFd::from(efd))
}

/// An 8-byte `memfd` holding the pending-notification bitmask: `mask_fd` in
/// the handle manifest. Starts zeroed, as `memfd_create` always does.
pub fn new_mask() -> nix::Result<OwnedFd> {
    new_memfd("microkit-mask", 8)
}

/// A `memfd` of `size` bytes, used for IPC buffers and shared regions alike.
pub fn new_memfd(name: &str, size: usize) -> nix::Result<OwnedFd> {
    let cname = CString::new(name).expect("endpoint name has no interior NUL");
    let fd = memfd_create(cname.as_c_str(), MFdFlags::empty())?;
    ftruncate(&fd, size as i64)?;
    clear_cloexec(&fd)?;
    Ok(fd)
}

/// A pipe, returned `(read_end, write_end)`, both surviving `exec`.
pub fn new_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (rx, tx) = pipe()?;
    clear_cloexec(&rx)?;
    clear_cloexec(&tx)?;
    Ok((rx, tx))
}
