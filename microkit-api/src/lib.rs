//! The Microkit API: the library every protection domain payload links
//! against.
//!
//! This is the host-process analogue of Hubris's `userlib`: a thin,
//! ergonomic layer over raw syscalls there, a thin layer over raw file
//! descriptors here. A payload never touches a pipe or an `eventfd`
//! directly -- it calls [`notify`], [`ppcall`], [`mr_set`]/[`mr_get`], and
//! [`msginfo_new`], and this crate does the rest.
//!
//! # Process-local context
//!
//! Exactly one PD runs per host process, so the state this crate needs
//! (its own endpoints, and the endpoints of every peer reachable through its
//! channel table) lives in a single process-local [`PdContext`], built once
//! on first use from the `MICROKIT_HANDLES` environment variable the loader
//! set before `exec`. This is the "single narrowly-scoped process-local
//! container" the design favors over the ambient mutable globals of the
//! original kernel -- there is nothing here for a second PD to collide with,
//! because a second PD is a second process.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use emukit_abi::manifest::HANDLES_ENV_VAR;
use emukit_abi::{ApiError, HandleManifest, IPC_BUFFER_SIZE, MessageRegister};

pub use emukit_abi::MsgInfo;
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::unistd::{read, write};

struct PeerContext {
    notify_fd: RawFd,
    mask: *const AtomicU64,
    send_tx_fd: RawFd,
    ipc: *mut MessageRegister,
    ipc_words: usize,
}

struct PdContext {
    recv_rx_fd: RawFd,
    recv_tx_fd: RawFd,
    own_ipc: *mut MessageRegister,
    own_ipc_words: usize,
    channels: HashMap<u32, u32>,
    peers: HashMap<u32, PeerContext>,
}

// Safety: the raw pointers here address `mmap`'d shared memory that lives
// for the lifetime of the process, and this crate's own API enforces that
// at most one of `init`/`notified`/`protected` runs at a time, so there is
// no concurrent access to guard against within a single PD.
unsafe impl Send for PdContext {}
unsafe impl Sync for PdContext {}

static CONTEXT: OnceLock<PdContext> = OnceLock::new();

fn context() -> &'static PdContext {
    CONTEXT.get_or_init(|| {
        let raw = std::env::var(HANDLES_ENV_VAR).unwrap_or_else(|_| {
            fatal_str(&format!(
                "{HANDLES_ENV_VAR} is not set; this payload was not started by the microkit-run loader"
            ))
        });
        let manifest = HandleManifest::from_env_value(&raw)
            .unwrap_or_else(|e| fatal_str(&format!("malformed {HANDLES_ENV_VAR}: {e}")));
        build_context(&manifest)
    })
}

fn build_context(manifest: &HandleManifest) -> PdContext {
    let own_ipc = map_ipc(manifest.own.ipc_fd, manifest.own.ipc_size);
    let mut peers = HashMap::with_capacity(manifest.peers.len());
    for (&pd_id, handles) in &manifest.peers {
        let ipc = map_ipc(handles.ipc_fd, handles.ipc_size);
        let mask = map_mask(handles.mask_fd);
        peers.insert(
            pd_id,
            PeerContext {
                notify_fd: handles.notify_fd,
                mask,
                send_tx_fd: handles.send_tx_fd,
                ipc,
                ipc_words: handles.ipc_size / std::mem::size_of::<MessageRegister>(),
            },
        );
    }
    PdContext {
        recv_rx_fd: manifest.own.recv_rx_fd,
        recv_tx_fd: manifest.own.recv_tx_fd,
        own_ipc,
        own_ipc_words: manifest.own.ipc_size / std::mem::size_of::<MessageRegister>(),
        channels: manifest.channels.iter().map(|(&ch, &pd)| (ch, pd)).collect(),
        peers,
    }
}

fn map_ipc(fd: RawFd, size: usize) -> *mut MessageRegister {
    // Safety: `fd` names a `memfd` of at least `size` bytes that the loader
    // created and left open across `exec` for exactly this purpose.
    let addr = unsafe {
        mmap(
            None,
            std::num::NonZeroUsize::new(size).expect("ipc buffer size must be nonzero"),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            std::os::fd::BorrowedFd::borrow_raw(fd),
            0,
        )
    }
    .unwrap_or_else(|e| fatal_str(&format!("failed to map ipc buffer: {e}")));
    addr.as_ptr() as *mut MessageRegister
}

fn map_mask(fd: RawFd) -> *const AtomicU64 {
    // Safety: `fd` names an 8-byte `memfd` the loader created for this PD's
    // pending-notification bitmask and left open across `exec`.
    let addr = unsafe {
        mmap(
            None,
            std::num::NonZeroUsize::new(std::mem::size_of::<u64>()).unwrap(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            std::os::fd::BorrowedFd::borrow_raw(fd),
            0,
        )
    }
    .unwrap_or_else(|e| fatal_str(&format!("failed to map notification mask: {e}")));
    addr.as_ptr() as *const AtomicU64
}

fn fatal(err: ApiError) -> ! {
    fatal_str(&err.to_string())
}

fn fatal_str(msg: &str) -> ! {
    log::error!("fatal microkit-api error: {msg}");
    std::process::exit(1);
}

/// Sends an asynchronous notification on `ch`.
///
/// Fatal for this PD if `ch` has no peer bound, or if the peer has died.
pub fn notify(ch: u32) {
    let ctx = context();
    let peer_id = *ctx
        .channels
        .get(&ch)
        .unwrap_or_else(|| fatal(ApiError::UnboundChannel(ch)));
    let peer = ctx
        .peers
        .get(&peer_id)
        .expect("channel table and peer table are built together by the loader");
    // Set our bit in the peer's pending-notification mask first, then ring
    // its doorbell. The peer's dispatch loop swaps the whole mask out when it
    // wakes, so two notifies on the same channel before it drains collapse
    // into one `notified` call, while distinct channels each keep their bit.
    // Safety: `mask` addresses an 8-byte `memfd` mapped MAP_SHARED for the
    // lifetime of this process.
    unsafe { (*peer.mask).fetch_or(1 << ch, Ordering::SeqCst) };
    let bump: u64 = 1;
    // Safety: eventfd reads/writes are always exactly 8 bytes.
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(peer.notify_fd) };
    if write(fd, &bump.to_ne_bytes()).is_err() {
        fatal(ApiError::PeerGone(ch));
    }
}

/// Issues a protected procedure call on `ch` and blocks for the reply.
///
/// Fatal for this PD if `ch` has no peer bound, or if the peer dies before
/// replying.
pub fn ppcall(ch: u32, info: MsgInfo) -> MsgInfo {
    let ctx = context();
    let peer_id = *ctx
        .channels
        .get(&ch)
        .unwrap_or_else(|| fatal(ApiError::UnboundChannel(ch)));
    let peer = ctx
        .peers
        .get(&peer_id)
        .expect("channel table and peer table are built together by the loader");

    let count = info.count() as usize;
    assert!(count <= ctx.own_ipc_words.min(peer.ipc_words), "msginfo count exceeds ipc buffer");
    // Safety: both buffers are `mmap`'d for at least `count` words, and this
    // PD is single-threaded, so there is no concurrent writer.
    unsafe {
        std::ptr::copy_nonoverlapping(ctx.own_ipc, peer.ipc, count);
    }

    let mut record = [0u8; 24];
    record[0..8].copy_from_slice(&(ch as u64).to_ne_bytes());
    record[8..16].copy_from_slice(&info.into_raw().to_ne_bytes());
    record[16..24].copy_from_slice(&(ctx.recv_tx_fd as u64).to_ne_bytes());
    let send_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(peer.send_tx_fd) };
    if write(send_fd, &record).is_err() {
        fatal(ApiError::PeerGone(ch));
    }

    let mut reply_bytes = [0u8; 8];
    let recv_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(ctx.recv_rx_fd) };
    let n = read(recv_fd, &mut reply_bytes).unwrap_or(0);
    if n != reply_bytes.len() {
        fatal(ApiError::PeerGone(ch));
    }
    let reply = MsgInfo::from_raw(u64::from_ne_bytes(reply_bytes));

    let reply_count = (reply.count() as usize).min(ctx.own_ipc_words.min(peer.ipc_words));
    unsafe {
        std::ptr::copy_nonoverlapping(peer.ipc, ctx.own_ipc, reply_count);
    }
    reply
}

/// Writes message register `i` in this PD's own IPC buffer.
pub fn mr_set(i: usize, value: MessageRegister) {
    let ctx = context();
    assert!(i < IPC_BUFFER_SIZE, "message register index out of range");
    // Safety: `own_ipc` is mapped for at least `IPC_BUFFER_SIZE` words, and
    // this PD is single-threaded.
    unsafe {
        ctx.own_ipc.add(i).write_volatile(value);
    }
}

/// Reads message register `i` from this PD's own IPC buffer.
pub fn mr_get(i: usize) -> MessageRegister {
    let ctx = context();
    assert!(i < IPC_BUFFER_SIZE, "message register index out of range");
    // Safety: see `mr_set`.
    unsafe { ctx.own_ipc.add(i).read_volatile() }
}

/// Encodes a `label`/`count` pair into a `msginfo` word.
pub fn msginfo_new(label: u64, count: u32) -> MsgInfo {
    MsgInfo::new(label, count)
}

pub fn msginfo_get_label(info: MsgInfo) -> u64 {
    info.label()
}

pub fn msginfo_get_count(info: MsgInfo) -> u32 {
    info.count()
}
