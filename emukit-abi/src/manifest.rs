//! The handle manifest: how a spawned PD process recovers its endpoints.
//!
//! Raw virtual addresses and process-local file descriptor tables don't
//! cross `exec`. What *does* cross is the numeric value of a file descriptor
//! that was opened in the loader before any PD was spawned and never closed
//! on exec (see `emukit-runtime`'s spawn code) -- every process forked from
//! that loader keeps the identical descriptor table entry for the identical
//! underlying pipe, eventfd, or memfd. The manifest is the loader's way of
//! telling a freshly-exec'd process which role each of those numbers plays.
//!
//! The loader builds one `HandleManifest` per PD and serializes it into that
//! PD's `MICROKIT_HANDLES` environment variable as JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const HANDLES_ENV_VAR: &str = "MICROKIT_HANDLES";

/// The endpoints a PD exposes to the rest of the system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PdHandles {
    /// Counting notification endpoint (a Linux `eventfd`) -- a doorbell only;
    /// it carries no payload of its own.
    pub notify_fd: i32,
    /// `memfd` holding an 8-byte pending-channel bitmask. `notify(ch)` sets
    /// bit `ch` here before ringing `notify_fd`, so that several
    /// notifications on distinct channels arriving before the receiver
    /// drains still each produce their own `notified` call, while repeated
    /// notifications on the *same* channel coalesce.
    pub mask_fd: i32,
    /// Write end of this PD's send pipe -- how a peer delivers a PPC request.
    pub send_tx_fd: i32,
    /// Write end of this PD's receive pipe -- how a callee delivers a reply.
    pub recv_tx_fd: i32,
    /// `memfd` backing this PD's IPC buffer.
    pub ipc_fd: i32,
    pub ipc_size: usize,
}

/// The endpoints a PD needs privately, to run its own dispatch loop and make
/// its own outgoing calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OwnHandles {
    pub notify_fd: i32,
    pub mask_fd: i32,
    /// Read end of this PD's own send pipe -- incoming PPC requests.
    pub send_rx_fd: i32,
    /// Read end of this PD's own receive pipe -- replies to its own calls.
    pub recv_rx_fd: i32,
    /// Write end of this PD's own receive pipe, handed to callees as
    /// `send_back` so they know where to deliver a reply.
    pub recv_tx_fd: i32,
    pub ipc_fd: i32,
    pub ipc_size: usize,
}

/// A shared-region binding the binder must resolve in the payload's symbol
/// table before calling `init`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionBinding {
    pub variable: String,
    pub fd: i32,
    pub size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandleManifest {
    pub self_id: u32,
    pub own: OwnHandles,
    /// Channel id -> peer PD id, this PD's channel table.
    pub channels: BTreeMap<u32, u32>,
    /// Every PD id reachable through `channels`, mapped to its public
    /// handles.
    pub peers: BTreeMap<u32, PdHandles>,
    pub regions: Vec<RegionBinding>,
}

impl HandleManifest {
    pub fn to_env_value(&self) -> String {
        serde_json::to_string(self).expect("HandleManifest always serializes")
    }

    pub fn from_env_value(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }
}
