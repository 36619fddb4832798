//! The registry: in-memory bookkeeping for every PD and region in a running
//! system, and the handles that back them.
//!
//! This is the host-process equivalent of the kernel's object table --
//! except there's no kernel here, so the registry's records *are* the
//! objects. A [`crate::Loader`] builds one from a [`SystemDescription`],
//! then uses it to spawn PDs and, at shutdown, to tear them back down.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use emukit_abi::{
    manifest::{HandleManifest, OwnHandles, PdHandles, RegionBinding},
    ChannelId, PdId, RegionId, RegistryError, SystemDescription, MAX_PDS,
};

use crate::endpoint;

pub struct PdRecord {
    pub name: String,
    pub stack_size: usize,
    pub payload: Option<PathBuf>,
    notify: OwnedFd,
    mask: OwnedFd,
    send_rx: OwnedFd,
    send_tx: OwnedFd,
    recv_rx: OwnedFd,
    recv_tx: OwnedFd,
    ipc: OwnedFd,
    ipc_size: usize,
    channels: HashMap<u32, PdId>,
    binds: Vec<(RegionId, String)>,
    pub child: Option<std::process::Child>,
}

pub struct RegionRecord {
    pub name: String,
    pub size: usize,
    pub fd: OwnedFd,
}

/// The IPC buffer every PD gets, sized to hold a full message.
const IPC_BYTES: usize = emukit_abi::IPC_BUFFER_SIZE * std::mem::size_of::<emukit_abi::MessageRegister>();

#[derive(Default)]
pub struct Registry {
    pds: Vec<PdRecord>,
    pd_index: HashMap<String, PdId>,
    regions: Vec<RegionRecord>,
    region_index: HashMap<String, RegionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pd(&self, id: PdId) -> &PdRecord {
        &self.pds[id.0 as usize]
    }

    pub fn pd_mut(&mut self, id: PdId) -> &mut PdRecord {
        &mut self.pds[id.0 as usize]
    }

    pub fn region(&self, id: RegionId) -> &RegionRecord {
        &self.regions[id.0 as usize]
    }

    pub fn pd_ids(&self) -> impl Iterator<Item = PdId> + '_ {
        (0..self.pds.len()).map(|i| PdId(i as u32))
    }

    pub fn find_pd(&self, name: &str) -> Option<PdId> {
        self.pd_index.get(name).copied()
    }

    pub fn find_region(&self, name: &str) -> Option<RegionId> {
        self.region_index.get(name).copied()
    }

    pub fn create_pd(
        &mut self,
        name: &str,
        stack_size: usize,
        payload: Option<PathBuf>,
    ) -> Result<PdId, RegistryError> {
        if self.pd_index.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        if self.pds.len() >= MAX_PDS {
            return Err(RegistryError::TooManyPds(self.pds.len() + 1));
        }
        let notify = endpoint::new_doorbell().map_err(io_err)?;
        let mask = endpoint::new_mask().map_err(io_err)?;
        let (send_rx, send_tx) = endpoint::new_pipe().map_err(io_err)?;
        let (recv_rx, recv_tx) = endpoint::new_pipe().map_err(io_err)?;
        let ipc = endpoint::new_memfd("microkit-ipc", IPC_BYTES).map_err(io_err)?;

        let id = PdId(self.pds.len() as u32);
        self.pds.push(PdRecord {
            name: name.to_string(),
            stack_size,
            payload,
            notify,
            mask,
            send_rx,
            send_tx,
            recv_rx,
            recv_tx,
            ipc,
            ipc_size: IPC_BYTES,
            channels: HashMap::new(),
            binds: Vec::new(),
            child: None,
        });
        self.pd_index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn create_region(&mut self, name: &str, size: usize) -> Result<RegionId, RegistryError> {
        if self.region_index.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        let fd = endpoint::new_memfd("microkit-region", size).map_err(io_err)?;
        let id = RegionId(self.regions.len() as u32);
        self.regions.push(RegionRecord {
            name: name.to_string(),
            size,
            fd,
        });
        self.region_index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn bind_region(
        &mut self,
        pd: PdId,
        region: RegionId,
        variable: &str,
    ) -> Result<(), RegistryError> {
        if region.0 as usize >= self.regions.len() {
            return Err(RegistryError::UnknownRegion(region.0.to_string()));
        }
        self.pd_mut(pd).binds.push((region, variable.to_string()));
        Ok(())
    }

    /// Adds `ch` to `from`'s channel table, pointing at `to`. One-directional:
    /// callers wanting the reverse path must call this again with `from` and
    /// `to` swapped and a distinct channel id.
    pub fn connect(&mut self, from: PdId, to: PdId, ch: u32) -> Result<(), RegistryError> {
        let id = ChannelId(ch);
        if !id.in_range() {
            return Err(RegistryError::ChannelOutOfRange(ch));
        }
        if (to.0 as usize) >= self.pds.len() {
            return Err(RegistryError::UnknownPd(to.0.to_string()));
        }
        self.pd_mut(from).channels.insert(ch, to);
        Ok(())
    }

    /// Looks a PD and its bindings up by name, resolving every cross-reference
    /// in a [`SystemDescription`] and populating the registry accordingly.
    pub fn from_description(desc: &SystemDescription) -> Result<Self, RegistryError> {
        let mut reg = Registry::new();
        for pd in &desc.pds {
            reg.create_pd(&pd.name, pd.stack_size, pd.payload.as_ref().map(PathBuf::from))?;
        }
        for region in &desc.regions {
            reg.create_region(&region.name, region.size)?;
        }
        for binding in &desc.bindings {
            let pd = reg
                .find_pd(&binding.pd)
                .ok_or_else(|| RegistryError::UnknownPd(binding.pd.clone()))?;
            let region = reg
                .find_region(&binding.region)
                .ok_or_else(|| RegistryError::UnknownRegion(binding.region.clone()))?;
            reg.bind_region(pd, region, &binding.variable)?;
        }
        for channel in &desc.channels {
            let from = reg
                .find_pd(&channel.from)
                .ok_or_else(|| RegistryError::UnknownPd(channel.from.clone()))?;
            let to = reg
                .find_pd(&channel.to)
                .ok_or_else(|| RegistryError::UnknownPd(channel.to.clone()))?;
            reg.connect(from, to, channel.id)?;
        }
        Ok(reg)
    }

    /// Builds the handle manifest a given PD needs to recover its endpoints
    /// after `exec`, and the region bindings its binder must resolve.
    pub fn manifest_for(&self, pd: PdId) -> HandleManifest {
        let rec = self.pd(pd);
        let mut peers = std::collections::BTreeMap::new();
        // Every PD reachable through our channel table needs its public
        // handles mapped so we can notify or call it.
        for &target in rec.channels.values() {
            peers.entry(target.0).or_insert_with(|| self.public_handles(target));
        }
        let regions = rec
            .binds
            .iter()
            .map(|(region_id, variable)| {
                let region = self.region(*region_id);
                RegionBinding {
                    variable: variable.clone(),
                    fd: region.fd.as_raw_fd(),
                    size: region.size,
                }
            })
            .collect();
        HandleManifest {
            self_id: pd.0,
            own: OwnHandles {
                notify_fd: rec.notify.as_raw_fd(),
                mask_fd: rec.mask.as_raw_fd(),
                send_rx_fd: rec.send_rx.as_raw_fd(),
                recv_rx_fd: rec.recv_rx.as_raw_fd(),
                recv_tx_fd: rec.recv_tx.as_raw_fd(),
                ipc_fd: rec.ipc.as_raw_fd(),
                ipc_size: rec.ipc_size,
            },
            channels: rec.channels.iter().map(|(&ch, pd)| (ch, pd.0)).collect(),
            peers,
            regions,
        }
    }

    fn public_handles(&self, pd: PdId) -> PdHandles {
        let rec = self.pd(pd);
        PdHandles {
            notify_fd: rec.notify.as_raw_fd(),
            mask_fd: rec.mask.as_raw_fd(),
            send_tx_fd: rec.send_tx.as_raw_fd(),
            recv_tx_fd: rec.recv_tx.as_raw_fd(),
            ipc_fd: rec.ipc.as_raw_fd(),
            ipc_size: rec.ipc_size,
        }
    }

    /// Kills and reaps every PD that was spawned, best-effort.
    pub fn teardown(&mut self) {
        for pd in &mut self.pds {
            if let Some(mut child) = pd.child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

fn io_err(err: nix::Error) -> RegistryError {
    RegistryError::Io(err.to_string())
}

impl PdRecord {
    pub fn send_rx_raw(&self) -> std::os::fd::RawFd {
        self.send_rx.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_rejects_out_of_range_channel() {
        let mut reg = Registry::new();
        let a = reg.create_pd("a", 4096, None).unwrap();
        let b = reg.create_pd("b", 4096, None).unwrap();
        assert!(matches!(
            reg.connect(a, b, emukit_abi::MAX_CHANNELS_PER_PD as u32),
            Err(RegistryError::ChannelOutOfRange(_))
        ));
    }

    #[test]
    fn duplicate_pd_name_is_rejected() {
        let mut reg = Registry::new();
        reg.create_pd("a", 4096, None).unwrap();
        assert!(matches!(
            reg.create_pd("a", 4096, None),
            Err(RegistryError::DuplicateName(_))
        ));
    }

    #[test]
    fn manifest_includes_only_channel_peers() {
        let mut reg = Registry::new();
        let a = reg.create_pd("a", 4096, None).unwrap();
        let b = reg.create_pd("b", 4096, None).unwrap();
        let _c = reg.create_pd("c", 4096, None).unwrap();
        reg.connect(a, b, 0).unwrap();
        let manifest = reg.manifest_for(a);
        assert_eq!(manifest.peers.len(), 1);
        assert!(manifest.peers.contains_key(&b.0));
    }

    #[test]
    fn from_description_resolves_cross_references() {
        let desc = SystemDescription {
            pds: vec![
                emukit_abi::Pd {
                    name: "a".into(),
                    payload: None,
                    stack_size: 4096,
                },
                emukit_abi::Pd {
                    name: "b".into(),
                    payload: None,
                    stack_size: 4096,
                },
            ],
            regions: vec![emukit_abi::Region {
                name: "shared".into(),
                size: 4096,
            }],
            bindings: vec![emukit_abi::Binding {
                pd: "a".into(),
                region: "shared".into(),
                variable: "SHARED".into(),
            }],
            channels: vec![emukit_abi::Channel {
                from: "a".into(),
                to: "b".into(),
                id: 0,
            }],
        };
        let reg = Registry::from_description(&desc).unwrap();
        let a = reg.find_pd("a").unwrap();
        let manifest = reg.manifest_for(a);
        assert_eq!(manifest.regions.len(), 1);
        assert_eq!(manifest.regions[0].variable, "SHARED");
    }
}
