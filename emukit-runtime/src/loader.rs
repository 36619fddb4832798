//! The loader: turns a populated [`Registry`] into a running system by
//! `fork`+`exec`-ing one host process per PD with a payload, then waiting
//! for all of them to exit.
//!
//! This is the host-side analogue of `packager`'s job of producing a
//! flashable image -- except here there's no image, just a fleet of
//! processes, and "flashing" is `exec`.

use std::path::Path;

use emukit_abi::PdId;

use crate::registry::Registry;

pub struct Loader {
    registry: Registry,
}

impl Loader {
    pub fn from_registry(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Spawns every PD in the registry that has a payload configured. PDs
    /// without one are left registered but never run -- useful for
    /// declaring a system incrementally.
    pub fn spawn_all(&mut self, pd_host_exe: &Path) -> anyhow::Result<()> {
        let ids: Vec<PdId> = self.registry.pd_ids().collect();
        for id in ids {
            if self.registry.pd(id).payload.is_some() {
                self.spawn_pd(id, pd_host_exe)?;
            }
        }
        Ok(())
    }

    /// Spawns a single PD by forking this process and `exec`ing
    /// `pd_host_exe`, handing it this PD's handle manifest and payload path
    /// through the environment.
    pub fn spawn_pd(&mut self, pd: PdId, pd_host_exe: &Path) -> anyhow::Result<()> {
        let manifest = self.registry.manifest_for(pd);
        let name = self.registry.pd(pd).name.clone();
        let payload = self
            .registry
            .pd(pd)
            .payload
            .clone()
            .ok_or_else(|| anyhow::anyhow!("pd {name} has no payload configured"))?;

        let mut cmd = std::process::Command::new(pd_host_exe);
        cmd.arg(&name)
            .env(emukit_abi::manifest::HANDLES_ENV_VAR, manifest.to_env_value())
            .env("MICROKIT_PAYLOAD", &payload);

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn pd {name}: {e}"))?;
        log::info!("spawned pd {name} as pid {}", child.id());
        self.registry.pd_mut(pd).child = Some(child);
        Ok(())
    }

    /// Waits for every spawned PD to exit, returning the first nonzero exit
    /// code observed (if any), after every child has been reaped.
    pub fn wait_all(&mut self) -> anyhow::Result<i32> {
        let mut first_failure = None;
        let ids: Vec<PdId> = self.registry.pd_ids().collect();
        for id in ids {
            let Some(mut child) = self.registry.pd_mut(id).child.take() else {
                continue;
            };
            let name = self.registry.pd(id).name.clone();
            let status = child.wait().map_err(|e| anyhow::anyhow!("waiting on pd {name}: {e}"))?;
            let code = status.code().unwrap_or(1);
            if code != 0 {
                log::warn!("pd {name} exited with status {code}");
                first_failure.get_or_insert(code);
            } else {
                log::info!("pd {name} exited");
            }
        }
        Ok(first_failure.unwrap_or(0))
    }
}
