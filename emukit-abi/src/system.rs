//! System description: the static input to the loader.
//!
//! These types are plain data, independent of any particular serialization.
//! `emukit-runtime`'s loader deserializes them from TOML with `serde`, but
//! any deserializer that produces these records satisfies the interface.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SystemDescription {
    #[serde(rename = "pd")]
    pub pds: Vec<Pd>,
    #[serde(rename = "region", default)]
    pub regions: Vec<Region>,
    #[serde(rename = "binding", default)]
    pub bindings: Vec<Binding>,
    #[serde(rename = "channel", default)]
    pub channels: Vec<Channel>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Pd {
    pub name: String,
    /// Path to the payload `cdylib` this PD loads at spawn time. Optional so
    /// a description can declare a PD without yet wiring up a payload to run
    /// it (the loader simply never spawns such a PD).
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

fn default_stack_size() -> usize {
    16 * 1024
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Region {
    pub name: String,
    pub size: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Binding {
    pub pd: String,
    pub region: String,
    pub variable: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Channel {
    pub from: String,
    pub to: String,
    pub id: u32,
}
