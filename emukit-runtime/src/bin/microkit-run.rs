//! Loads a system description and runs it: one host process per configured
//! protection domain, torn down together when any of them exits.

use std::path::PathBuf;

use clap::Parser;
use emukit_abi::SystemDescription;
use emukit_runtime::{Loader, Registry};

/// Runs a Microkit-style system description as a collection of host
/// processes.
#[derive(Debug, Parser)]
#[clap(max_term_width = 80)]
struct Args {
    /// Path to the system description, in TOML.
    system: PathBuf,

    /// Overrides (or supplies) the payload path for a PD named in the
    /// system description, as `NAME=PATH`. May be given more than once.
    #[clap(long = "payload", value_parser = parse_payload_override, number_of_values = 1)]
    payloads: Vec<(String, PathBuf)>,

    /// Raises log verbosity; repeatable (`-v` for info, `-vv` for debug,
    /// `-vvv` for trace). Ignored if `RUST_LOG` is set.
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
}

fn parse_payload_override(s: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got {s:?}"))?;
    if name.is_empty() {
        return Err(format!("expected NAME=PATH, got {s:?}"));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::new();
    if std::env::var_os("RUST_LOG").is_some() {
        builder.parse_default_env();
    } else {
        let level = match verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        builder.filter_level(level);
    }
    builder.init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let raw = std::fs::read_to_string(&args.system)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", args.system.display()))?;
    let mut desc: SystemDescription = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parsing {}: {e}", args.system.display()))?;

    apply_payload_overrides(&mut desc, &args.payloads)?;

    let registry = Registry::from_description(&desc)?;
    let mut loader = Loader::from_registry(registry);

    let pd_host_exe = sibling_exe("microkit-pd-host")?;
    loader.spawn_all(&pd_host_exe)?;

    let code = loader.wait_all()?;
    loader.registry_mut().teardown();
    std::process::exit(code);
}

/// Merges `--payload NAME=PATH` overrides into the PDs a description
/// already declared, the way command-line flags conventionally win over a
/// config file. Fails if a name doesn't match any PD in the description.
fn apply_payload_overrides(desc: &mut SystemDescription, overrides: &[(String, PathBuf)]) -> anyhow::Result<()> {
    for (name, path) in overrides {
        let pd = desc
            .pds
            .iter_mut()
            .find(|pd| &pd.name == name)
            .ok_or_else(|| anyhow::anyhow!("--payload {name}=...: no such pd in system description"))?;
        pd.payload = Some(path.to_string_lossy().into_owned());
    }
    Ok(())
}

fn sibling_exe(name: &str) -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("microkit-run executable has no parent directory"))?;
    Ok(dir.join(name))
}
