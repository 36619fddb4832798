//! End-to-end scenarios that fork and exec real payload `cdylib`s through the
//! full loader, the way a system integrator would run a Microkit system by
//! hand. Unlike the unit tests in `registry.rs`, these never hand-build a
//! `SystemDescription` just to parse it back out of TOML -- they construct
//! one directly and drive it through [`Loader`], exercising the same code
//! path `microkit-run`'s `main` does.
//!
//! A PD's dispatch loop runs forever by design (section 4.4: it only leaves
//! `Ready` on a crash or a closed peer), so none of these systems exit on
//! their own. Every scenario here spawns, gives the PDs a moment to finish
//! whatever `init`-time IPC they were built to do, and tears the system down
//! itself -- except the two scenarios that are *about* a PD dying, which
//! don't need our help reaching a terminal state.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use emukit_abi::{Binding, Channel, Pd, Region, SystemDescription};
use emukit_runtime::registry::RegionRecord;
use emukit_runtime::{Loader, Registry};
use nix::sys::mman::{mmap, MapFlags, ProtFlags};

const SETTLE: Duration = Duration::from_millis(150);

/// Every payload cdylib lands next to the test binaries in `target/<profile>`
/// because `payloads/*` are ordinary workspace members with `crate-type =
/// ["cdylib"]`; locating it by the directory cargo gives us for
/// `microkit-pd-host` avoids hard-coding `debug` vs `release`.
fn payload_path(crate_name: &str) -> PathBuf {
    let pd_host = PathBuf::from(env!("CARGO_BIN_EXE_microkit-pd-host"));
    let dir = pd_host.parent().expect("pd host exe has a parent dir").to_path_buf();
    dir.join(format!("lib{}.so", crate_name.replace('-', "_")))
}

fn pd_host_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_microkit-pd-host"))
}

fn pd(name: &str, payload: &str) -> Pd {
    Pd {
        name: name.to_string(),
        payload: Some(payload_path(payload).to_string_lossy().into_owned()),
        stack_size: 16 * 1024,
    }
}

fn region(name: &str, size: usize) -> Region {
    Region { name: name.to_string(), size }
}

fn binding(pd: &str, region: &str, variable: &str) -> Binding {
    Binding {
        pd: pd.to_string(),
        region: region.to_string(),
        variable: variable.to_string(),
    }
}

fn channel(from: &str, to: &str, id: u32) -> Channel {
    Channel { from: from.to_string(), to: to.to_string(), id }
}

/// Reads a region's current contents by mapping the same `memfd` the
/// registry already created -- this process never needs to have spawned a PD
/// to see what they wrote into shared memory.
fn read_region_word(record: &RegionRecord) -> usize {
    let addr = unsafe {
        mmap(
            None,
            NonZeroUsize::new(record.size).unwrap(),
            ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            &record.fd,
            0,
        )
    }
    .expect("mapping a region the registry already created should not fail");
    unsafe { (addr.as_ptr() as *const usize).read() }
}

/// Spawns every PD in `desc`, waits long enough for their `init`-time IPC to
/// settle, then kills the whole system and hands back the registry so the
/// caller can inspect shared regions.
fn run_and_settle(desc: SystemDescription) -> Loader {
    let registry = Registry::from_description(&desc).expect("description should be internally consistent");
    let mut loader = Loader::from_registry(registry);
    loader.spawn_all(&pd_host_exe()).expect("spawning pds should succeed");
    std::thread::sleep(SETTLE);
    loader.registry_mut().teardown();
    loader
}

/// Scenario 1 + 6: a notification carries a shared-region write across to
/// its peer, and the region is byte-identical in both processes because
/// they inherited the same `memfd` before either was spawned.
#[test]
fn notify_delivers_and_shared_region_is_coherent() {
    let desc = SystemDescription {
        pds: vec![pd("writer", "region_writer"), pd("reader", "region_reader")],
        regions: vec![region("shared", 4096), region("result", 4096)],
        bindings: vec![
            binding("writer", "shared", "SHARED"),
            binding("reader", "shared", "SHARED"),
            binding("reader", "result", "RESULT"),
        ],
        channels: vec![channel("writer", "reader", 0)],
    };
    let loader = run_and_settle(desc);

    let registry = loader.registry();
    let result_id = registry.find_region("result").unwrap();
    let observed = read_region_word(registry.region(result_id));
    assert_eq!(observed, 0xDEAD_BEEF, "reader should have copied what writer wrote before notifying");
}

/// Scenario 2: a protected procedure call transfers message registers to the
/// callee, and the callee's reply transfers a result back.
#[test]
fn ppcall_round_trip_transfers_message_registers() {
    let desc = SystemDescription {
        pds: vec![pd("client", "ppc_client"), pd("server", "ppc_echo_server")],
        regions: vec![region("result", 4096)],
        bindings: vec![binding("client", "result", "RESULT")],
        channels: vec![channel("client", "server", 0)],
    };
    let loader = run_and_settle(desc);

    let registry = loader.registry();
    let result_id = registry.find_region("result").unwrap();
    let observed = read_region_word(registry.region(result_id));
    assert_eq!(observed, 42, "server should have doubled the value client staged in mr 0");
}

/// Scenario 4: notifying a channel id that was never wired up in this PD's
/// channel table is fatal to the calling PD. Unlike the other scenarios this
/// one never reaches the dispatch loop -- `bad-channel`'s `init` itself
/// calls the offending `notify`, so the process exits before `wait_all`
/// would otherwise block forever.
#[test]
fn notify_on_unbound_channel_is_fatal_to_the_caller() {
    let desc = SystemDescription {
        pds: vec![pd("lonely", "bad_channel")],
        regions: vec![],
        bindings: vec![],
        channels: vec![],
    };
    let registry = Registry::from_description(&desc).unwrap();
    let mut loader = Loader::from_registry(registry);
    loader.spawn_all(&pd_host_exe()).unwrap();
    let code = loader.wait_all().expect("the lone pd should exit on its own, not block wait_all");
    assert_ne!(code, 0, "a pd that notifies an unbound channel must exit nonzero");
}

/// Scenario 5: one payload faulting brings down only its own PD process.
/// `notifier` sends a single fire-and-forget notification at `init` and then
/// sits in its dispatch loop forever, same as any other PD -- it is `victim`
/// that terminates on its own here, by crashing.
#[test]
fn payload_crash_isolates_only_that_pd() {
    let desc = SystemDescription {
        pds: vec![pd("trigger", "notifier"), pd("victim", "crasher")],
        regions: vec![],
        bindings: vec![],
        channels: vec![channel("trigger", "victim", 0)],
    };
    let registry = Registry::from_description(&desc).unwrap();
    let mut loader = Loader::from_registry(registry);
    loader.spawn_all(&pd_host_exe()).unwrap();

    // Notification delivery is asynchronous with respect to the sender, so
    // give the victim a moment to actually receive it and fault.
    std::thread::sleep(SETTLE);

    let victim = registry_find(&loader, "victim");
    let status = loader
        .registry_mut()
        .pd_mut(victim)
        .child
        .as_mut()
        .expect("victim was spawned")
        .try_wait()
        .expect("polling the victim's exit status should not fail");
    assert!(status.is_some(), "victim should have crashed and exited by now");
    assert_ne!(status.unwrap().code().unwrap_or(1), 0, "a segfaulting payload must not look like a clean exit");

    let trigger = registry_find(&loader, "trigger");
    let still_running = loader
        .registry_mut()
        .pd_mut(trigger)
        .child
        .as_mut()
        .expect("trigger was spawned")
        .try_wait()
        .expect("polling the trigger's exit status should not fail");
    assert!(still_running.is_none(), "trigger never learns its peer died, since notify never waits on delivery");

    loader.registry_mut().teardown();
}

fn registry_find(loader: &Loader, name: &str) -> emukit_abi::PdId {
    loader.registry().find_pd(name).unwrap()
}
