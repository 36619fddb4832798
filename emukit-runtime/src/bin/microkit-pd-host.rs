//! Generic per-PD host process. `microkit-run` spawns one of these for every
//! PD with a payload configured, passing its handle manifest and payload
//! path through the environment. Never invoked directly by a user.

fn main() {
    env_logger::init();
    let name = std::env::args().nth(1).unwrap_or_else(|| "<unnamed>".to_string());
    let code = emukit_runtime::run_pd_host(&name);
    std::process::exit(code);
}
