//! Notifies a channel that was never wired up. `microkit-api` treats that as
//! fatal and exits the process with status 1, matching what's supposed to
//! happen when a PD's channel table doesn't cover a call it makes.

#[no_mangle]
pub extern "C" fn microkit_init() {
    microkit_api::notify(99);
}

#[no_mangle]
pub extern "C" fn microkit_notified(_channel: u32) {}
