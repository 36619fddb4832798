//! Sends one notification on channel 0 at startup and otherwise does
//! nothing. Used as the trigger side of the notification scenarios.

#[no_mangle]
pub extern "C" fn microkit_init() {
    microkit_api::notify(0);
}

#[no_mangle]
pub extern "C" fn microkit_notified(_channel: u32) {}
