//! Segfaults the first time it's notified, to exercise the fact that a PD
//! host process dying takes nothing else in the system down with it.

#[no_mangle]
pub extern "C" fn microkit_init() {}

#[no_mangle]
pub extern "C" fn microkit_notified(_channel: u32) {
    unsafe {
        std::ptr::null::<u8>().read_volatile();
    }
}
