//! Counts notifications it receives on any channel into a shared region word
//! the loader's own process can read back after teardown. Exercises both the
//! notification path and the shared-region binding in the same payload.

#[no_mangle]
pub static mut COUNT: *mut usize = std::ptr::null_mut();

#[no_mangle]
pub extern "C" fn microkit_init() {}

#[no_mangle]
pub extern "C" fn microkit_notified(_channel: u32) {
    // Safety: the loader binds this symbol before calling `microkit_init`,
    // and this payload is single-threaded.
    unsafe {
        *COUNT += 1;
    }
}
