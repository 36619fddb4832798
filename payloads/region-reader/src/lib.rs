//! Reads the value `region-writer` placed in their shared region and copies
//! it into a second region the loader's own process can check.

#[no_mangle]
pub static mut SHARED: *mut usize = std::ptr::null_mut();

#[no_mangle]
pub static mut RESULT: *mut usize = std::ptr::null_mut();

#[no_mangle]
pub extern "C" fn microkit_init() {}

#[no_mangle]
pub extern "C" fn microkit_notified(_channel: u32) {
    // Safety: the loader binds both symbols before dispatching notifications.
    unsafe {
        *RESULT = *SHARED;
    }
}
