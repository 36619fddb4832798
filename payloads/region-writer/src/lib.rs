//! Writes a known value into a shared region, then notifies the reader on
//! the other end of it. Pairs with `region-reader`.

#[no_mangle]
pub static mut SHARED: *mut usize = std::ptr::null_mut();

#[no_mangle]
pub extern "C" fn microkit_init() {
    // Safety: the loader binds this symbol before calling `microkit_init`.
    unsafe {
        *SHARED = 0xDEAD_BEEF;
    }
    microkit_api::notify(0);
}

#[no_mangle]
pub extern "C" fn microkit_notified(_channel: u32) {}
