//! Protected-procedure-call client: sends a value on channel 0 and stashes
//! the reply in a shared region word the loader's own process can check.

#[no_mangle]
pub static mut RESULT: *mut usize = std::ptr::null_mut();

#[no_mangle]
pub extern "C" fn microkit_init() {
    microkit_api::mr_set(0, 21);
    let reply = microkit_api::ppcall(0, microkit_api::msginfo_new(0xC0FFEE, 1));
    assert_eq!(microkit_api::msginfo_get_count(reply), 1);
    let doubled = microkit_api::mr_get(0);
    // Safety: the loader binds this symbol before calling `microkit_init`.
    unsafe {
        *RESULT = doubled as usize;
    }
}

#[no_mangle]
pub extern "C" fn microkit_notified(_channel: u32) {}
