//! Protected-procedure-call server: doubles message register 0 and replies
//! with the same `count`.

use microkit_api::MsgInfo;

#[no_mangle]
pub extern "C" fn microkit_init() {}

#[no_mangle]
pub extern "C" fn microkit_notified(_channel: u32) {}

#[no_mangle]
pub extern "C" fn microkit_protected(_channel: u32, info: MsgInfo) -> MsgInfo {
    let value = microkit_api::mr_get(0);
    microkit_api::mr_set(0, value * 2);
    microkit_api::msginfo_new(microkit_api::msginfo_get_label(info), 1)
}
