#![no_main]

//! Fuzz target for SignInInfo::parse()
//!
//! The sign-in header comes from the network; parsing must never panic.
//!
//! Run with: cargo +nightly fuzz run fuzz_sign_in_header

use authbridge_core::SignInInfo;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = std::str::from_utf8(data) {
        if let Ok(info) = SignInInfo::parse(value) {
            assert!(!info.gaia_id.is_empty());
        }
    }
});
