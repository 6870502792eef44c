#![no_main]

//! Fuzz target for inbound transport traffic
//!
//! Feeds arbitrary JSON as frames, envelopes and page messages. None of
//! these inputs are trusted, so every path must drop bad input without
//! panicking.
//!
//! Run with: cargo +nightly fuzz run fuzz_frames

use authbridge_core::{
    AuthConfig, AuthEvent, AuthParams, Authenticator, Envelope, Frame, InjectedMessage,
};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

const ORIGIN: &str = "https://accounts.example.com";

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    let _ = Frame::decode(raw.clone());
    let _ = Envelope::<InjectedMessage>::decode(raw.clone());

    let config = AuthConfig {
        allowed_origins: vec![ORIGIN.to_string()],
        ..Default::default()
    };
    let Ok(mut authenticator) = Authenticator::new(config) else {
        return;
    };
    authenticator.handle(AuthEvent::Load {
        params: AuthParams::new(format!("{ORIGIN}/")),
    });
    authenticator.handle(AuthEvent::TransportFrame {
        origin: ORIGIN.to_string(),
        frame: raw.clone(),
    });
    authenticator.handle(AuthEvent::PageMessage {
        origin: ORIGIN.to_string(),
        message: raw,
    });
});
