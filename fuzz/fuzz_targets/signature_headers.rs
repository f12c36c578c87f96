#![no_main]

//! Fuzz target for webhook signature header handling.
//!
//! Splits arbitrary input into body, timestamp header and signature header
//! and runs them through verification. Verification must never panic and
//! must never accept a header it did not compute itself.
//!
//! Run with:
//! cargo +nightly fuzz run signature_headers -- -max_total_time=600

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use palisade_crypto::{sign, verify_at, verify_webhook};

const SECRET: &[u8] = b"whsec_fuzz_secret";
const NOW: i64 = 1_700_000_000;

fuzz_target!(|data: &[u8]| {
    let mut parts = data.splitn(3, |b| *b == b'\n');
    let body = parts.next().unwrap_or_default();
    let timestamp = parts.next().map(String::from_utf8_lossy);
    let signature = parts.next().map(String::from_utf8_lossy);

    let accepted = verify_at(
        body,
        timestamp.as_deref(),
        signature.as_deref(),
        SECRET,
        300,
        NOW,
    );

    // Anything accepted must match what signing produces, up to hex case
    if accepted {
        let timestamp = timestamp.as_deref().unwrap_or_default().trim();
        let expected = sign(body, timestamp, SECRET).unwrap_or_default();
        let provided = signature.as_deref().unwrap_or_default().trim().to_ascii_lowercase();
        assert_eq!(provided, expected);
    }

    let verified = verify_webhook(
        Bytes::copy_from_slice(body),
        timestamp.as_deref(),
        signature.as_deref(),
        SECRET,
        300,
        NOW,
    );
    assert_eq!(verified.is_ok(), accepted);
    if let Ok(webhook) = verified {
        assert_eq!(webhook.signature(), webhook.signature().to_ascii_lowercase());
    }

    // Signing arbitrary bytes with arbitrary timestamps never panics
    let _ = sign(data, &String::from_utf8_lossy(data), SECRET);
});
