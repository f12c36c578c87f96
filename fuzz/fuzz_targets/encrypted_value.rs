#![no_main]

//! Fuzz target for the encrypted column value parser.
//!
//! Stored ciphertexts come from the database and may be truncated or
//! corrupted. Parsing must return an error instead of panicking, and any
//! value that parses must survive re-serialization unchanged.
//!
//! Run with:
//! cargo +nightly fuzz run encrypted_value -- -max_total_time=600

use libfuzzer_sys::fuzz_target;
use palisade_crypto::EncryptedValue;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let peeked = EncryptedValue::peek_version(text);

    if let Ok(value) = EncryptedValue::parse(text) {
        // A full parse implies the version prefix is readable
        assert_eq!(peeked.as_ref().ok(), Some(&value.version));

        let reparsed = EncryptedValue::parse(&value.to_string())
            .expect("serialized value must parse again");
        assert!(reparsed == value);
    }
});
