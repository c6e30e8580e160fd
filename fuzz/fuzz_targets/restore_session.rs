#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // hostile session blobs must be rejected without panicking
    if let Ok(saved) = std::str::from_utf8(data) {
        let _ = rampart::Account::restore(saved, None);
        let _ = rampart::Account::restore(saved, Some(&[1u8; 32]));
    }
});
