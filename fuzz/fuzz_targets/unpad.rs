#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // unpadders must never panic, only reject
    let _ = rampart::primitives::unpad_meta(data);
    let _ = rampart::primitives::unpad_fixed(data);

    if !data.is_empty() {
        // and padding anything must stay invertible
        let padded = rampart::primitives::pad_meta(data);
        assert_eq!(
            rampart::primitives::unpad_meta(&padded).unwrap(),
            data,
            "padme roundtrip"
        );
    }
});
