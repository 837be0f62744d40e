#![no_main]

use libfuzzer_sys::fuzz_target;

use enclave_client::parse_attestation_document;

fuzz_target!(|data: &[u8]| {
    // Raw COSE_Sign1 bytes, then the same bytes read as base64 text.
    let _ = parse_attestation_document(data);
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = parse_attestation_document(text);
    }
});
