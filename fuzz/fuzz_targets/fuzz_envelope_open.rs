#![no_main]

use libfuzzer_sys::fuzz_target;

use enclave_client::crypto::envelope::aes_gcm_open;
use enclave_client::crypto::hpke::open_frame;
use x25519_dalek::StaticSecret;

fuzz_target!(|data: &[u8]| {
    let key = [0x42u8; 32];
    let _ = aes_gcm_open(&key, data);

    let secret = StaticSecret::from([0x24u8; 32]);
    let _ = open_frame(&secret, data);
});
