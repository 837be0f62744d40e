use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use openssl::pkey::PKey;
use openssl::rsa::Rsa;

use enclave_client::attestation::nitro::test_support::TestEnclave;
use enclave_client::crypto::envelope::{aes_gcm_seal, decrypt_envelope, encrypt_envelope};
use enclave_client::crypto::hpke::{self, KeyPair};
use enclave_client::{parse_attestation_document, DataKey};

const SIZES: &[usize] = &[64, 1024, 16 * 1024, 256 * 1024];

fn bench_hpke(c: &mut Criterion) {
    let mut group = c.benchmark_group("hpke");
    let recipient = KeyPair::generate();

    for &size in SIZES {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("seal", size), &payload, |b, p| {
            b.iter(|| black_box(hpke::seal(recipient.public.as_bytes(), p).unwrap()));
        });

        let frame = hpke::seal(recipient.public.as_bytes(), &payload)
            .unwrap()
            .to_frame();
        group.bench_with_input(BenchmarkId::new("open", size), &frame, |b, f| {
            b.iter(|| black_box(hpke::open_frame(&recipient.secret, f).unwrap()));
        });
    }
    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    let private = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let pem = String::from_utf8(private.public_key_to_pem().unwrap()).unwrap();
    let data_key = DataKey::generate(&pem).unwrap();

    // RSA-OAEP wrap of a fresh key.
    group.bench_function("data_key_generate", |b| {
        b.iter(|| black_box(DataKey::generate(&pem).unwrap()));
    });

    for &size in SIZES {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("aes_gcm_seal", size), &payload, |b, p| {
            let key = [7u8; 32];
            b.iter(|| black_box(aes_gcm_seal(&key, p).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("encrypt", size), &payload, |b, p| {
            b.iter(|| black_box(encrypt_envelope(&data_key, p).unwrap()));
        });

        let envelope = encrypt_envelope(&data_key, &payload).unwrap();
        group.bench_with_input(BenchmarkId::new("decrypt", size), &envelope, |b, e| {
            b.iter(|| black_box(decrypt_envelope(&private, e).unwrap()));
        });
    }
    group.finish();
}

fn bench_attestation_parse(c: &mut Criterion) {
    let enclave = TestEnclave::new();
    let raw = enclave.attest(Some(&[1u8; 32]), Some(b"{}"), Some(b"nonce"));

    c.bench_function("attestation_parse", |b| {
        b.iter(|| black_box(parse_attestation_document(&raw).unwrap()));
    });
}

criterion_group!(benches, bench_hpke, bench_envelope, bench_attestation_parse);
criterion_main!(benches);
