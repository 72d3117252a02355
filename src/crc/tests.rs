//! Tests for CRC module

use super::*;

#[test]
fn test_crc32c_known_vector() {
    // Standard CRC32C check value for "123456789".
    let checksum = CRC32C.checksum(b"123456789");
    assert_eq!(checksum, 0xE3069283);
}

#[test]
fn test_crc32c_deterministic() {
    let data = b"test data";
    assert_eq!(CRC32C.checksum(data), CRC32C.checksum(data));
}

#[test]
fn test_crc32c_different_data() {
    assert_ne!(CRC32C.checksum(b"data1"), CRC32C.checksum(b"data2"));
}

#[test]
fn test_crc32c_digest_update() {
    let mut digest = CRC32C.digest();
    digest.update(b"hello");
    digest.update(b" world");
    assert_eq!(digest.finalize(), CRC32C.checksum(b"hello world"));
}
