//! Binary codec for the fixed 64-byte pattern header.
//!
//! This layout is the wire contract for producers that write directly into the
//! shared hot-tier region. All fields are little-endian:
//!
//! | offset | field        | type |
//! |--------|--------------|------|
//! | 0      | magic        | u64  |
//! | 8      | id           | u64  |
//! | 16     | version      | u16  |
//! | 18     | type         | u16  |
//! | 20     | complexity   | u8   |
//! | 21     | confidence   | u8   |
//! | 22     | source_hash  | u32  |
//! | 26     | timestamp    | u64  |
//! | 34     | expiration   | u64  |
//! | 42     | weight       | f32  |
//! | 46     | access_count | u32  |
//! | 50     | success_rate | f32  |
//! | 54     | flags        | u16  |
//! | 56     | payload_size | u16  |
//! | 60     | data_pointer | u32  |
//!
//! Bytes 58..60 are reserved and written as zero.

use std::hash::Hasher;

use byteorder::{ByteOrder, LittleEndian};

use crate::types::{PatternFlags, PatternHeader, PatternType, HEADER_SIZE, PATTERN_MAGIC};

const OFF_MAGIC: usize = 0;
const OFF_ID: usize = 8;
const OFF_VERSION: usize = 16;
const OFF_TYPE: usize = 18;
const OFF_COMPLEXITY: usize = 20;
const OFF_CONFIDENCE: usize = 21;
const OFF_SOURCE_HASH: usize = 22;
const OFF_TIMESTAMP: usize = 26;
const OFF_EXPIRATION: usize = 34;
const OFF_WEIGHT: usize = 42;
const OFF_ACCESS_COUNT: usize = 46;
const OFF_SUCCESS_RATE: usize = 50;
const OFF_FLAGS: usize = 54;
const OFF_PAYLOAD_SIZE: usize = 56;
const OFF_DATA_POINTER: usize = 60;

/// Encode a header into its 64-byte wire form.
pub fn encode_header(header: &PatternHeader) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];
    LittleEndian::write_u64(&mut buf[OFF_MAGIC..], header.magic);
    LittleEndian::write_u64(&mut buf[OFF_ID..], header.id);
    LittleEndian::write_u16(&mut buf[OFF_VERSION..], header.version);
    LittleEndian::write_u16(&mut buf[OFF_TYPE..], header.pattern_type.as_u16());
    buf[OFF_COMPLEXITY] = header.complexity;
    buf[OFF_CONFIDENCE] = header.confidence;
    LittleEndian::write_u32(&mut buf[OFF_SOURCE_HASH..], header.source_hash);
    LittleEndian::write_u64(&mut buf[OFF_TIMESTAMP..], header.timestamp);
    LittleEndian::write_u64(&mut buf[OFF_EXPIRATION..], header.expiration);
    LittleEndian::write_f32(&mut buf[OFF_WEIGHT..], header.weight);
    LittleEndian::write_u32(&mut buf[OFF_ACCESS_COUNT..], header.access_count);
    LittleEndian::write_f32(&mut buf[OFF_SUCCESS_RATE..], header.success_rate);
    LittleEndian::write_u16(&mut buf[OFF_FLAGS..], header.flags.0);
    LittleEndian::write_u16(&mut buf[OFF_PAYLOAD_SIZE..], header.payload_size);
    LittleEndian::write_u32(&mut buf[OFF_DATA_POINTER..], header.data_pointer);
    buf
}

/// Decode a header from a byte span.
///
/// Returns `None` when the span is shorter than [`HEADER_SIZE`], the magic
/// does not match, or the type tag is unknown.
pub fn decode_header(buf: &[u8]) -> Option<PatternHeader> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let magic = LittleEndian::read_u64(&buf[OFF_MAGIC..]);
    if magic != PATTERN_MAGIC {
        return None;
    }
    let pattern_type = PatternType::from_u16(LittleEndian::read_u16(&buf[OFF_TYPE..]))?;

    Some(PatternHeader {
        magic,
        id: LittleEndian::read_u64(&buf[OFF_ID..]),
        version: LittleEndian::read_u16(&buf[OFF_VERSION..]),
        pattern_type,
        complexity: buf[OFF_COMPLEXITY],
        confidence: buf[OFF_CONFIDENCE],
        source_hash: LittleEndian::read_u32(&buf[OFF_SOURCE_HASH..]),
        timestamp: LittleEndian::read_u64(&buf[OFF_TIMESTAMP..]),
        expiration: LittleEndian::read_u64(&buf[OFF_EXPIRATION..]),
        weight: LittleEndian::read_f32(&buf[OFF_WEIGHT..]),
        access_count: LittleEndian::read_u32(&buf[OFF_ACCESS_COUNT..]),
        success_rate: LittleEndian::read_f32(&buf[OFF_SUCCESS_RATE..]),
        flags: PatternFlags(LittleEndian::read_u16(&buf[OFF_FLAGS..])),
        payload_size: LittleEndian::read_u16(&buf[OFF_PAYLOAD_SIZE..]),
        data_pointer: LittleEndian::read_u32(&buf[OFF_DATA_POINTER..]),
    })
}

/// Read only the magic word of an encoded header.
pub fn peek_magic(buf: &[u8]) -> Option<u64> {
    (buf.len() >= 8).then(|| LittleEndian::read_u64(&buf[OFF_MAGIC..]))
}

/// 64-bit avalanche mix (the murmur3 finalizer). Every input bit affects every
/// output bit, so adjacent IDs land on unrelated positions.
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Stable 32-bit identifier for a named pattern source.
pub fn source_hash(source: &str) -> u32 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(source.as_bytes());
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PatternHeader {
        PatternHeader {
            magic: PATTERN_MAGIC,
            id: 0x0102_0304_0506_0708,
            version: 7,
            pattern_type: PatternType::Sequential,
            complexity: 4,
            confidence: 93,
            source_hash: 0xDEAD_BEEF,
            timestamp: 1_708_345_678,
            expiration: 1_708_999_999,
            weight: 0.625,
            access_count: 42,
            success_rate: 0.875,
            flags: PatternFlags(PatternFlags::ACTIVE | PatternFlags::EVOLVED),
            payload_size: 300,
            data_pointer: 4096,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = encode_header(&header);
        assert_eq!(decode_header(&bytes), Some(header));
    }

    #[test]
    fn test_fixed_offsets() {
        let bytes = encode_header(&sample_header());
        assert_eq!(&bytes[0..8], b"PATTERN1");
        assert_eq!(bytes[8], 0x08); // id low byte
        assert_eq!(LittleEndian::read_u16(&bytes[18..20]), PatternType::Sequential as u16);
        assert_eq!(bytes[20], 4);
        assert_eq!(bytes[21], 93);
        assert_eq!(LittleEndian::read_u32(&bytes[22..26]), 0xDEAD_BEEF);
        assert_eq!(LittleEndian::read_f32(&bytes[42..46]), 0.625);
        assert_eq!(LittleEndian::read_u16(&bytes[56..58]), 300);
        assert_eq!(&bytes[58..60], &[0, 0]);
        assert_eq!(LittleEndian::read_u32(&bytes[60..64]), 4096);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = encode_header(&sample_header());
        bytes[0] ^= 0xFF;
        assert!(decode_header(&bytes).is_none());
    }

    #[test]
    fn test_short_buffer() {
        let bytes = encode_header(&sample_header());
        assert!(decode_header(&bytes[..HEADER_SIZE - 1]).is_none());
        assert!(decode_header(&[]).is_none());
    }

    #[test]
    fn test_unknown_type_tag() {
        let mut bytes = encode_header(&sample_header());
        LittleEndian::write_u16(&mut bytes[OFF_TYPE..], 99);
        assert!(decode_header(&bytes).is_none());
    }

    #[test]
    fn test_mix64_spreads_adjacent_ids() {
        let a = mix64(1);
        let b = mix64(2);
        assert_ne!(a, b);
        assert!((a ^ b).count_ones() > 16);
    }

    #[test]
    fn test_source_hash_is_stable() {
        assert_eq!(source_hash("detector"), source_hash("detector"));
        assert_ne!(source_hash("detector"), source_hash("producer"));
    }
}
