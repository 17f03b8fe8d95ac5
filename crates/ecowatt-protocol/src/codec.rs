//! Delta-RLE v1 block codec.
//!
//! Wire format:
//!
//! ```text
//! +---------+-------------+--------------+------------+
//! | version | field_count | sample_count | reserved   |
//! |   u8    |     u8      |    u16 LE    |  4 bytes   |
//! +---------+-------------+--------------+------------+
//! | initial value per field, u16 LE, in `order` order  |
//! +----------------------------------------------------+
//! | field 0 opcodes | field 1 opcodes | ...            |
//! +----------------------------------------------------+
//! | CRC-32 (IEEE) of all preceding bytes, LE           |
//! +----------------------------------------------------+
//! ```
//!
//! Each field's opcode stream yields `sample_count - 1` further samples:
//! `0x00 n` repeats the running value `n` times, `0x01 d` adds the s16 LE
//! delta `d` modulo 2^16. Streams are stored field after field, never
//! interleaved.
//!
//! Decoding never reads the trailer and never fails loudly: malformed
//! blocks come back as an empty row set plus a [`DecodeStatus`].

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::{CodecError, BLOCK_VERSION, HEADER_LEN, MAX_REPEAT_RUN, MIN_BLOCK_LEN, TRAILER_LEN};

const OP_REPEAT: u8 = 0x00;
const OP_DELTA: u8 = 0x01;

/// Outcome of [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    /// Fewer bytes than header plus trailer.
    Short,
    /// Wrong version, field count differs from `order`, or zero samples.
    HeaderMismatch,
    /// Initial-value table runs into the trailer.
    Truncated,
    /// Opcode missing before the trailer.
    EarlyEof,
    /// Repeat count missing before the trailer.
    EofLen,
    /// Delta operand missing before the trailer.
    EofDelta,
    /// Opcode other than repeat or delta.
    BadOp,
    /// Repeat run produces more samples than the header declares.
    Overrun,
}

impl DecodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeStatus::Ok => "ok",
            DecodeStatus::Short => "short",
            DecodeStatus::HeaderMismatch => "header-mismatch",
            DecodeStatus::Truncated => "truncated",
            DecodeStatus::EarlyEof => "early-eof",
            DecodeStatus::EofLen => "eof-len",
            DecodeStatus::EofDelta => "eof-delta",
            DecodeStatus::BadOp => "bad-op",
            DecodeStatus::Overrun => "overrun",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, DecodeStatus::Ok)
    }
}

impl fmt::Display for DecodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded block: sample-major rows of raw register values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// `rows[i][f]` is sample `i` of field `order[f]`.
    pub rows: Vec<Vec<u16>>,
    pub status: DecodeStatus,
}

impl Decoded {
    fn failed(status: DecodeStatus) -> Self {
        Self {
            rows: Vec::new(),
            status,
        }
    }
}

/// Decode a delta-RLE v1 block whose columns are named by `order`.
pub fn decode(block: &[u8], order: &[String]) -> Decoded {
    if block.len() < MIN_BLOCK_LEN {
        return Decoded::failed(DecodeStatus::Short);
    }

    let mut header = &block[..HEADER_LEN];
    let version = header.get_u8();
    let field_count = header.get_u8() as usize;
    let sample_count = header.get_u16_le() as usize;

    if version != BLOCK_VERSION || field_count != order.len() || sample_count == 0 {
        return Decoded::failed(DecodeStatus::HeaderMismatch);
    }

    // Opcode reads stop where the trailer begins.
    let body_end = block.len() - TRAILER_LEN;
    if HEADER_LEN + field_count * 2 > body_end {
        return Decoded::failed(DecodeStatus::Truncated);
    }
    let mut cur = &block[HEADER_LEN..body_end];

    let mut columns: Vec<Vec<u16>> = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        let mut column = Vec::with_capacity(sample_count);
        column.push(cur.get_u16_le());
        columns.push(column);
    }

    for column in columns.iter_mut() {
        if let Err(status) = decode_column(&mut cur, column, sample_count) {
            return Decoded::failed(status);
        }
    }

    let rows = (0..sample_count)
        .map(|i| columns.iter().map(|column| column[i]).collect())
        .collect();

    Decoded {
        rows,
        status: DecodeStatus::Ok,
    }
}

/// Extend `column` (holding its initial value) to `sample_count` samples.
fn decode_column(
    cur: &mut &[u8],
    column: &mut Vec<u16>,
    sample_count: usize,
) -> Result<(), DecodeStatus> {
    let mut value = column.last().copied().unwrap_or(0);

    while column.len() < sample_count {
        if !cur.has_remaining() {
            return Err(DecodeStatus::EarlyEof);
        }
        match cur.get_u8() {
            OP_REPEAT => {
                if !cur.has_remaining() {
                    return Err(DecodeStatus::EofLen);
                }
                let run = cur.get_u8() as usize;
                if column.len() + run > sample_count {
                    return Err(DecodeStatus::Overrun);
                }
                column.resize(column.len() + run, value);
            }
            OP_DELTA => {
                if cur.remaining() < 2 {
                    return Err(DecodeStatus::EofDelta);
                }
                value = value.wrapping_add(cur.get_i16_le() as u16);
                column.push(value);
            }
            _ => return Err(DecodeStatus::BadOp),
        }
    }
    Ok(())
}

/// Encode sample-major `rows` into a delta-RLE v1 block, CRC trailer included.
///
/// Matches the device encoder byte for byte: zero deltas accumulate into
/// repeat runs of at most 255, every non-zero delta is its own opcode.
pub fn encode(order: &[String], rows: &[Vec<u16>]) -> Result<Vec<u8>, CodecError> {
    let field_count = order.len();
    if rows.is_empty() {
        return Err(CodecError::NoSamples);
    }
    if rows.len() > u16::MAX as usize {
        return Err(CodecError::TooManySamples(rows.len()));
    }
    if field_count > u8::MAX as usize {
        return Err(CodecError::TooManyFields(field_count));
    }
    if let Some((row, values)) = rows
        .iter()
        .enumerate()
        .find(|(_, values)| values.len() != field_count)
    {
        return Err(CodecError::RaggedRow {
            row,
            got: values.len(),
            expected: field_count,
        });
    }

    let mut buf = BytesMut::with_capacity(MIN_BLOCK_LEN + field_count * (2 + rows.len() * 3));
    buf.put_u8(BLOCK_VERSION);
    buf.put_u8(field_count as u8);
    buf.put_u16_le(rows.len() as u16);
    buf.put_u32_le(0);

    for f in 0..field_count {
        buf.put_u16_le(rows[0][f]);
    }

    for f in 0..field_count {
        let mut prev = rows[0][f];
        let mut run: u8 = 0;
        for row in &rows[1..] {
            let value = row[f];
            if value == prev {
                run += 1;
                if run == MAX_REPEAT_RUN {
                    buf.put_u8(OP_REPEAT);
                    buf.put_u8(run);
                    run = 0;
                }
            } else {
                if run > 0 {
                    buf.put_u8(OP_REPEAT);
                    buf.put_u8(run);
                    run = 0;
                }
                buf.put_u8(OP_DELTA);
                buf.put_i16_le(value.wrapping_sub(prev) as i16);
                prev = value;
            }
        }
        if run > 0 {
            buf.put_u8(OP_REPEAT);
            buf.put_u8(run);
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    Ok(buf.to_vec())
}

/// Whether the trailing CRC-32 matches the bytes before it.
///
/// Ingest does not depend on this; inspection views report it.
pub fn checksum_matches(block: &[u8]) -> bool {
    if block.len() < MIN_BLOCK_LEN {
        return false;
    }
    let (body, mut trailer) = block.split_at(block.len() - TRAILER_LEN);
    crc32fast::hash(body) == trailer.get_u32_le()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn order(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{i}")).collect()
    }

    fn with_trailer(mut bytes: Vec<u8>) -> Vec<u8> {
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    #[test]
    fn test_two_field_block() {
        // 10 samples, field 0 starts 0x0EE4, field 1 starts 0x00FA.
        let block = with_trailer(vec![
            0x01, 0x02, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, // header
            0xE4, 0x0E, 0xFA, 0x00, // initial values
            0x01, 0x0A, 0x00, 0x00, 0x08, // field 0: +10, repeat 8
            0x00, 0x03, 0x00, 0x06, // field 1: repeat 3, repeat 6
        ]);
        let decoded = decode(&block, &order(2));
        assert_eq!(decoded.status, DecodeStatus::Ok);
        assert_eq!(decoded.rows.len(), 10);
        assert_eq!(decoded.rows[0], vec![0x0EE4, 0x00FA]);
        assert_eq!(decoded.rows[1][0], 0x0EEE);
        for row in &decoded.rows[1..4] {
            assert_eq!(row[1], 0x00FA);
        }
        assert!(decoded.rows[1..].iter().all(|r| r[0] == 0x0EEE));
        assert!(checksum_matches(&block));
    }

    #[test]
    fn test_column_runs_out_before_sample_count() {
        // Header claims 10 samples but field 0 only yields 5.
        let block = with_trailer(vec![
            0x01, 0x02, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0xE4, 0x0E, 0xFA, 0x00, 0x01, 0x0A,
            0x00, 0x00, 0x03,
        ]);
        let decoded = decode(&block, &order(2));
        assert_eq!(decoded.status, DecodeStatus::EarlyEof);
        assert!(decoded.rows.is_empty());
    }

    #[test]
    fn test_short_block() {
        let decoded = decode(&[0x01, 0x01, 0x01, 0x00], &order(1));
        assert_eq!(decoded.status, DecodeStatus::Short);
        assert_eq!(decoded.status.as_str(), "short");
    }

    #[test]
    fn test_header_mismatch() {
        let good = encode(&order(2), &[vec![1, 2], vec![3, 4]]).unwrap();

        let mut wrong_version = good.clone();
        wrong_version[0] = 2;
        assert_eq!(
            decode(&wrong_version, &order(2)).status,
            DecodeStatus::HeaderMismatch
        );

        assert_eq!(
            decode(&good, &order(3)).status,
            DecodeStatus::HeaderMismatch
        );

        let mut zero_samples = good.clone();
        zero_samples[2] = 0;
        zero_samples[3] = 0;
        assert_eq!(
            decode(&zero_samples, &order(2)).status,
            DecodeStatus::HeaderMismatch
        );
    }

    #[test]
    fn test_truncated_initial_values() {
        // Three fields need 6 bytes of initial values; only 2 precede the trailer.
        let block = with_trailer(vec![0x01, 0x03, 0x01, 0x00, 0, 0, 0, 0, 0x10, 0x00]);
        assert_eq!(decode(&block, &order(3)).status, DecodeStatus::Truncated);
    }

    #[test]
    fn test_missing_operands() {
        let header = [0x01, 0x01, 0x03, 0x00, 0, 0, 0, 0, 0x05, 0x00];

        let mut repeat = header.to_vec();
        repeat.push(OP_REPEAT);
        assert_eq!(
            decode(&with_trailer(repeat), &order(1)).status,
            DecodeStatus::EofLen
        );

        let mut delta = header.to_vec();
        delta.extend_from_slice(&[OP_DELTA, 0x01]);
        assert_eq!(
            decode(&with_trailer(delta), &order(1)).status,
            DecodeStatus::EofDelta
        );
    }

    #[test]
    fn test_bad_opcode() {
        let block = with_trailer(vec![0x01, 0x01, 0x02, 0x00, 0, 0, 0, 0, 0x05, 0x00, 0x07]);
        assert_eq!(decode(&block, &order(1)).status, DecodeStatus::BadOp);
    }

    #[test]
    fn test_repeat_overrun() {
        // Three samples declared, repeat run of five.
        let block = with_trailer(vec![0x01, 0x01, 0x03, 0x00, 0, 0, 0, 0, 0x05, 0x00, 0x00, 0x05]);
        assert_eq!(decode(&block, &order(1)).status, DecodeStatus::Overrun);
    }

    #[test]
    fn test_repeat_runs_capped() {
        let rows = vec![vec![7u16]; 300];
        let block = encode(&order(1), &rows).unwrap();
        // header + initial + (00 FF) + (00 2C) + crc
        assert_eq!(block.len(), 8 + 2 + 4 + 4);
        assert_eq!(&block[10..14], &[0x00, 0xFF, 0x00, 0x2C]);
        assert_eq!(decode(&block, &order(1)).rows, rows);
    }

    #[test]
    fn test_delta_wraps() {
        let rows = vec![vec![0xFFFF], vec![0x0000], vec![0x8000]];
        let block = encode(&order(1), &rows).unwrap();
        assert_eq!(&block[10..13], &[OP_DELTA, 0x01, 0x00]);
        assert_eq!(decode(&block, &order(1)).rows, rows);
    }

    #[test]
    fn test_encode_rejects_bad_input() {
        assert!(matches!(encode(&order(1), &[]), Err(CodecError::NoSamples)));
        assert!(matches!(
            encode(&order(2), &[vec![1, 2], vec![3]]),
            Err(CodecError::RaggedRow { row: 1, .. })
        ));
        assert!(matches!(
            encode(&order(256), &[vec![0; 256]]),
            Err(CodecError::TooManyFields(256))
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut block = encode(&order(2), &[vec![100, 200], vec![101, 200]]).unwrap();
        assert!(checksum_matches(&block));
        block[9] ^= 0x01;
        assert!(!checksum_matches(&block));
    }

    fn rows_strategy(max_samples: usize) -> impl Strategy<Value = (usize, Vec<Vec<u16>>)> {
        (1usize..6).prop_flat_map(move |fields| {
            let value = prop_oneof![3 => 0u16..4, 1 => any::<u16>()];
            (
                Just(fields),
                prop::collection::vec(prop::collection::vec(value, fields), 1..max_samples),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip((fields, rows) in rows_strategy(600)) {
            let names = order(fields);
            let block = encode(&names, &rows).unwrap();
            let decoded = decode(&block, &names);
            prop_assert_eq!(decoded.status, DecodeStatus::Ok);
            prop_assert_eq!(decoded.rows, rows);
        }

        #[test]
        fn prop_wrong_version_rejected(
            version in 2u8..=255,
            rest in prop::collection::vec(any::<u8>(), 11..64),
            fields in 0usize..4,
        ) {
            let mut block = vec![version];
            block.extend(rest);
            prop_assert_eq!(decode(&block, &order(fields)).status, DecodeStatus::HeaderMismatch);
        }

        #[test]
        fn prop_prefixes_never_decode((fields, rows) in rows_strategy(40)) {
            let names = order(fields);
            let block = encode(&names, &rows).unwrap();
            for len in 0..block.len() {
                let decoded = decode(&block[..len], &names);
                prop_assert_ne!(decoded.status, DecodeStatus::Ok);
                prop_assert!(decoded.rows.is_empty());
            }
        }
    }
}
