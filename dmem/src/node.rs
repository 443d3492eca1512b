use crate::crc::crc16;

/// Size of one allocation unit in bytes. A region header occupies exactly
/// one unit, so this is also the encoded header size.
pub const BLOCK_SIZE_BYTES: usize = 8;

/// `next` value marking the last header of the chain. Reserving it caps the
/// arena at 0xFFFE addressable units.
pub const END_OF_CHAIN: u16 = 0xFFFF;

// bytes of the encoded header covered by the checksum (everything before it)
const CRC_SPAN: usize = 6;

/// Region tag. The zero value is reserved as "no info" and never appears in
/// a live header, so a zeroed unit can never verify as one.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Free = 1,
    Allocated = 3,
}

/// One region header of the block directory.
///
/// `next` is the unit index of the following header in address order
/// (`END_OF_CHAIN` terminates). `size` counts allocation units and includes
/// the unit holding the header itself, so it is never zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockNode {
    pub kind: BlockKind,
    pub next: u16,
    pub size: u16,
}

impl BlockNode {
    /// Serializes the header into its in-arena form, checksum recomputed.
    ///
    /// Layout: `[kind u8][reserved u8][next u16 le][size u16 le][crc u16 le]`.
    pub fn encode(&self) -> [u8; BLOCK_SIZE_BYTES] {
        let mut raw = [0u8; BLOCK_SIZE_BYTES];
        raw[0] = self.kind as u8;
        // raw[1] is reserved and stays zero
        raw[2..4].copy_from_slice(&self.next.to_le_bytes());
        raw[4..6].copy_from_slice(&self.size.to_le_bytes());
        let crc = crc16(&raw[..CRC_SPAN]);
        raw[6..8].copy_from_slice(&crc.to_le_bytes());
        raw
    }

    /// Reads a header back from its in-arena form, verifying the checksum.
    /// `None` means the unit does not hold a valid header: checksum
    /// mismatch, a reserved `kind` value, or a `size` below one unit.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let raw: &[u8; BLOCK_SIZE_BYTES] = raw.first_chunk()?;
        let stored = u16::from_le_bytes([raw[6], raw[7]]);
        if stored != crc16(&raw[..CRC_SPAN]) {
            return None;
        }
        let kind = match raw[0] {
            1 => BlockKind::Free,
            3 => BlockKind::Allocated,
            _ => return None,
        };
        let size = u16::from_le_bytes([raw[4], raw[5]]);
        if size == 0 {
            return None;
        }
        Some(BlockNode {
            kind,
            next: u16::from_le_bytes([raw[2], raw[3]]),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockNode {
        BlockNode {
            kind: BlockKind::Free,
            next: 0x0102,
            size: 0x0304,
        }
    }

    #[test]
    fn encode_then_decode_preserves_the_header() {
        let raw = sample().encode();
        assert_eq!(BlockNode::decode(&raw), Some(sample()));
    }

    #[test]
    fn every_covered_byte_is_guarded_by_the_checksum() {
        for byte in 0..CRC_SPAN {
            for bit in 0..8 {
                let mut raw = sample().encode();
                raw[byte] ^= 1 << bit;
                assert_eq!(
                    BlockNode::decode(&raw),
                    None,
                    "flip of bit {bit} in byte {byte} must not verify"
                );
            }
        }
    }

    #[test]
    fn damaged_checksum_field_fails_verification() {
        let mut raw = sample().encode();
        raw[7] ^= 0x80;
        assert_eq!(BlockNode::decode(&raw), None);
    }

    #[test]
    fn zeroed_unit_is_not_a_header() {
        assert_eq!(BlockNode::decode(&[0u8; BLOCK_SIZE_BYTES]), None);
    }

    #[test]
    fn reserved_kind_values_are_rejected_even_with_a_valid_checksum() {
        for kind in [0u8, 2, 4, 0xFF] {
            let mut raw = sample().encode();
            raw[0] = kind;
            let crc = crc16(&raw[..CRC_SPAN]);
            raw[6..8].copy_from_slice(&crc.to_le_bytes());
            assert_eq!(BlockNode::decode(&raw), None, "kind {kind} must not decode");
        }
    }

    #[test]
    fn zero_size_is_rejected_even_with_a_valid_checksum() {
        let mut raw = sample().encode();
        raw[4] = 0;
        raw[5] = 0;
        let crc = crc16(&raw[..CRC_SPAN]);
        raw[6..8].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(BlockNode::decode(&raw), None);
    }

    #[test]
    fn short_input_is_not_a_header() {
        let raw = sample().encode();
        assert_eq!(BlockNode::decode(&raw[..5]), None);
    }
}
