//! IPv4 header decoding.
//!
//! Wire layout (RFC 791 §3.1):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |version|  ihl  |   dscp + ecn  |         total length          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        identification         |flags|    fragment offset      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      ttl      |   protocol    |        header checksum        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        source address                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      destination address                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       options (ignored)                       |
//! /                              ...                              /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! All multi-byte fields are big-endian on the wire and converted with
//! `u16::from_be_bytes`, never by reinterpreting platform-endian memory.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Smallest legal IPv4 header: five 32-bit words, no options.
pub const MIN_HEADER_LEN: usize = 20;
/// Largest legal IPv4 header: the IHL field is 4 bits, so 15 words.
pub const MAX_HEADER_LEN: usize = 60;

// Flag bits within the 3-bit field: reserved / don't-fragment /
// more-fragments, most significant first.
const FLAG_DONT_FRAGMENT: u8 = 0b010;
const FLAG_MORE_FRAGMENTS: u8 = 0b001;

/// Why a datagram was rejected by [`Ipv4Header::decode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("header length {0} below the {MIN_HEADER_LEN}-byte minimum")]
    InvalidHeaderLength(usize),

    #[error("total length {total} shorter than header length {header_len}")]
    InvalidTotalLength { total: u16, header_len: usize },
}

/// A decoded IPv4 header.
///
/// Borrows the datagram it was decoded from; `payload` is the slice between
/// the end of the header and `total_length`, so the value must be consumed
/// before the receive buffer is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header<'a> {
    pub version: u8,
    /// Header length in bytes (IHL x 4), always a multiple of 4 in [20, 60].
    pub header_len: usize,
    /// DSCP + ECN bits, carried through uninterpreted.
    pub dscp_ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    /// Top 3 bits of the flags/offset field.
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    /// Next-layer protocol id, not interpreted here.
    pub protocol: u8,
    /// Carried through unvalidated.
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Header<'a> {
    /// Decode one received datagram.
    ///
    /// `datagram` must be exactly the bytes one receive completion delivered;
    /// lengths declared by the header are validated against it before any
    /// slicing, so a hostile length field can never read out of bounds.
    pub fn decode(datagram: &'a [u8]) -> Result<Self, DecodeError> {
        let got = datagram.len();
        if got < MIN_HEADER_LEN {
            return Err(DecodeError::TooShort {
                needed: MIN_HEADER_LEN,
                got,
            });
        }

        let version = datagram[0] >> 4;
        if version != 4 {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let header_len = usize::from(datagram[0] & 0x0F) * 4;
        if header_len < MIN_HEADER_LEN {
            return Err(DecodeError::InvalidHeaderLength(header_len));
        }
        debug_assert!(header_len <= MAX_HEADER_LEN); // 4-bit IHL caps at 15 words
        if got < header_len {
            return Err(DecodeError::TooShort {
                needed: header_len,
                got,
            });
        }

        let total_length = u16::from_be_bytes([datagram[2], datagram[3]]);
        if usize::from(total_length) < header_len {
            return Err(DecodeError::InvalidTotalLength {
                total: total_length,
                header_len,
            });
        }
        if usize::from(total_length) > got {
            return Err(DecodeError::TooShort {
                needed: usize::from(total_length),
                got,
            });
        }

        // Mask before shifting: a signed shift would smear the flag bits
        // into the offset.
        let flags_and_offset = u16::from_be_bytes([datagram[6], datagram[7]]);
        let flags = (flags_and_offset >> 13) as u8;
        let fragment_offset = (flags_and_offset & 0x1FFF) >> 3;

        Ok(Self {
            version,
            header_len,
            dscp_ecn: datagram[1],
            total_length,
            identification: u16::from_be_bytes([datagram[4], datagram[5]]),
            flags,
            fragment_offset,
            ttl: datagram[8],
            protocol: datagram[9],
            checksum: u16::from_be_bytes([datagram[10], datagram[11]]),
            source: Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]),
            destination: Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]),
            payload: &datagram[header_len..usize::from(total_length)],
        })
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags & FLAG_DONT_FRAGMENT != 0
    }

    pub fn more_fragments(&self) -> bool {
        self.flags & FLAG_MORE_FRAGMENTS != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_header() -> Vec<u8> {
        vec![
            0x45, // Version (4) + IHL (5)
            0x00, // DSCP + ECN
            0x00, 0x14, // Total length: 20
            0x00, 0x01, // Identification
            0x00, 0x00, // Flags + fragment offset
            0x40, // TTL: 64
            0x06, // Protocol: TCP (6)
            0xab, 0xcd, // Checksum (not validated)
            0xc0, 0xa8, 0x01, 0x01, // Src: 192.168.1.1
            0xc0, 0xa8, 0x01, 0x02, // Dst: 192.168.1.2
        ]
    }

    #[test]
    fn test_decode_minimal_header() {
        let datagram = base_header();
        let header = Ipv4Header::decode(&datagram).unwrap();

        assert_eq!(header.version, 4);
        assert_eq!(header.header_len, 20);
        assert_eq!(header.total_length, 20);
        assert_eq!(header.identification, 0x0001);
        assert_eq!(header.ttl, 64);
        assert_eq!(header.protocol, 6);
        assert_eq!(header.checksum, 0xabcd);
        assert_eq!(header.source, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(header.destination, Ipv4Addr::new(192, 168, 1, 2));
        assert!(header.payload.is_empty());
    }

    #[test]
    fn test_too_short_rejected() {
        let datagram = [0x45, 0x00, 0x00, 0x14];
        assert_eq!(
            Ipv4Header::decode(&datagram),
            Err(DecodeError::TooShort { needed: 20, got: 4 })
        );
    }

    #[test]
    fn test_unsupported_version_after_length_check() {
        // 20 bytes available, version nibble says 6.
        let mut datagram = base_header();
        datagram[0] = 0x65;
        assert_eq!(
            Ipv4Header::decode(&datagram),
            Err(DecodeError::UnsupportedVersion(6))
        );
    }

    #[test]
    fn test_header_length_below_minimum_rejected() {
        // IHL 4 -> 16 bytes, below the 20-byte floor.
        let mut datagram = base_header();
        datagram[0] = 0x44;
        assert_eq!(
            Ipv4Header::decode(&datagram),
            Err(DecodeError::InvalidHeaderLength(16))
        );
    }

    #[test]
    fn test_options_header_shorter_than_ihl_rejected() {
        // IHL 6 declares 24 bytes but only 20 arrived.
        let mut datagram = base_header();
        datagram[0] = 0x46;
        assert_eq!(
            Ipv4Header::decode(&datagram),
            Err(DecodeError::TooShort { needed: 24, got: 20 })
        );
    }

    #[test]
    fn test_total_length_below_header_length_rejected() {
        let mut datagram = base_header();
        datagram[2] = 0x00;
        datagram[3] = 0x10; // total length 16 < header length 20
        assert_eq!(
            Ipv4Header::decode(&datagram),
            Err(DecodeError::InvalidTotalLength {
                total: 16,
                header_len: 20
            })
        );
    }

    #[test]
    fn test_truncated_datagram_rejected_not_sliced() {
        // Header declares 28 bytes total but the receive delivered 24.
        let mut datagram = base_header();
        datagram[2] = 0x00;
        datagram[3] = 0x1c;
        datagram.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            Ipv4Header::decode(&datagram),
            Err(DecodeError::TooShort { needed: 28, got: 24 })
        );
    }

    #[test]
    fn test_payload_bounded_by_total_length() {
        // 8 payload bytes declared, 12 received; the trailing 4 are not ours.
        let mut datagram = base_header();
        datagram[2] = 0x00;
        datagram[3] = 0x1c; // total length 28
        datagram.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        datagram.extend_from_slice(&[0xff; 4]);

        let header = Ipv4Header::decode(&datagram).unwrap();
        assert_eq!(
            header.payload.len(),
            usize::from(header.total_length) - header.header_len
        );
        assert_eq!(header.payload, &[1, 2, 3, 4, 5, 6, 7, 8][..]);
    }

    #[test]
    fn test_more_fragments_flag() {
        let mut datagram = base_header();
        datagram[6] = 0x20;
        datagram[7] = 0x00;

        let header = Ipv4Header::decode(&datagram).unwrap();
        assert_eq!(header.flags, 0b001);
        assert!(header.more_fragments());
        assert!(!header.dont_fragment());
        assert_eq!(header.fragment_offset, 0);
    }

    #[test]
    fn test_dont_fragment_flag() {
        let mut datagram = base_header();
        datagram[6] = 0x40;
        datagram[7] = 0x00;

        let header = Ipv4Header::decode(&datagram).unwrap();
        assert_eq!(header.flags, 0b010);
        assert!(header.dont_fragment());
        assert!(!header.more_fragments());
        assert_eq!(header.fragment_offset, 0);
    }

    #[test]
    fn test_fragment_offset_masks_before_shifting() {
        let mut datagram = base_header();
        datagram[6] = 0x00;
        datagram[7] = 0x05;

        let header = Ipv4Header::decode(&datagram).unwrap();
        assert_eq!(header.flags, 0);
        assert_eq!(header.fragment_offset, (0x0005 & 0x1FFF) >> 3);

        // Flag bits set alongside a nonzero offset stay out of the offset.
        datagram[6] = 0xBF; // flags 0b101, offset field 0x1FFF
        datagram[7] = 0xFF;
        let header = Ipv4Header::decode(&datagram).unwrap();
        assert_eq!(header.flags, 0b101);
        assert_eq!(header.fragment_offset, 0x1FFF >> 3);
    }

    #[test]
    fn test_round_trip_known_fields() {
        let datagram = [
            0x46, // Version 4, IHL 6 (24-byte header)
            0xb8, // DSCP + ECN
            0x00, 0x20, // Total length: 32
            0x12, 0x34, // Identification
            0x40, 0x08, // Don't-fragment, offset field 8
            0x80, // TTL: 128
            0x11, // Protocol: UDP (17)
            0xfe, 0xdc, // Checksum
            0x0a, 0x00, 0x00, 0x01, // Src: 10.0.0.1
            0x0a, 0x00, 0x00, 0x02, // Dst: 10.0.0.2
            0x01, 0x02, 0x03, 0x04, // Options (ignored)
            0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00, 0x11, // Payload
        ];

        let header = Ipv4Header::decode(&datagram).unwrap();
        assert_eq!(header.version, 4);
        assert_eq!(header.header_len, 24);
        assert_eq!(header.header_len % 4, 0);
        assert!((MIN_HEADER_LEN..=MAX_HEADER_LEN).contains(&header.header_len));
        assert_eq!(header.dscp_ecn, 0xb8);
        assert_eq!(header.total_length, 32);
        assert_eq!(header.identification, 0x1234);
        assert!(header.dont_fragment());
        assert_eq!(header.fragment_offset, (0x0008 & 0x1FFF) >> 3);
        assert_eq!(header.ttl, 128);
        assert_eq!(header.protocol, 17);
        assert_eq!(header.checksum, 0xfedc);
        assert_eq!(header.source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(header.destination, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(
            header.payload,
            &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00, 0x11][..]
        );
    }
}
