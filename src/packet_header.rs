use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISCSI};
use std::fmt::{Debug, Formatter};

/// CRC32C (Castagnoli) as required by RFC 4960 appendix B
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The common header at the start of every SCTP packet:
///
/// ```ascii
///  0: source port (u16)
///  2: destination port (u16)
///  4: verification tag (u32)
///  8: checksum (u32)
/// ```
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
    pub checksum: u32,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SCTP{{{}->{}@{:08x}:{:08x}}}", self.source_port, self.destination_port, self.verification_tag, self.checksum)
    }
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 12;
    const CHECKSUM_OFFSET: usize = 8;

    pub fn new(source_port: u16, destination_port: u16, verification_tag: u32) -> PacketHeader {
        PacketHeader {
            source_port,
            destination_port,
            verification_tag,
            checksum: 0,
        }
    }

    /// Writes the header with whatever checksum it currently has. The checksum covers the
    ///  entire packet, so it is patched in by [finalize_checksum] after all chunks are written.
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u32(self.verification_tag);
        buf.put_u32(self.checksum);
    }

    /// NB: This does not verify the checksum, see [verify_checksum]
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        Ok(PacketHeader {
            source_port: buf.try_get_u16()?,
            destination_port: buf.try_get_u16()?,
            verification_tag: buf.try_get_u32()?,
            checksum: buf.try_get_u32()?,
        })
    }
}

/// Calculates the CRC32C of a serialized packet, treating the checksum field as zero.
pub fn compute_checksum(packet: &[u8]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(&packet[..PacketHeader::CHECKSUM_OFFSET]);
    digest.update(&[0; 4]);
    digest.update(&packet[PacketHeader::CHECKSUM_OFFSET + 4..]);
    digest.finalize()
}

/// Patches the checksum into a fully serialized packet.
///
/// NB: The CRC is transmitted least significant byte first, which is how all interoperable
///  SCTP stacks (and RFC 4960's reference code) put it on the wire
pub fn finalize_checksum(packet: &mut [u8]) {
    let checksum = compute_checksum(packet);
    packet[PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 4]
        .copy_from_slice(&checksum.to_le_bytes());
}

pub fn verify_checksum(packet: &[u8]) -> bool {
    if packet.len() < PacketHeader::SERIALIZED_LEN {
        return false;
    }
    let transmitted = &packet[PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 4];
    transmitted == compute_checksum(packet).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::webrtc_default(PacketHeader { source_port: 5000, destination_port: 5000, verification_tag: 0, checksum: 0 }, vec![0x13,0x88, 0x13,0x88, 0,0,0,0, 0,0,0,0])]
    #[case::with_tag(PacketHeader { source_port: 1, destination_port: 2, verification_tag: 0x12345678, checksum: 0xabcdef01 }, vec![0,1, 0,2, 0x12,0x34,0x56,0x78, 0xab,0xcd,0xef,0x01])]
    fn test_ser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf, expected);

        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated(vec![0x13,0x88, 0x13,0x88, 0,0,0,0, 0,0,0])]
    fn test_deser_too_short(#[case] buf: Vec<u8>) {
        let mut b: &[u8] = &buf;
        assert!(PacketHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_debug() {
        let header = PacketHeader { source_port: 5000, destination_port: 5001, verification_tag: 0x1234, checksum: 0xff };
        assert_eq!(format!("{:?}", header), "SCTP{5000->5001@00001234:000000ff}");
    }

    #[test]
    fn test_finalize_checksum() {
        let mut packet = vec![0x13,0x88, 0x13,0x88, 0x12,0x34,0x56,0x78, 0,0,0,0, 0x0b,0,0,4];
        finalize_checksum(&mut packet);
        assert_eq!(&packet[8..12], &[0x67, 0x42, 0xa8, 0x04]);
        assert!(verify_checksum(&packet));
    }

    #[test]
    fn test_checksum_ignores_transmitted_value() {
        let mut packet = vec![0x13,0x88, 0x13,0x88, 0x12,0x34,0x56,0x78, 1,2,3,4, 0x0b,0,0,4];
        assert_eq!(compute_checksum(&packet), 0x04a84267);
        assert!(!verify_checksum(&packet));
        finalize_checksum(&mut packet);
        assert!(verify_checksum(&packet));
    }

    #[rstest]
    #[case::corrupted_tag(4)]
    #[case::corrupted_chunk(13)]
    fn test_verify_checksum_detects_corruption(#[case] corrupted_offset: usize) {
        let mut packet = vec![0x13,0x88, 0x13,0x88, 0x12,0x34,0x56,0x78, 0,0,0,0, 0x0b,0,0,4];
        finalize_checksum(&mut packet);
        packet[corrupted_offset] ^= 0x01;
        assert!(!verify_checksum(&packet));
    }

    #[test]
    fn test_verify_checksum_too_short() {
        assert!(!verify_checksum(&[0; 11]));
    }
}
