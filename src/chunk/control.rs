use bytes::{Buf, BufMut, Bytes};

/// Flag of ABORT and SHUTDOWN COMPLETE: the packet carries the sender's own verification tag
///  rather than the receiver's, because the sender has no association state (yet)
const FLAG_T: u8 = 0b0000_0001;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AbortChunk {
    pub verification_tag_reflected: bool,
    /// raw error cause TLVs
    pub error_causes: Bytes,
}
impl AbortChunk {
    pub(crate) fn new(flags: u8, error_causes: Bytes) -> AbortChunk {
        AbortChunk {
            verification_tag_reflected: flags & FLAG_T != 0,
            error_causes,
        }
    }

    pub(crate) fn flags(&self) -> u8 {
        if self.verification_tag_reflected { FLAG_T } else { 0 }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShutdownChunk {
    pub cumulative_tsn_ack: u32,
}
impl ShutdownChunk {
    pub(crate) const VALUE_LEN: usize = 4;

    pub(crate) fn ser_value(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.cumulative_tsn_ack);
    }

    pub(crate) fn deser_value(buf: &mut impl Buf) -> anyhow::Result<ShutdownChunk> {
        Ok(ShutdownChunk {
            cumulative_tsn_ack: buf.try_get_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShutdownCompleteChunk {
    pub verification_tag_reflected: bool,
}
impl ShutdownCompleteChunk {
    pub(crate) fn from_flags(flags: u8) -> ShutdownCompleteChunk {
        ShutdownCompleteChunk {
            verification_tag_reflected: flags & FLAG_T != 0,
        }
    }

    pub(crate) fn flags(&self) -> u8 {
        if self.verification_tag_reflected { FLAG_T } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::not_reflected(0, false)]
    #[case::reflected(1, true)]
    #[case::other_bits_ignored(0b1111_1110, false)]
    fn test_t_flag(#[case] flags: u8, #[case] expected: bool) {
        assert_eq!(AbortChunk::new(flags, Bytes::new()).verification_tag_reflected, expected);
        assert_eq!(ShutdownCompleteChunk::from_flags(flags).verification_tag_reflected, expected);
    }

    #[test]
    fn test_shutdown_truncated() {
        let buf = vec![0, 0, 1];
        let mut b: &[u8] = &buf;
        assert!(ShutdownChunk::deser_value(&mut b).is_err());
    }
}
