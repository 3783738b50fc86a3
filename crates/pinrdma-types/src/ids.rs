strong_type!(ProcessId, u32);
strong_type!(SessionId, u64);
strong_type!(Pfn, u64, hex);
strong_type!(Iova, u64, hex);
strong_type!(QpNum, u32);

impl Pfn {
    /// Offset this frame number by `n` frames.
    #[inline]
    pub fn offset(self, n: u64) -> Pfn {
        Pfn(self.0 + n)
    }
}

impl Iova {
    #[inline]
    pub fn advance(self, bytes: u64) -> Iova {
        Iova(self.0 + bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id() {
        let pid = ProcessId(4242);
        assert_eq!(pid.to_string(), "4242");
        assert_eq!(format!("{:?}", pid), "ProcessId(4242)");
    }

    #[test]
    fn test_pfn_arithmetic() {
        let pfn = Pfn(0x100);
        assert_eq!(pfn.offset(0x10), Pfn(0x110));
        assert_eq!(pfn.to_string(), "0x100");
    }

    #[test]
    fn test_iova_advance() {
        assert_eq!(Iova(0x1000).advance(0x10), Iova(0x1010));
    }

    #[test]
    fn test_session_id_serde() {
        let id = SessionId(999);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "999");
        let parsed: SessionId = serde_json::from_str("999").unwrap();
        assert_eq!(parsed, id);
    }
}
