// JBD2 Checksum Calculation
// Running commit checksum and per-tag block checksums

use jcommit_core::{ChecksumKind, Tid};

use crate::format::{JBD2_CRC32C_CHKSUM, JBD2_CRC32_CHKSUM, JBD2_CRC32_CHKSUM_SIZE};

/// Calculate CRC32C checksum, continuing from `initial`
pub fn crc32c(data: &[u8], initial: u32) -> u32 {
    crc32c::crc32c_append(initial, data)
}

/// Calculate CRC32 (IEEE) checksum, continuing from `initial`
pub fn crc32(data: &[u8], initial: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(initial);
    hasher.update(data);
    hasher.finalize()
}

fn update(kind: ChecksumKind, data: &[u8], initial: u32) -> u32 {
    match kind {
        ChecksumKind::None => initial,
        ChecksumKind::Crc32 => crc32(data, initial),
        ChecksumKind::Crc32c => crc32c(data, initial),
    }
}

/// `(type, size)` pair stored in the commit block header
pub fn commit_checksum_fields(kind: ChecksumKind) -> (u8, u8) {
    match kind {
        ChecksumKind::None => (0, 0),
        ChecksumKind::Crc32 => (JBD2_CRC32_CHKSUM, JBD2_CRC32_CHKSUM_SIZE),
        ChecksumKind::Crc32c => (JBD2_CRC32C_CHKSUM, JBD2_CRC32_CHKSUM_SIZE),
    }
}

pub fn kind_from_type(checksum_type: u8) -> Option<ChecksumKind> {
    match checksum_type {
        0 => Some(ChecksumKind::None),
        JBD2_CRC32_CHKSUM => Some(ChecksumKind::Crc32),
        JBD2_CRC32C_CHKSUM => Some(ChecksumKind::Crc32c),
        _ => None,
    }
}

/// Checksum accumulated over every block of a transaction in log order
#[derive(Debug, Clone, Copy)]
pub struct RunningChecksum {
    kind: ChecksumKind,
    value: u32,
}

impl RunningChecksum {
    pub fn new(kind: ChecksumKind) -> Self {
        Self { kind, value: 0 }
    }

    pub fn update(&mut self, block: &[u8]) {
        self.value = update(self.kind, block, self.value);
    }

    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    pub fn value(&self) -> u32 {
        self.value
    }
}

/// Low 16 bits of the checksum of a logged block, seeded with the log
/// UUID and the transaction sequence.
pub fn tag_checksum(kind: ChecksumKind, uuid: &[u8; 16], sequence: Tid, data: &[u8]) -> u16 {
    if kind == ChecksumKind::None {
        return 0;
    }
    let mut csum = update(kind, uuid, 0);
    csum = update(kind, &sequence.to_be_bytes(), csum);
    csum = update(kind, data, csum);
    (csum & 0xFFFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_basic() {
        // Test with known values
        let data = b"123456789";
        let checksum = crc32c(data, 0);
        assert_eq!(checksum, 0xe3069283);
    }

    #[test]
    fn test_crc32_basic() {
        assert_eq!(crc32(b"123456789", 0), 0xcbf43926);
    }

    #[test]
    fn test_crc32c_empty() {
        assert_eq!(crc32c(b"", 0), 0);
    }

    #[test]
    fn test_running_checksum_is_incremental() {
        let mut running = RunningChecksum::new(ChecksumKind::Crc32c);
        running.update(b"Hello");
        running.update(b"World");
        assert_eq!(running.value(), crc32c(b"HelloWorld", 0));

        let mut running = RunningChecksum::new(ChecksumKind::Crc32);
        running.update(b"Hello");
        running.update(b"World");
        assert_eq!(running.value(), crc32(b"HelloWorld", 0));
    }

    #[test]
    fn test_disabled_checksum_stays_zero() {
        let mut running = RunningChecksum::new(ChecksumKind::None);
        running.update(b"anything");
        assert_eq!(running.value(), 0);
        assert_eq!(tag_checksum(ChecksumKind::None, &[1; 16], 3, b"data"), 0);
    }

    #[test]
    fn test_tag_checksum_depends_on_sequence() {
        let uuid = [9u8; 16];
        let a = tag_checksum(ChecksumKind::Crc32c, &uuid, 1, b"block");
        let b = tag_checksum(ChecksumKind::Crc32c, &uuid, 2, b"block");
        assert_ne!(a, b);
    }

    #[test]
    fn test_type_round_trip() {
        for kind in [ChecksumKind::None, ChecksumKind::Crc32, ChecksumKind::Crc32c] {
            let (ty, _) = commit_checksum_fields(kind);
            assert_eq!(kind_from_type(ty), Some(kind));
        }
        assert_eq!(kind_from_type(2), None);
    }
}
