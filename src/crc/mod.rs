use crc::{CRC_32_ISCSI, Crc};

/// CRC32C (Castagnoli), the BoC trailing checksum.
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[cfg(test)]
mod tests;
