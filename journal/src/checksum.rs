// Commit Block Checksums
// CRC32C over every log block a transaction wrote, in log order

/// Running checksum of one transaction's log blocks
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionChecksum {
    crc: u32,
    blocks: u32,
}

impl TransactionChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, block: &[u8]) {
        self.crc = crc32c::crc32c_append(self.crc, block);
        self.blocks += 1;
    }

    pub fn value(&self) -> u32 {
        self.crc
    }

    pub fn blocks(&self) -> u32 {
        self.blocks
    }
}
