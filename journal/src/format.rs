// Journal On-Disk Formats
// Superblock, descriptor, revoke and commit blocks. Everything is big-endian.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use jbd_core::{JournalError, Result};
use std::io::Cursor;

/// Journal magic number, first word of every log control block
pub const JBD_MAGIC_NUMBER: u32 = 0xC03B_3998;

/// Log block types
pub const JBD_DESCRIPTOR_BLOCK: u32 = 1;
pub const JBD_COMMIT_BLOCK: u32 = 2;
pub const JBD_SUPERBLOCK_V1: u32 = 3;
pub const JBD_SUPERBLOCK_V2: u32 = 4;
pub const JBD_REVOKE_BLOCK: u32 = 5;

/// Descriptor tag flags
pub const JBD_FLAG_ESCAPE: u32 = 1;
pub const JBD_FLAG_SAME_UUID: u32 = 2;
pub const JBD_FLAG_DELETED: u32 = 4;
pub const JBD_FLAG_LAST_TAG: u32 = 8;

/// Superblock feature bits
pub const JBD_FEATURE_COMPAT_CHECKSUM: u32 = 0x1;
pub const JBD_FEATURE_INCOMPAT_REVOKE: u32 = 0x1;

/// Commit block checksum type for crc32c
pub const JBD_CRC32C_CHKSUM: u8 = 4;

pub const HEADER_SIZE: usize = 12;
pub const TAG_SIZE: usize = 8;
pub const UUID_SIZE: usize = 16;
const REVOKE_HEADER_SIZE: usize = HEADER_SIZE + 4;
const REVOKE_RECORD_SIZE: usize = 4;

/// Header shared by every log control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub magic: u32,
    pub blocktype: u32,
    pub sequence: u32,
}

impl JournalHeader {
    pub fn new(blocktype: u32, sequence: u32) -> Self {
        Self {
            magic: JBD_MAGIC_NUMBER,
            blocktype,
            sequence,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.blocktype);
        BigEndian::write_u32(&mut buf[8..12], self.sequence);
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: BigEndian::read_u32(&buf[0..4]),
            blocktype: BigEndian::read_u32(&buf[4..8]),
            sequence: BigEndian::read_u32(&buf[8..12]),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.magic == JBD_MAGIC_NUMBER
    }
}

/// One entry of a descriptor block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag {
    pub blocknr: u32,
    pub flags: u32,
}

impl BlockTag {
    pub fn escaped(&self) -> bool {
        self.flags & JBD_FLAG_ESCAPE != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & JBD_FLAG_LAST_TAG != 0
    }
}

/// How many tags fit in one descriptor block, counting the UUID that follows
/// the first tag.
pub fn tags_per_descriptor(block_size: usize) -> usize {
    (block_size - HEADER_SIZE - UUID_SIZE) / TAG_SIZE
}

/// Whether a block's leading word collides with the journal magic.
pub fn needs_escape(data: &[u8]) -> bool {
    data.len() >= 4 && BigEndian::read_u32(&data[0..4]) == JBD_MAGIC_NUMBER
}

/// Clear the magic word in a log copy. Replay puts it back.
pub fn escape_block(data: &mut [u8]) {
    data[0..4].fill(0);
}

pub fn unescape_block(data: &mut [u8]) {
    BigEndian::write_u32(&mut data[0..4], JBD_MAGIC_NUMBER);
}

/// Accumulates tags into a descriptor block
pub struct DescriptorBuilder {
    buf: Vec<u8>,
    offset: usize,
    last_tag: Option<usize>,
    uuid: [u8; 16],
    tags: usize,
}

impl DescriptorBuilder {
    pub fn new(block_size: usize, sequence: u32, uuid: [u8; 16]) -> Self {
        let mut buf = vec![0u8; block_size];
        JournalHeader::new(JBD_DESCRIPTOR_BLOCK, sequence).write_to(&mut buf);
        Self {
            buf,
            offset: HEADER_SIZE,
            last_tag: None,
            uuid,
            tags: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags == 0
    }

    /// Room for one more tag, keeping space for a trailing UUID.
    pub fn has_space(&self) -> bool {
        self.buf.len() - self.offset >= TAG_SIZE + UUID_SIZE
    }

    pub fn push(&mut self, blocknr: u32, escaped: bool) {
        let mut flags = 0;
        if escaped {
            flags |= JBD_FLAG_ESCAPE;
        }
        if self.tags > 0 {
            flags |= JBD_FLAG_SAME_UUID;
        }
        let at = self.offset;
        BigEndian::write_u32(&mut self.buf[at..at + 4], blocknr);
        BigEndian::write_u32(&mut self.buf[at + 4..at + 8], flags);
        self.offset += TAG_SIZE;
        if self.tags == 0 {
            self.buf[self.offset..self.offset + UUID_SIZE].copy_from_slice(&self.uuid);
            self.offset += UUID_SIZE;
        }
        self.last_tag = Some(at);
        self.tags += 1;
    }

    /// Flag the final tag and hand back the block.
    pub fn finish(mut self) -> Vec<u8> {
        if let Some(at) = self.last_tag {
            let flags = BigEndian::read_u32(&self.buf[at + 4..at + 8]) | JBD_FLAG_LAST_TAG;
            BigEndian::write_u32(&mut self.buf[at + 4..at + 8], flags);
        }
        self.buf
    }
}

/// Decode the tags of a descriptor block, stopping at the last-tag flag.
pub fn parse_descriptor(block: &[u8]) -> Vec<BlockTag> {
    let mut tags = Vec::new();
    let mut offset = HEADER_SIZE;

    while offset + TAG_SIZE <= block.len() {
        let tag = BlockTag {
            blocknr: BigEndian::read_u32(&block[offset..offset + 4]),
            flags: BigEndian::read_u32(&block[offset + 4..offset + 8]),
        };
        offset += TAG_SIZE;
        if tag.flags & JBD_FLAG_SAME_UUID == 0 {
            offset += UUID_SIZE;
        }
        tags.push(tag);
        if tag.is_last() {
            break;
        }
    }

    tags
}

/// Pack revoked block numbers into as many revoke blocks as needed.
pub fn encode_revoke_blocks(sequence: u32, blocks: &[u64], block_size: usize) -> Vec<Vec<u8>> {
    let per_block = (block_size - REVOKE_HEADER_SIZE) / REVOKE_RECORD_SIZE;

    blocks
        .chunks(per_block)
        .map(|chunk| {
            let mut buf = vec![0u8; block_size];
            JournalHeader::new(JBD_REVOKE_BLOCK, sequence).write_to(&mut buf);
            let used = REVOKE_HEADER_SIZE + chunk.len() * REVOKE_RECORD_SIZE;
            BigEndian::write_u32(&mut buf[HEADER_SIZE..REVOKE_HEADER_SIZE], used as u32);
            for (i, &block) in chunk.iter().enumerate() {
                let at = REVOKE_HEADER_SIZE + i * REVOKE_RECORD_SIZE;
                BigEndian::write_u32(&mut buf[at..at + REVOKE_RECORD_SIZE], block as u32);
            }
            buf
        })
        .collect()
}

pub fn parse_revoke_block(block: &[u8]) -> Result<Vec<u64>> {
    let used = BigEndian::read_u32(&block[HEADER_SIZE..REVOKE_HEADER_SIZE]) as usize;
    if used < REVOKE_HEADER_SIZE || used > block.len() {
        return Err(JournalError::CorruptJournal(format!(
            "revoke block claims {} bytes",
            used
        )));
    }

    Ok(block[REVOKE_HEADER_SIZE..used]
        .chunks_exact(REVOKE_RECORD_SIZE)
        .map(|record| BigEndian::read_u32(record) as u64)
        .collect())
}

/// Decoded commit block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitBlock {
    pub sequence: u32,
    pub checksum: Option<u32>,
    pub commit_sec: u64,
    pub commit_nsec: u32,
}

impl CommitBlock {
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        JournalHeader::new(JBD_COMMIT_BLOCK, self.sequence).write_to(&mut buf);
        if let Some(checksum) = self.checksum {
            buf[12] = JBD_CRC32C_CHKSUM;
            buf[13] = 4;
            BigEndian::write_u32(&mut buf[16..20], checksum);
        }
        BigEndian::write_u64(&mut buf[48..56], self.commit_sec);
        BigEndian::write_u32(&mut buf[56..60], self.commit_nsec);
        buf
    }

    pub fn decode(block: &[u8]) -> Option<Self> {
        let header = JournalHeader::read_from(block)?;
        if !header.is_valid() || header.blocktype != JBD_COMMIT_BLOCK || block.len() < 60 {
            return None;
        }
        let checksum = match block[12] {
            JBD_CRC32C_CHKSUM => Some(BigEndian::read_u32(&block[16..20])),
            _ => None,
        };
        Some(Self {
            sequence: header.sequence,
            checksum,
            commit_sec: BigEndian::read_u64(&block[48..56]),
            commit_nsec: BigEndian::read_u32(&block[56..60]),
        })
    }
}

/// Journal superblock, stored in the first block of the log area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSuperblock {
    pub header: JournalHeader,

    /// Static information
    pub blocksize: u32,
    pub maxlen: u32,
    pub first: u32,

    /// Dynamic information: first expected sequence and where it starts.
    /// `start == 0` means the log is clean.
    pub sequence: u32,
    pub start: u32,
    pub errno: i32,

    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,

    pub uuid: [u8; 16],
    pub nr_users: u32,
    pub dynsuper: u32,

    pub max_transaction: u32,
    pub max_trans_data: u32,
}

impl JournalSuperblock {
    pub fn new(blocksize: u32, maxlen: u32, uuid: [u8; 16]) -> Self {
        Self {
            header: JournalHeader::new(JBD_SUPERBLOCK_V2, 0),
            blocksize,
            maxlen,
            first: 1,
            sequence: 1,
            start: 0,
            errno: 0,
            feature_compat: 0,
            feature_incompat: JBD_FEATURE_INCOMPAT_REVOKE,
            feature_ro_compat: 0,
            uuid,
            nr_users: 1,
            dynsuper: 0,
            max_transaction: 0,
            max_trans_data: 0,
        }
    }

    pub fn has_checksum(&self) -> bool {
        self.feature_compat & JBD_FEATURE_COMPAT_CHECKSUM != 0
    }

    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(vec![0u8; block_size]);
        cursor.write_u32::<BigEndian>(self.header.magic)?;
        cursor.write_u32::<BigEndian>(self.header.blocktype)?;
        cursor.write_u32::<BigEndian>(self.header.sequence)?;
        cursor.write_u32::<BigEndian>(self.blocksize)?;
        cursor.write_u32::<BigEndian>(self.maxlen)?;
        cursor.write_u32::<BigEndian>(self.first)?;
        cursor.write_u32::<BigEndian>(self.sequence)?;
        cursor.write_u32::<BigEndian>(self.start)?;
        cursor.write_i32::<BigEndian>(self.errno)?;
        cursor.write_u32::<BigEndian>(self.feature_compat)?;
        cursor.write_u32::<BigEndian>(self.feature_incompat)?;
        cursor.write_u32::<BigEndian>(self.feature_ro_compat)?;
        std::io::Write::write_all(&mut cursor, &self.uuid)?;
        cursor.write_u32::<BigEndian>(self.nr_users)?;
        cursor.write_u32::<BigEndian>(self.dynsuper)?;
        cursor.write_u32::<BigEndian>(self.max_transaction)?;
        cursor.write_u32::<BigEndian>(self.max_trans_data)?;
        Ok(cursor.into_inner())
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(block);
        let header = JournalHeader {
            magic: cursor.read_u32::<BigEndian>()?,
            blocktype: cursor.read_u32::<BigEndian>()?,
            sequence: cursor.read_u32::<BigEndian>()?,
        };
        if !header.is_valid() {
            return Err(JournalError::CorruptJournal(
                "invalid journal superblock magic".to_string(),
            ));
        }
        if header.blocktype != JBD_SUPERBLOCK_V1 && header.blocktype != JBD_SUPERBLOCK_V2 {
            return Err(JournalError::CorruptJournal(format!(
                "unexpected superblock type {}",
                header.blocktype
            )));
        }

        let blocksize = cursor.read_u32::<BigEndian>()?;
        let maxlen = cursor.read_u32::<BigEndian>()?;
        let first = cursor.read_u32::<BigEndian>()?;
        let sequence = cursor.read_u32::<BigEndian>()?;
        let start = cursor.read_u32::<BigEndian>()?;
        let errno = cursor.read_i32::<BigEndian>()?;
        let feature_compat = cursor.read_u32::<BigEndian>()?;
        let feature_incompat = cursor.read_u32::<BigEndian>()?;
        let feature_ro_compat = cursor.read_u32::<BigEndian>()?;
        let mut uuid = [0u8; 16];
        std::io::Read::read_exact(&mut cursor, &mut uuid)?;

        Ok(Self {
            header,
            blocksize,
            maxlen,
            first,
            sequence,
            start,
            errno,
            feature_compat,
            feature_incompat,
            feature_ro_compat,
            uuid,
            nr_users: cursor.read_u32::<BigEndian>()?,
            dynsuper: cursor.read_u32::<BigEndian>()?,
            max_transaction: cursor.read_u32::<BigEndian>()?,
            max_trans_data: cursor.read_u32::<BigEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_last_tag_and_uuid() {
        let uuid = [7u8; 16];
        let mut desc = DescriptorBuilder::new(1024, 42, uuid);
        desc.push(100, false);
        desc.push(200, true);
        desc.push(300, false);
        let block = desc.finish();

        let header = JournalHeader::read_from(&block).unwrap();
        assert_eq!(header, JournalHeader::new(JBD_DESCRIPTOR_BLOCK, 42));
        assert_eq!(&block[HEADER_SIZE + TAG_SIZE..HEADER_SIZE + TAG_SIZE + UUID_SIZE], &uuid);

        let tags = parse_descriptor(&block);
        assert_eq!(tags.iter().map(|t| t.blocknr).collect::<Vec<_>>(), vec![100, 200, 300]);
        assert_eq!(tags[0].flags, 0);
        assert_eq!(tags[1].flags, JBD_FLAG_ESCAPE | JBD_FLAG_SAME_UUID);
        assert_eq!(tags[2].flags, JBD_FLAG_SAME_UUID | JBD_FLAG_LAST_TAG);
    }

    #[test]
    fn test_descriptor_capacity_matches_has_space() {
        let mut desc = DescriptorBuilder::new(512, 1, [0u8; 16]);
        let mut pushed = 0;
        while desc.has_space() {
            desc.push(pushed as u32, false);
            pushed += 1;
        }
        assert_eq!(pushed, tags_per_descriptor(512));
        assert_eq!(parse_descriptor(&desc.finish()).len(), pushed);
    }

    #[test]
    fn test_escape_detection() {
        let mut data = vec![0u8; 64];
        BigEndian::write_u32(&mut data[0..4], JBD_MAGIC_NUMBER);
        assert!(needs_escape(&data));
        escape_block(&mut data);
        assert!(!needs_escape(&data));
        unescape_block(&mut data);
        assert!(needs_escape(&data));
    }

    #[test]
    fn test_revoke_blocks_split() {
        let blocks: Vec<u64> = (0..300).collect();
        let encoded = encode_revoke_blocks(9, &blocks, 512);
        // (512 - 16) / 4 = 124 records per block
        assert_eq!(encoded.len(), 3);
        let decoded: Vec<u64> = encoded
            .iter()
            .flat_map(|b| parse_revoke_block(b).unwrap())
            .collect();
        assert_eq!(decoded, blocks);
    }

    #[test]
    fn test_commit_block_checksum_optional() {
        let plain = CommitBlock {
            sequence: 5,
            checksum: None,
            commit_sec: 1_700_000_000,
            commit_nsec: 12,
        };
        assert_eq!(CommitBlock::decode(&plain.encode(1024)), Some(plain));

        let summed = CommitBlock {
            checksum: Some(0xDEAD_BEEF),
            ..plain
        };
        assert_eq!(CommitBlock::decode(&summed.encode(1024)), Some(summed));
    }

    #[test]
    fn test_superblock_rejects_bad_magic() {
        let sb = JournalSuperblock::new(1024, 256, [1u8; 16]);
        let mut block = sb.encode(1024).unwrap();
        assert_eq!(JournalSuperblock::decode(&block).unwrap(), sb);
        block[0] = 0;
        assert!(JournalSuperblock::decode(&block).is_err());
    }
}
