//! Metadump stream wire format. Bit-exact, little-endian, following the
//! same fixed-header-plus-payload framing an ext4-style writer uses for its
//! own disk records, generalised to this tool's cluster-of-index-items
//! shape.

use fsforge_core::{Error, Result};

/// Magic value stamped at the start of every cluster header,
/// `0xBD5C25E27295668B` little-endian.
pub const CLUSTER_MAGIC: u64 = 0xBD5C_25E2_7295_668B;
/// Fixed cluster size in bytes.
pub const CLUSTER_SIZE: usize = 1024;
/// `sizeof(header)`: magic(8) + bytenr(8) + nritems(4) + compress(1).
pub const HEADER_SIZE: usize = 8 + 8 + 4 + 1;
/// `sizeof(item)`: bytenr(8) + size(4).
pub const ITEM_SIZE: usize = 8 + 4;
/// `(1024 - sizeof(header)) / sizeof(item)`.
pub const ITEMS_PER_CLUSTER: usize = (CLUSTER_SIZE - HEADER_SIZE) / ITEM_SIZE;

/// Logical offset of the superblock, and its fixed on-disk size, per
/// ("the item whose `bytenr == 65536`... `size == 4096`").
pub const SUPER_INFO_OFFSET: u64 = 65536;
pub const SUPER_INFO_SIZE: u32 = 4096;

/// Backup superblock mirror offsets, index 0 being [`SUPER_INFO_OFFSET`]
/// itself.
/// A mirror is only written if it falls within the target device's size.
pub const SUPER_MIRROR_OFFSETS: [u64; 3] = [SUPER_INFO_OFFSET, 64 * 1024 * 1024, 256 * 1024 * 1024 * 1024];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterCompress {
    None = 0,
    Zlib = 1,
}

impl ClusterCompress {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ClusterCompress::None),
            1 => Ok(ClusterCompress::Zlib),
            other => Err(Error::invalid("cluster header", 0, format!("unknown compress tag {other}"))),
        }
    }
}

/// One index entry: the logical address of the extent the following
/// buffer restores, and its size.
#[derive(Debug, Clone, Copy)]
pub struct IndexItem {
    pub bytenr: u64,
    pub size: u32,
}

/// A decoded cluster header plus its index items, with the header's raw
/// `bytenr` kept as "first byte covered by this cluster in the stream"
///, distinct from any one index item's bytenr.
#[derive(Debug, Clone)]
pub struct ClusterHeader {
    pub stream_bytenr: u64,
    pub compress: ClusterCompress,
    pub items: Vec<IndexItem>,
}

impl ClusterHeader {
    pub fn encode(&self) -> Vec<u8> {
        assert!(self.items.len() <= ITEMS_PER_CLUSTER);
        let mut out = vec![0u8; CLUSTER_SIZE];
        out[0..8].copy_from_slice(&CLUSTER_MAGIC.to_le_bytes());
        out[8..16].copy_from_slice(&self.stream_bytenr.to_le_bytes());
        out[16..20].copy_from_slice(&(self.items.len() as u32).to_le_bytes());
        out[20] = self.compress as u8;
        let mut off = HEADER_SIZE;
        for item in &self.items {
            out[off..off + 8].copy_from_slice(&item.bytenr.to_le_bytes());
            out[off + 8..off + 12].copy_from_slice(&item.size.to_le_bytes());
            off += ITEM_SIZE;
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::invalid("cluster header", 0, "buffer shorter than header"));
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != CLUSTER_MAGIC {
            return Err(Error::invalid("cluster header", 0, format!("bad magic {magic:#x}")));
        }
        let stream_bytenr = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let nritems = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        let compress = ClusterCompress::from_u8(buf[20])?;
        if nritems > ITEMS_PER_CLUSTER {
            return Err(Error::invalid(
                "cluster header",
                stream_bytenr,
                format!("nritems {nritems} exceeds per-cluster cap {ITEMS_PER_CLUSTER}"),
            ));
        }
        let mut items = Vec::with_capacity(nritems);
        let mut off = HEADER_SIZE;
        for _ in 0..nritems {
            if off + ITEM_SIZE > buf.len() {
                return Err(Error::invalid("cluster header", stream_bytenr, "truncated index table"));
            }
            let bytenr = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            let size = u32::from_le_bytes(buf[off + 8..off + 12].try_into().unwrap());
            items.push(IndexItem { bytenr, size });
            off += ITEM_SIZE;
        }
        Ok(ClusterHeader {
            stream_bytenr,
            compress,
            items,
        })
    }
}

/// Rounds `len` up to the next [`CLUSTER_SIZE`] boundary, for the
/// zero-padding step require after every cluster's buffers.
pub fn pad_len(len: usize) -> usize {
    (len + CLUSTER_SIZE - 1) / CLUSTER_SIZE * CLUSTER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = ClusterHeader {
            stream_bytenr: 0,
            compress: ClusterCompress::Zlib,
            items: vec![
                IndexItem { bytenr: SUPER_INFO_OFFSET, size: SUPER_INFO_SIZE },
                IndexItem { bytenr: 1 << 20, size: 4096 },
            ],
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), CLUSTER_SIZE);
        let decoded = ClusterHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.stream_bytenr, 0);
        assert_eq!(decoded.items.len(), 2);
        assert_eq!(decoded.items[0].bytenr, SUPER_INFO_OFFSET);
        assert_eq!(decoded.compress, ClusterCompress::Zlib);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8; CLUSTER_SIZE];
        buf[0] = 1;
        assert!(ClusterHeader::decode(&buf).is_err());
    }

    #[test]
    fn pad_len_rounds_up() {
        assert_eq!(pad_len(0), 0);
        assert_eq!(pad_len(1), CLUSTER_SIZE);
        assert_eq!(pad_len(CLUSTER_SIZE), CLUSTER_SIZE);
        assert_eq!(pad_len(CLUSTER_SIZE + 1), 2 * CLUSTER_SIZE);
    }
}
