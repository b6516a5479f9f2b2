//! Metadump Writer and Restorer.

pub mod cluster;
pub mod restorer;
pub mod sanitize;
pub mod writer;

pub use cluster::{
    pad_len, ClusterCompress, ClusterHeader, IndexItem, CLUSTER_MAGIC, CLUSTER_SIZE,
    ITEMS_PER_CLUSTER, SUPER_INFO_OFFSET, SUPER_INFO_SIZE, SUPER_MIRROR_OFFSETS,
};
pub use restorer::{
    find_chunk_tree_buffer, rewrite_chunk_single_stripe, whole_device_chunk, FsChunk,
    MetadumpRestorer, RestoreConfig,
};
pub use sanitize::{SanitizeMode, Sanitizer};
pub use writer::{MetadumpWriter, NameSpan, WriterConfig, MAX_PENDING_SIZE};
