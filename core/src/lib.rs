pub mod blockio;
pub mod checksum;
pub mod context;
pub mod error;
pub mod key;
pub mod model;

pub use blockio::{zero_clamped, wipe_existing_superblocks, BlockIo, FileBlockIo};
pub use checksum::{compress, crc32c_seeded, csum_block, decompress, verify_csum, CompressMethod};
pub use context::{DeviceEntry, FeatureFlags, FreeExtentHook, FsContext};
pub use error::{Error, Result};
pub use key::{extent_flags, key_type, objectid, DevId, Generation, Key, KeyType, Logical, ObjectId, Physical};
pub use model::{
    BlockGroup, Chunk, ChunkStripe, FsGeometry, Profile, RootPointer, UsageClass,
    DEFAULT_NODE_SIZE, DEFAULT_SECTOR_SIZE, STRIPE_LEN,
};
