//! Tree primitive consumed interface, `ExtentBufferArena` and `ChunkMap`.

pub mod arena;
pub mod chunkmap;
pub mod primitive;

pub use arena::{
    bump_refcount, drop_refcount, ExtentBuffer, ExtentBufferArena, ExtentBufferHandle,
    TreeBlockHeader, HEADER_LEN,
};
pub use chunkmap::{BlockMapping, ChunkMap};
pub use primitive::{InMemoryTreeStore, SearchResult, TreePath, TreeStore, ITEMS_PER_LEAF};
