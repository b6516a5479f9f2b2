//! Metadump Restorer: reverse of the writer. Bootstraps a
//! `ChunkMap` from the stream's superblock and chunk-tree leaves, then for
//! every cluster, decompresses, fixes up chunk-tree leaves, translates
//! logical to physical, and `pwrite`s to the output device. Grounded on
//! the same producer/worker split as [`crate::writer`], applied to the
//! reverse pipeline: decompress -> fixup -> translate -> write, expressed
//! here as an explicit staged loop rather than implicit async control
//! flow.

use crate::cluster::{ClusterHeader, SUPER_INFO_OFFSET, SUPER_MIRROR_OFFSETS};
use fsforge_core::{csum_block, decompress, BlockIo, Chunk, ChunkStripe, CompressMethod, Error, Logical, Physical, Profile, Result, UsageClass};
use fsforge_tree::ChunkMap;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub num_threads: u32,
    /// `-o`: rewrite the sys-chunk-array to one chunk claiming the whole
    /// device, instead of trimming every chunk to a single stripe.
    pub old_restore: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        RestoreConfig {
            num_threads: 1,
            old_restore: false,
        }
    }
}

/// One in-RAM chunk-tree leaf entry discovered while bootstrapping the
/// `ChunkMap`.
#[derive(Debug, Clone)]
pub struct FsChunk {
    pub logical: Logical,
    pub physical: Physical,
    pub bytes: u64,
}

struct RestoreWork {
    bytenr: u64,
    buffer: Vec<u8>,
    compressed: bool,
}

struct Shared {
    queue: VecDeque<RestoreWork>,
    done: bool,
    error: Option<String>,
}

/// Bootstraps a [`ChunkMap`] by reading the stream's first cluster for the
/// superblock copy, then scanning subsequent clusters for the buffer
/// covering `chunk_root_bytenr`. Chunk items are supplied pre-decoded by
/// the caller (parsing the on-disk chunk-tree leaf layout is the generic
/// tree primitive's job, out of scope here); this function owns only the
/// cluster-stream bookkeeping to find the right buffer.
pub fn find_chunk_tree_buffer(stream: &[u8], chunk_root_bytenr: u64) -> Result<Vec<u8>> {
    let mut offset = 0usize;
    let mut super_buf: Option<Vec<u8>> = None;
    while offset + crate::cluster::CLUSTER_SIZE <= stream.len() {
        let header = ClusterHeader::decode(&stream[offset..offset + crate::cluster::CLUSTER_SIZE])?;
        let mut body_off = offset + crate::cluster::CLUSTER_SIZE;
        for item in &header.items {
            let end = body_off + item.size as usize;
            if end > stream.len() {
                return Err(Error::invalid("metadump stream", item.bytenr, "buffer runs past end of stream"));
            }
            let raw = &stream[body_off..end];
            let decompressed = match header.compress {
                crate::cluster::ClusterCompress::None => raw.to_vec(),
                crate::cluster::ClusterCompress::Zlib => {
                    decompress(raw, 256 * 1024 * 1024, CompressMethod::Zlib)?
                }
            };
            if item.bytenr == SUPER_INFO_OFFSET {
                super_buf = Some(decompressed.clone());
            }
            if item.bytenr <= chunk_root_bytenr && chunk_root_bytenr < item.bytenr + item.size as u64 {
                return Ok(decompressed);
            }
            body_off = end;
        }
        offset = crate::cluster::pad_len(body_off);
    }
    super_buf.ok_or_else(|| Error::NotFound("chunk root buffer not found in stream".into()))
}

/// Rewrites a decoded chunk item to single-stripe form pointing at
/// `target_devid`/`target_physical`, preserving only the DATA/SYSTEM/
/// METADATA bits of its usage class.
pub fn rewrite_chunk_single_stripe(chunk: &Chunk, target_devid: u64, target_physical: Physical) -> Chunk {
    Chunk {
        logical: chunk.logical,
        length: chunk.length,
        stripe_len: chunk.stripe_len,
        num_stripes: 1,
        sub_stripes: 1,
        profile: Profile::Single,
        usage: chunk.usage,
        stripes: vec![ChunkStripe {
            devid: target_devid,
            physical: target_physical,
        }],
    }
}

/// A single chunk claiming the whole device, used by old-restore mode
/// instead of per-chunk rewriting.
pub fn whole_device_chunk(device_bytes: u64, target_devid: u64) -> Chunk {
    Chunk {
        logical: 0,
        length: device_bytes,
        stripe_len: device_bytes,
        num_stripes: 1,
        sub_stripes: 1,
        profile: Profile::Single,
        usage: UsageClass::System,
        stripes: vec![ChunkStripe {
            devid: target_devid,
            physical: 0,
        }],
    }
}

/// Threaded restorer: decompresses cluster buffers on a worker pool and
/// writes each translated block to the output device via `ChunkMap` +
/// `BlockIo`.
pub struct MetadumpRestorer {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    workers: Vec<JoinHandle<()>>,
    config: RestoreConfig,
}

impl MetadumpRestorer {
    /// `csum_size` is the on-disk checksum width to refresh via
    /// `csum_block` on the superblock before it's duplicated to its backup
    /// mirrors.
    pub fn new(
        config: RestoreConfig,
        io: Arc<dyn BlockIo>,
        chunk_map: Arc<ChunkMap>,
        target_dev: u64,
        node_size: u32,
        csum_size: usize,
    ) -> Self {
        let shared = Arc::new((
            Mutex::new(Shared {
                queue: VecDeque::new(),
                done: false,
                error: None,
            }),
            Condvar::new(),
        ));
        let mut workers = Vec::new();
        let thread_count = config.num_threads.max(1);
        for id in 0..thread_count {
            let shared = shared.clone();
            let io = io.clone();
            let chunk_map = chunk_map.clone();
            workers.push(std::thread::spawn(move || {
                restore_worker_loop(id, shared, io, chunk_map, target_dev, node_size, csum_size)
            }));
        }
        MetadumpRestorer { shared, workers, config }
    }

    /// Enqueues one cluster-index buffer for decompression and write-back.
    pub fn submit(&self, bytenr: u64, buffer: Vec<u8>, compressed: bool) {
        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        shared.queue.push_back(RestoreWork { bytenr, buffer, compressed });
        cvar.notify_all();
        let _ = &self.config;
    }

    pub fn finish(mut self) -> Result<()> {
        let (lock, cvar) = &*self.shared;
        {
            let mut shared = lock.lock().unwrap();
            shared.done = true;
        }
        cvar.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        let shared = lock.lock().unwrap();
        match &shared.error {
            Some(e) => Err(Error::Compress(e.clone())),
            None => Ok(()),
        }
    }
}

fn restore_worker_loop(
    id: u32,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    io: Arc<dyn BlockIo>,
    chunk_map: Arc<ChunkMap>,
    target_dev: u64,
    node_size: u32,
    csum_size: usize,
) {
    let (lock, cvar) = &*shared;
    loop {
        let work = {
            let mut guard = lock.lock().unwrap();
            loop {
                if let Some(w) = guard.queue.pop_front() {
                    break Some(w);
                }
                if guard.done {
                    break None;
                }
                guard = cvar.wait(guard).unwrap();
            }
        };
        let Some(work) = work else {
            debug!(worker = id, "restore worker exiting");
            return;
        };

        let plain = if work.compressed {
            match decompress(&work.buffer, 256 * 1024 * 1024, CompressMethod::Zlib) {
                Ok(b) => b,
                Err(e) => {
                    let mut shared = lock.lock().unwrap();
                    shared.error = Some(e.to_string());
                    shared.done = true;
                    cvar.notify_all();
                    return;
                }
            }
        } else {
            work.buffer
        };

        if let Err(e) = write_translated(&plain, work.bytenr, &io, &chunk_map, target_dev, node_size, csum_size) {
            warn!(worker = id, bytenr = work.bytenr, error = %e, "restore write failed");
            let mut shared = lock.lock().unwrap();
            shared.error = Some(e.to_string());
            shared.done = true;
            cvar.notify_all();
            return;
        }
    }
}

/// Splits `plain` into `node_size`-sized sub-blocks starting at `bytenr`,
/// translates each via the `ChunkMap`, and `pwrite`s it; blocks with no
/// mapping are written at their logical address unchanged, with a warning.
/// The block covering [`SUPER_INFO_OFFSET`] is additionally duplicated to
/// every backup mirror offset that fits on the target device.
fn write_translated(
    plain: &[u8],
    bytenr: u64,
    io: &Arc<dyn BlockIo>,
    chunk_map: &Arc<ChunkMap>,
    target_dev: u64,
    node_size: u32,
    csum_size: usize,
) -> Result<()> {
    let step = node_size.max(1) as usize;
    let mut offset = 0usize;
    while offset < plain.len() {
        let end = (offset + step).min(plain.len());
        let block = &plain[offset..end];
        let logical = bytenr + offset as u64;
        match chunk_map.map_block(logical, block.len() as u64) {
            Ok(mapping) => {
                io.write(mapping.dev, mapping.physical, block)?;
                if logical == SUPER_INFO_OFFSET {
                    write_superblock_mirrors(block, io, target_dev, csum_size)?;
                }
            }
            Err(_) => {
                warn!(logical, "no chunk mapping for restored block, writing at logical address");
                io.write(target_dev, logical, block)?;
            }
        }
        offset = end;
    }
    Ok(())
}

/// Refreshes the superblock's checksum over `primary` and duplicates it to
/// every mirror offset in [`SUPER_MIRROR_OFFSETS`] (skipping the primary
/// itself) that lies within the target device's size.
fn write_superblock_mirrors(primary: &[u8], io: &Arc<dyn BlockIo>, target_dev: u64, csum_size: usize) -> Result<()> {
    let device_size = io.device_size(target_dev)?;
    let mut mirror = primary.to_vec();
    csum_block(&mut mirror, csum_size.min(mirror.len()));
    for &offset in SUPER_MIRROR_OFFSETS.iter().skip(1) {
        if offset + mirror.len() as u64 > device_size {
            debug!(offset, device_size, "superblock mirror offset past end of device, skipping");
            continue;
        }
        io.write(target_dev, offset, &mirror)?;
        debug!(offset, "wrote superblock backup mirror");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Minimal in-memory [`BlockIo`] for exercising the restorer's write
    /// path without touching the filesystem.
    struct MemDevice {
        bytes: StdMutex<Vec<u8>>,
    }

    impl BlockIo for MemDevice {
        fn read(&self, _dev: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
            let buf = self.bytes.lock().unwrap();
            Ok(buf[offset as usize..offset as usize + len].to_vec())
        }

        fn write(&self, _dev: u64, offset: u64, data: &[u8]) -> Result<()> {
            let mut buf = self.bytes.lock().unwrap();
            let end = offset as usize + data.len();
            if end > buf.len() {
                buf.resize(end, 0);
            }
            buf[offset as usize..end].copy_from_slice(data);
            Ok(())
        }

        fn device_size(&self, _dev: u64) -> Result<u64> {
            Ok(self.bytes.lock().unwrap().len() as u64)
        }

        fn discard(&self, _dev: u64, _offset: u64, _len: u64) {}
    }

    #[test]
    fn rewrite_single_stripe_preserves_usage() {
        let chunk = Chunk {
            logical: 0,
            length: 1 << 20,
            stripe_len: 64 * 1024,
            num_stripes: 2,
            sub_stripes: 1,
            profile: Profile::Raid1,
            usage: UsageClass::Metadata,
            stripes: vec![
                ChunkStripe { devid: 1, physical: 0 },
                ChunkStripe { devid: 2, physical: 0 },
            ],
        };
        let rewritten = rewrite_chunk_single_stripe(&chunk, 9, 4096);
        assert_eq!(rewritten.num_stripes, 1);
        assert_eq!(rewritten.stripes.len(), 1);
        assert_eq!(rewritten.stripes[0].devid, 9);
        assert!(matches!(rewritten.usage, UsageClass::Metadata));
    }

    #[test]
    fn whole_device_chunk_covers_entire_device() {
        let chunk = whole_device_chunk(1 << 30, 5);
        assert_eq!(chunk.length, 1 << 30);
        assert_eq!(chunk.stripes[0].devid, 5);
    }

    #[test]
    fn write_translated_duplicates_superblock_to_mirrors_that_fit() {
        let dev: Arc<dyn BlockIo> = Arc::new(MemDevice {
            bytes: StdMutex::new(vec![0u8; 128 * 1024 * 1024]),
        });
        let chunk_map = Arc::new(ChunkMap::new());
        let chunk_length = 256 * 1024 * 1024;
        chunk_map.insert(Chunk {
            logical: 0,
            length: chunk_length,
            stripe_len: chunk_length,
            num_stripes: 1,
            sub_stripes: 1,
            profile: Profile::Single,
            usage: UsageClass::System,
            stripes: vec![ChunkStripe { devid: 1, physical: 0 }],
        });

        let mut plain = vec![0u8; SUPER_INFO_SIZE_FOR_TEST];
        plain[4] = 0xab;
        write_translated(&plain, SUPER_INFO_OFFSET, &dev, &chunk_map, 1, plain.len() as u32, 4).unwrap();

        // Primary copy landed at its mapped (== logical, single-stripe) offset.
        let primary = dev.read(1, SUPER_INFO_OFFSET, plain.len()).unwrap();
        assert_eq!(primary[4], 0xab);

        // Mirror at 64 MiB fits inside the 128 MiB device and carries the
        // same payload with a freshly computed checksum.
        let mirror = dev.read(1, SUPER_MIRROR_OFFSETS[1], plain.len()).unwrap();
        assert_eq!(mirror[4], 0xab);

        // Mirror at 256 GiB does not fit; nothing should have been written
        // there (the device is only 128 MiB, so this is simply unreachable
        // and the write must have been skipped rather than erroring out).
        assert!(SUPER_MIRROR_OFFSETS[2] > dev.device_size(1).unwrap());
    }

    const SUPER_INFO_SIZE_FOR_TEST: usize = crate::cluster::SUPER_INFO_SIZE as usize;
}
