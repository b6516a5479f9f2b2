//! Metadump Writer: streaming image builder. Producer/worker
//! pool following the same Mutex+Condvar transaction-barrier pattern a
//! journaling writer uses to hold pending operations during a commit
//! window, generalised from "block new ops during commit" to "hold
//! compressed buffers until their turn to flush in order".

use crate::cluster::{ClusterHeader, IndexItem, ITEMS_PER_CLUSTER};
use crate::sanitize::{SanitizeMode, Sanitizer};
use fsforge_core::{compress, CompressMethod, Error, FsGeometry, Logical, Result};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Producer batches extents up to this many bytes before flushing.
pub const MAX_PENDING_SIZE: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub num_threads: u32,
    pub compress_level: u32,
    pub sanitize: Option<SanitizeMode>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            num_threads: 1,
            compress_level: 0,
            sanitize: None,
        }
    }
}

/// One name-bearing byte span inside a captured metadata buffer, supplied
/// by the caller (the orchestrator, which alone knows leaf item layout —
/// the generic B-tree leaf format is out of scope here). The writer
/// substitutes bytes in this span via the configured sanitize mode without
/// needing to parse the leaf itself.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct NameSpan {
    pub offset: usize,
    pub len: usize,
}

/// One buffer materialised by `add_extent`/`flush_pending`, tracked from
/// pending (awaiting compression) through ordered (awaiting flush) to
/// written — one owner at a time.
struct WorkItem {
    bytenr: u64,
    buffer: Vec<u8>,
    ready: bool,
}

struct Shared {
    work: VecDeque<Arc<Mutex<WorkItem>>>,
    ordered: Vec<Arc<Mutex<WorkItem>>>,
    num_items: u64,
    num_ready: u64,
    done: bool,
    error: Option<String>,
    compress_level: u32,
}

/// Threaded metadump writer. `num_threads` workers compress pending
/// buffers; the single producer thread (this struct's owner) appends to
/// `ordered` and flushes clusters once full.
pub struct MetadumpWriter<W: Write + Send + 'static> {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    workers: Vec<JoinHandle<()>>,
    out: Arc<Mutex<W>>,
    sanitizer: Sanitizer,
    config: WriterConfig,
    geometry: FsGeometry,

    pending_start: Option<Logical>,
    pending_size: u64,
    pending_is_data: bool,
    pending_buf: Vec<u8>,

    stream_offset: u64,
    cluster_stream_bytenr: u64,
    cluster_items: Vec<IndexItem>,
    cluster_buffers: Vec<Arc<Mutex<WorkItem>>>,
}

impl<W: Write + Send + 'static> MetadumpWriter<W> {
    pub fn new(out: W, config: WriterConfig, geometry: FsGeometry) -> Self {
        let compress_level = if config.compress_level > 0 { config.compress_level } else { 0 };
        let shared = Arc::new((
            Mutex::new(Shared {
                work: VecDeque::new(),
                ordered: Vec::new(),
                num_items: 0,
                num_ready: 0,
                done: false,
                error: None,
                compress_level,
            }),
            Condvar::new(),
        ));

        let mut workers = Vec::new();
        for id in 0..config.num_threads {
            let shared = shared.clone();
            workers.push(std::thread::spawn(move || worker_loop(id, shared)));
        }

        MetadumpWriter {
            shared,
            workers,
            out: Arc::new(Mutex::new(out)),
            sanitizer: Sanitizer::new(),
            config,
            geometry,
            pending_start: None,
            pending_size: 0,
            pending_is_data: false,
            pending_buf: Vec::new(),
            stream_offset: 0,
            cluster_stream_bytenr: 0,
            cluster_items: Vec::new(),
            cluster_buffers: Vec::new(),
        }
    }

    /// Queues `bytes` (already read by the caller via ChunkMap+BlockIo,
    /// and for metadata blocks, already passed through `copy_buffer`-style
    /// sanitization of non-item bytes) as the next `size`-byte extent
    /// starting at `start`. Flushes the pending batch first if `is_data`
    /// changed, the batch would exceed [`MAX_PENDING_SIZE`], or `start` is
    /// non-contiguous with the running batch.
    pub fn add_extent(&mut self, start: Logical, bytes: &[u8], is_data: bool, names: &[NameSpan]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let size = bytes.len() as u64;
        let non_contiguous = self
            .pending_start
            .map(|ps| ps + self.pending_size != start)
            .unwrap_or(false);
        let is_data_changed = self.pending_start.is_some() && self.pending_is_data != is_data;
        if self.pending_start.is_some()
            && (is_data_changed || self.pending_size + size > MAX_PENDING_SIZE || non_contiguous)
        {
            self.flush_pending(false)?;
        }

        let sanitized = self.sanitize_buffer(bytes, is_data, names);

        if self.pending_start.is_none() {
            self.pending_start = Some(start);
            self.pending_is_data = is_data;
        }
        self.pending_size += size;
        self.pending_buf.extend_from_slice(&sanitized);
        Ok(())
    }

    fn sanitize_buffer(&mut self, bytes: &[u8], is_data: bool, names: &[NameSpan]) -> Vec<u8> {
        let mut out = bytes.to_vec();
        if is_data {
            return out;
        }
        if let Some(mode) = self.config.sanitize.as_ref() {
            for span in names {
                let end = (span.offset + span.len).min(out.len());
                if span.offset >= end {
                    continue;
                }
                let replacement = self.sanitizer.sanitize(mode, &out[span.offset..end]);
                out[span.offset..end].copy_from_slice(&replacement);
            }
        }
        out
    }

    /// Materialises the pending batch into a work item, hands it to the
    /// worker pool (or marks it ready immediately if compression is
    /// disabled), and appends it to `ordered`. Writes out a cluster once
    /// `ordered.len() == ITEMS_PER_CLUSTER` or `done`.
    pub fn flush_pending(&mut self, done: bool) -> Result<()> {
        if let Some(start) = self.pending_start.take() {
            let buf = std::mem::take(&mut self.pending_buf);
            let size = self.pending_size;
            self.pending_size = 0;

            let compression_enabled = self.config.compress_level > 0;
            let item = Arc::new(Mutex::new(WorkItem {
                bytenr: start,
                buffer: buf,
                ready: !compression_enabled,
            }));

            {
                let (lock, cvar) = &*self.shared;
                let mut shared = lock.lock().unwrap();
                shared.num_items += 1;
                if compression_enabled && self.config.num_threads > 0 {
                    shared.work.push_back(item.clone());
                    cvar.notify_all();
                } else if compression_enabled {
                    // num_threads == 0 with compression requested: perform it
                    // inline rather than spawning a pool of zero workers.
                    let mut guard = item.lock().unwrap();
                    guard.buffer = compress(&guard.buffer, self.config.compress_level, CompressMethod::Zlib)
                        .unwrap_or_else(|_| guard.buffer.clone());
                    guard.ready = true;
                    drop(guard);
                    shared.num_ready += 1;
                } else {
                    // Compression disabled entirely: inline bypass, so
                    // num_threads=0 with compress_level=0 still produces a
                    // valid stream.
                    shared.num_ready += 1;
                }
            }

            self.cluster_items.push(IndexItem {
                bytenr: start,
                size: size as u32,
            });
            self.cluster_buffers.push(item);
        }

        if self.cluster_items.len() == ITEMS_PER_CLUSTER || (done && !self.cluster_items.is_empty()) {
            self.write_buffers()?;
        } else if done {
            self.check_worker_error()?;
        }
        Ok(())
    }

    fn check_worker_error(&self) -> Result<()> {
        let (lock, _) = &*self.shared;
        let shared = lock.lock().unwrap();
        if let Some(err) = &shared.error {
            return Err(Error::Compress(err.clone()));
        }
        Ok(())
    }

    /// Waits for every item currently in `cluster_buffers` to become
    /// ready, writes the cluster header + index, then the buffers in
    /// order, then zero-pads to the next cluster boundary. Buffers are
    /// always written in the order they entered `cluster_buffers`,
    /// regardless of which worker finished compressing them first.
    fn write_buffers(&mut self) -> Result<()> {
        let (lock, cvar) = &*self.shared;
        {
            let mut shared = lock.lock().unwrap();
            loop {
                if let Some(err) = shared.error.take() {
                    return Err(Error::Compress(err));
                }
                let all_ready = self.cluster_buffers.iter().all(|b| b.lock().unwrap().ready);
                if all_ready {
                    break;
                }
                shared = cvar.wait(shared).unwrap();
            }
        }

        let header = ClusterHeader {
            stream_bytenr: self.cluster_stream_bytenr,
            compress: if self.config.compress_level > 0 {
                crate::cluster::ClusterCompress::Zlib
            } else {
                crate::cluster::ClusterCompress::None
            },
            items: self.cluster_items.clone(),
        };

        let encoded_header = header.encode();
        let mut out = self.out.lock().unwrap();
        out.write_all(&encoded_header)
            .map_err(|e| Error::io("metadump output", e))?;
        let mut written = encoded_header.len() as u64;
        for item in &self.cluster_buffers {
            let guard = item.lock().unwrap();
            out.write_all(&guard.buffer)
                .map_err(|e| Error::io("metadump output", e))?;
            written += guard.buffer.len() as u64;
        }
        let padded = crate::cluster::pad_len(written as usize) as u64;
        if padded > written {
            let zeros = vec![0u8; (padded - written) as usize];
            out.write_all(&zeros).map_err(|e| Error::io("metadump output", e))?;
        }
        drop(out);

        self.stream_offset += padded;
        self.cluster_stream_bytenr = self.stream_offset;
        self.cluster_items.clear();
        self.cluster_buffers.clear();
        Ok(())
    }

    /// Flushes any remaining pending batch and final partial cluster, then
    /// signals workers to exit, joins them, and hands back the output
    /// writer once every handle but this one has been dropped.
    pub fn finish(mut self) -> Result<W> {
        self.flush_pending(true)?;
        let (lock, cvar) = &*self.shared;
        {
            let mut shared = lock.lock().unwrap();
            shared.done = true;
        }
        cvar.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        self.check_worker_error()?;
        Arc::try_unwrap(self.out)
            .map(|m| m.into_inner().unwrap())
            .map_err(|_| Error::Compress("output handle still has other owners".into()))
    }

    pub fn geometry(&self) -> FsGeometry {
        self.geometry
    }
}

fn worker_loop(id: u32, shared: Arc<(Mutex<Shared>, Condvar)>) {
    let (lock, cvar) = &*shared;
    loop {
        let item = {
            let mut guard = lock.lock().unwrap();
            loop {
                if let Some(item) = guard.work.pop_front() {
                    break Some(item);
                }
                if guard.done {
                    break None;
                }
                guard = cvar.wait(guard).unwrap();
            }
        };
        let Some(item) = item else {
            debug!(worker = id, "metadump compress worker exiting");
            return;
        };

        let level = lock.lock().unwrap().compress_level;
        let result = {
            let guard = item.lock().unwrap();
            compress(&guard.buffer, level, CompressMethod::Zlib)
        };
        match result {
            Ok(compressed) => {
                let mut guard = item.lock().unwrap();
                guard.buffer = compressed;
                guard.ready = true;
            }
            Err(e) => {
                let mut shared = lock.lock().unwrap();
                warn!(worker = id, error = %e, "compression failed, aborting stream");
                shared.error = Some(e.to_string());
                shared.done = true;
                cvar.notify_all();
                return;
            }
        }
        let mut shared = lock.lock().unwrap();
        shared.num_ready += 1;
        if shared.num_ready > shared.num_items {
            error!(worker = id, "num_ready exceeded num_items invariant");
        }
        drop(shared);
        cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> FsGeometry {
        FsGeometry::default()
    }

    #[test]
    fn add_extent_zero_size_does_not_flush() {
        let mut writer = MetadumpWriter::new(Vec::new(), WriterConfig::default(), geom());
        writer.add_extent(0, &[], true, &[]).unwrap();
        assert!(writer.pending_start.is_none());
    }

    #[test]
    fn add_extent_at_cap_flushes_one_item() {
        let mut writer = MetadumpWriter::new(Vec::new(), WriterConfig { num_threads: 0, compress_level: 0, sanitize: None }, geom());
        let buf = vec![7u8; MAX_PENDING_SIZE as usize];
        writer.add_extent(0, &buf, true, &[]).unwrap();
        assert_eq!(writer.pending_size, MAX_PENDING_SIZE);
        writer.add_extent(MAX_PENDING_SIZE, &[1u8], true, &[]).unwrap();
        // non-contiguous would not apply here (contiguous); but exceeding cap should have flushed first.
        assert!(writer.cluster_items.len() >= 1);
    }

    #[test]
    fn zero_threads_zero_level_still_produces_stream() {
        let mut writer = MetadumpWriter::new(Vec::new(), WriterConfig { num_threads: 0, compress_level: 0, sanitize: None }, geom());
        writer.add_extent(0, b"hello world", true, &[]).unwrap();
        let out = writer.finish().unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn full_cluster_write_round_trips_header() {
        let mut writer = MetadumpWriter::new(Vec::new(), WriterConfig { num_threads: 0, compress_level: 0, sanitize: None }, geom());
        writer
            .add_extent(
                crate::cluster::SUPER_INFO_OFFSET,
                &vec![0u8; crate::cluster::SUPER_INFO_SIZE as usize],
                false,
                &[],
            )
            .unwrap();
        let buf_out = writer.finish().unwrap();
        let header = ClusterHeader::decode(&buf_out).unwrap();
        assert_eq!(header.items.len(), 1);
        assert_eq!(header.items[0].bytenr, crate::cluster::SUPER_INFO_OFFSET);
    }
}
