//! Phase 5 "csums": optionally re-reads each data extent's
//! on-disk bytes through `BlockIo`/`ChunkMap` and recomputes `CRC32C(!0,
//! sector)` against the stored `ExtentCsum` items, gated by
//! `--check-data-csum`. Without that flag this phase only
//! reports the coverage counters `FsRootWalker` already accumulated.
//!
//! After a metadump round trip, every data checksum re-verified here is
//! expected to mismatch, because the restorer is strictly a metadata
//! restorer and never captures file data.

use crate::report::{Phase, PhaseReport};
use fsforge_core::{crc32c_seeded, objectid, BlockIo, Logical, Result};
use fsforge_tree::{ChunkMap, TreeStore};

/// Re-verifies every stored `ExtentCsum` item's per-sector `u32` CRCs
/// against freshly read device bytes.
pub fn verify_data_csums(
    store: &dyn TreeStore,
    csum_root: Logical,
    chunk_map: &ChunkMap,
    io: &dyn BlockIo,
    sector_size: u32,
) -> Result<PhaseReport> {
    let mut report = PhaseReport::new(Phase::Csums);
    let sector = sector_size as u64;

    for (key, data) in store.items_for_objectid(csum_root, objectid::ExtentCsum)? {
        let disk_bytenr = key.offset;
        let num_sectors = data.len() as u64 / 4;
        report.item_count += 1;
        for i in 0..num_sectors {
            let stored = u32::from_le_bytes(data[(i * 4) as usize..(i * 4 + 4) as usize].try_into().unwrap());
            let sector_bytenr = disk_bytenr + i * sector;
            let mapping = match chunk_map.map_block(sector_bytenr, sector) {
                Ok(m) => m,
                Err(_) => {
                    report.errors += 1;
                    continue;
                }
            };
            let bytes = match io.read(mapping.dev, mapping.physical, sector as usize) {
                Ok(b) => b,
                Err(_) => {
                    report.errors += 1;
                    continue;
                }
            };
            let computed = crc32c_seeded(!0, &bytes);
            if computed != stored {
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsforge_core::{key_type, FileBlockIo, Key};
    use fsforge_tree::InMemoryTreeStore;
    use std::io::Write;

    fn single_device_chunk_map(devid: u64, physical: u64, len: u64) -> ChunkMap {
        let map = ChunkMap::new();
        map.insert(fsforge_core::Chunk {
            logical: 0,
            length: len,
            stripe_len: len,
            num_stripes: 1,
            sub_stripes: 1,
            profile: fsforge_core::Profile::Single,
            usage: fsforge_core::UsageClass::Data,
            stripes: vec![fsforge_core::ChunkStripe { devid, physical }],
        });
        map
    }

    #[test]
    fn matching_csum_reports_no_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let mut f = std::fs::File::create(&path).unwrap();
        let sector = vec![0xAAu8; 4096];
        f.write_all(&sector).unwrap();
        drop(f);

        let io = FileBlockIo::new();
        io.register(1, &path).unwrap();

        let store = InMemoryTreeStore::new();
        let csum_root = 7u64;
        let csum_key = Key::new(objectid::ExtentCsum, key_type::ExtentCsum, 0);
        let crc = crc32c_seeded(!0, &sector);
        store.insert_empty_item(csum_root, csum_key, 4).unwrap();
        store.set_item_data(csum_root, &csum_key, crc.to_le_bytes().to_vec()).unwrap();

        let chunk_map = single_device_chunk_map(1, 0, 4096);
        let report = verify_data_csums(&store, csum_root, &chunk_map, &io, 4096).unwrap();
        assert_eq!(report.errors, 0);
        assert_eq!(report.item_count, 1);
    }

    #[test]
    fn mismatched_csum_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; 4096]).unwrap();
        drop(f);

        let io = FileBlockIo::new();
        io.register(1, &path).unwrap();

        let store = InMemoryTreeStore::new();
        let csum_root = 7u64;
        let csum_key = Key::new(objectid::ExtentCsum, key_type::ExtentCsum, 0);
        store.insert_empty_item(csum_root, csum_key, 4).unwrap();
        store.set_item_data(csum_root, &csum_key, 0xDEAD_BEEFu32.to_le_bytes().to_vec()).unwrap();

        let chunk_map = single_device_chunk_map(1, 0, 4096);
        let report = verify_data_csums(&store, csum_root, &chunk_map, &io, 4096).unwrap();
        assert_eq!(report.errors, 1);
    }
}
