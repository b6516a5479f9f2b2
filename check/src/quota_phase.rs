//! Phase 7 "quota": loads qgroup status/info/relation
//! items from the quota tree and drives [`QuotaVerifier`] over every
//! extent the run has seen. Grounded on `fsforge-walk::quota`'s own
//! in-memory qgroup rbtree, generalised here to the item-decoding step
//! that populates it from a `TreeStore`.

use crate::report::{Phase, PhaseReport};
use fsforge_alloc::ExtentRefModel;
use fsforge_core::{key_type, Error, Logical, Result};
use fsforge_tree::TreeStore;
use fsforge_walk::{QgroupStatusFlags, QuotaVerifier};
use std::collections::BTreeSet;

/// Parses `QgroupStatus`/`QgroupInfo`/`QgroupRelation` items out of the
/// quota tree and feeds them into a fresh [`QuotaVerifier`], then scans
/// every extent bytenr the extent-tree phase observed.
pub fn run_quota_phase<'a>(
    store: &dyn TreeStore,
    quota_root: Logical,
    extents: &'a ExtentRefModel,
    extent_bytenrs: &[Logical],
) -> Result<(QuotaVerifier<'a>, PhaseReport)> {
    let mut report = PhaseReport::new(Phase::Quota);
    let mut status = QgroupStatusFlags::default();
    let mut relations: std::collections::HashMap<u64, BTreeSet<u64>> = std::collections::HashMap::new();
    let mut stored: std::collections::HashMap<u64, (u64, u64)> = std::collections::HashMap::new();

    for (key, data) in store.all_items(quota_root)? {
        report.item_count += 1;
        match key.ty {
            t if t == key_type::QgroupStatus => {
                if data.len() < 2 {
                    return Err(Error::invalid("qgroup status item", key.objectid, "short payload"));
                }
                status.inconsistent = data[0] != 0;
                status.rescan_running = data[1] != 0;
            }
            t if t == key_type::QgroupInfo => {
                if data.len() < 16 {
                    return Err(Error::invalid("qgroup info item", key.objectid, "short payload"));
                }
                let referenced = u64::from_le_bytes(data[0..8].try_into().unwrap());
                let exclusive = u64::from_le_bytes(data[8..16].try_into().unwrap());
                stored.insert(key.objectid, (referenced, exclusive));
            }
            t if t == key_type::QgroupRelation => {
                // objectid = member qgroup, offset = parent qgroup.
                relations.entry(key.objectid).or_default().insert(key.offset);
            }
            _ => {}
        }
    }

    let mut verifier = QuotaVerifier::new(extents, status);
    let qgroup_ids: BTreeSet<u64> = stored.keys().copied().chain(relations.keys().copied()).collect();
    for id in qgroup_ids {
        let (referenced, exclusive) = stored.get(&id).copied().unwrap_or((0, 0));
        let parents = relations.get(&id).cloned().unwrap_or_default();
        verifier.register_qgroup(id, referenced, exclusive, parents);
    }
    verifier.scan_extents(extent_bytenrs);

    Ok((verifier, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsforge_alloc::ExtentRecordTemplate;
    use fsforge_core::Key;
    use fsforge_tree::InMemoryTreeStore;

    #[test]
    fn mismatched_qgroup_flagged() {
        let store = InMemoryTreeStore::new();
        let extents = ExtentRefModel::new();
        let quota_root = 8u64;

        extents.add_or_merge(ExtentRecordTemplate {
            start: 4096,
            nr: 4096,
            refs: Some(1),
            found_rec: true,
            generation: 1,
            flags: 0,
        });
        extents.add_tree_backref(4096, None, Some(5), true);

        let info_key = Key::new(5, key_type::QgroupInfo, 0);
        store.insert_empty_item(quota_root, info_key, 16).unwrap();
        let mut payload = 0u64.to_le_bytes().to_vec();
        payload.extend_from_slice(&0u64.to_le_bytes());
        store.set_item_data(quota_root, &info_key, payload).unwrap();

        let (verifier, report) = run_quota_phase(&store, quota_root, &extents, &[4096]).unwrap();
        assert_eq!(report.item_count, 1);
        assert_eq!(verifier.bad_qgroups().len(), 1);
    }
}
