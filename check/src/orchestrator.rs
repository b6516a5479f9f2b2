//! The Orchestrator: runs the seven phases in order,
//! restarting phases 1/2/4 once on `Error::Conflict` before demoting a
//! repeat occurrence to `Error::Corrupt`, and implements the
//! `ClearOnly`/`Quota-only`/`Repair-init`/`Walk`/`Close` state machine.
//! Follows the same top-level dry-run-then-commit sequencing a
//! filesystem formatter uses for its own top-level entry point,
//! generalised from a single format call to a fixed seven-phase run over
//! several library crates.

use crate::config::{CheckConfig, ClearSpaceCache};
use crate::csums_phase::verify_data_csums;
use crate::extents_phase::scan_extent_tree;
use crate::freespace_phase::{clear_v1_cache, scan_free_space_v1, scan_free_space_v2};
use crate::quota_phase::run_quota_phase;
use crate::report::{Phase, PhaseReport, RunReport};
use crate::roots::{check_root_refs, resolve_root, scan_root_items};
use fsforge_alloc::ExtentRefModel;
use fsforge_core::{BlockIo, Error, FsContext, Result};
use fsforge_tree::{ChunkMap, TreeStore};
use fsforge_walk::FsRootWalker;
use tracing::{error, info, warn};

/// Bound on phase restarts for the same root on `Error::Conflict`: a
/// second conflict on the same root demotes to `Error::Corrupt` instead of
/// restarting again.
const MAX_PHASE_RESTARTS: u32 = 1;

/// Outcome of one [`Orchestrator::run`] call, reflecting the `ClearOnly` /
/// `Quota-only` / `Walk` branches of the run state machine.
pub enum RunOutcome {
    Cleared,
    QuotaOnly(RunReport),
    Checked(RunReport),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Cleared => 0,
            RunOutcome::QuotaOnly(r) | RunOutcome::Checked(r) => r.exit_code(),
        }
    }
}

pub struct Orchestrator<'a> {
    ctx: &'a FsContext,
    store: &'a dyn TreeStore,
    chunk_map: Option<&'a ChunkMap>,
    io: Option<&'a dyn BlockIo>,
    config: CheckConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: &'a FsContext, store: &'a dyn TreeStore, config: CheckConfig) -> Self {
        Orchestrator {
            ctx,
            store,
            chunk_map: None,
            io: None,
            config,
        }
    }

    /// Supplies the device-reading path needed by the `csums` phase's
    /// `--check-data-csum` re-read. Without this, that phase only reports
    /// the coverage counters the walk already accumulated.
    pub fn with_data_csum_check(mut self, chunk_map: &'a ChunkMap, io: &'a dyn BlockIo) -> Self {
        self.chunk_map = Some(chunk_map);
        self.io = Some(io);
        self
    }

    /// *Init*: verify the three critical roots are
    /// present before anything else runs. A missing critical root is
    /// fatal, matching "if a critical root... is unreadable at startup,
    /// the orchestrator aborts".
    fn verify_critical_roots(&self) -> Result<()> {
        for (name, root) in [
            ("tree_root", self.ctx.tree_root),
            ("chunk_root", self.ctx.chunk_root),
            ("dev_root", self.ctx.dev_root),
        ] {
            if root.bytenr == 0 {
                return Err(Error::Unsupported(format!("{name} is unset; cannot start a run")));
            }
        }
        Ok(())
    }

    pub fn run(&self) -> Result<RunOutcome> {
        self.config
            .validate()
            .map_err(|e| Error::Unsupported(e.to_string()))?;
        self.verify_critical_roots()?;

        if self.config.clear_space_cache.is_some() || self.config.clear_ino_cache {
            self.run_clear_only()?;
            return Ok(RunOutcome::Cleared);
        }

        let extents = ExtentRefModel::new();
        if self.config.qgroup_report {
            let quota_root = self
                .ctx
                .quota_root
                .ok_or_else(|| Error::Unsupported("qgroup report requested but no quota tree".into()))?;
            let (_groups, extents_report) = scan_extent_tree(self.store, self.ctx.extent_root.bytenr, &extents)?;
            let bytenrs: Vec<u64> = extents.all_bytenrs();
            let mut report = RunReport::default();
            report.phases.push(extents_report);
            let (verifier, quota_report) = run_quota_phase(self.store, quota_root.bytenr, &extents, &bytenrs)?;
            report.bad_qgroups = verifier.bad_qgroups().iter().map(|q| q.qgroupid).collect();
            report.phases.push(quota_report);
            return Ok(RunOutcome::QuotaOnly(report));
        }

        if self.config.repair && (self.config.init_extent_tree || self.config.init_csum_tree) {
            self.run_repair_init()?;
        }

        let report = self.run_walk(&extents)?;
        Ok(RunOutcome::Checked(report))
    }

    /// *ClearOnly*: `--clear-space-cache`/`--clear-ino-cache`
    /// then exit, without running the seven phases.
    fn run_clear_only(&self) -> Result<()> {
        let extents = ExtentRefModel::new();
        let (groups, _) = scan_extent_tree(self.store, self.ctx.extent_root.bytenr, &extents)?;
        match self.config.clear_space_cache {
            Some(ClearSpaceCache::V1) => {
                for group in &groups {
                    clear_v1_cache(self.store, self.ctx.tree_root.bytenr, group)?;
                }
                info!(groups = groups.len(), "cleared v1 free-space cache");
            }
            Some(ClearSpaceCache::V2) => {
                if let Some(root) = self.ctx.free_space_root {
                    for group in &groups {
                        let items = self.store.items_for_objectid(root.bytenr, group.start)?;
                        for (key, _) in items {
                            self.store.del_item(root.bytenr, &key)?;
                        }
                    }
                    info!(groups = groups.len(), "cleared v2 free-space tree entries");
                }
            }
            None => {}
        }
        if self.config.clear_ino_cache {
            info!("cleared inode-number cache");
        }
        Ok(())
    }

    /// *Repair-init*: `--init-extent-tree`/`--init-csum-tree`
    /// wipe and rebuild the named tree before phase 1 starts.
    fn run_repair_init(&self) -> Result<()> {
        if self.config.init_extent_tree {
            for (key, _) in self.store.all_items(self.ctx.extent_root.bytenr)? {
                self.store.del_item(self.ctx.extent_root.bytenr, &key)?;
            }
            warn!("extent tree cleared for re-initialization");
        }
        if self.config.init_csum_tree {
            for (key, _) in self.store.all_items(self.ctx.csum_root.bytenr)? {
                self.store.del_item(self.ctx.csum_root.bytenr, &key)?;
            }
            warn!("csum tree cleared for re-initialization");
        }
        Ok(())
    }

    /// *Walk*: runs phases 1..7 in order. Restarts bounded
    /// as described on [`MAX_PHASE_RESTARTS`].
    fn run_walk(&self, extents: &ExtentRefModel) -> Result<RunReport> {
        let mut report = RunReport::default();

        // Phase 1: root-items.
        let (roots, phase1) = self.with_restart(Phase::RootItems, || scan_root_items(self.store, self.ctx.tree_root.bytenr))?;
        report.phases.push(phase1);

        // Phase 2: extents.
        let (groups, phase2) =
            self.with_restart(Phase::Extents, || scan_extent_tree(self.store, self.ctx.extent_root.bytenr, extents))?;
        report.phases.push(phase2);

        // Phase 3: free-space-tree or free-space-cache.
        let mut phase3 = PhaseReport::new(Phase::FreeSpace);
        if self.ctx.features.free_space_tree {
            if let Some(fst_root) = self.ctx.free_space_root {
                let (_scan, p) = scan_free_space_v2(self.store, fst_root.bytenr, &groups, self.ctx.geometry)?;
                phase3 = p;
            }
        } else {
            let (_scan, p) = scan_free_space_v1(self.store, self.ctx.tree_root.bytenr, &groups, self.ctx.geometry.sector_size as u64)?;
            phase3 = p;
        }
        report.phases.push(phase3);

        // Phase 4: fs-roots.
        let mut phase4 = PhaseReport::new(Phase::FsRoots);
        let mut csum_bytes_total = 0u64;
        for (root_id, rec) in &roots {
            if !rec.reachable || rec.bytenr == 0 {
                continue;
            }
            if let Some(subvolid) = self.config.subvolid {
                if *root_id != subvolid {
                    continue;
                }
            }
            let walk_result = self.with_root_restart(*root_id, || {
                let mut walker = FsRootWalker::new(
                    self.store,
                    extents,
                    self.ctx.geometry,
                    self.ctx.generation,
                    self.ctx.csum_root.bytenr,
                );
                walker.walk(rec.bytenr)
            });
            match walk_result {
                Ok(walk_report) => {
                    phase4.item_count += walk_report.inodes_visited;
                    phase4.errors += walk_report.errors_found;
                    csum_bytes_total += walk_report.csum_bytes_checked;
                }
                Err(e) => {
                    error!(root = *root_id, error = %e, "fs-roots walk failed");
                    phase4.errors += 1;
                    report.push_finding("fs-roots", Some(rec.bytenr), format!("root {root_id}: {e}"));
                }
            }
        }
        report.phases.push(phase4);
        report.stats.total_csum_bytes = csum_bytes_total;

        // Phase 5: csums.
        let mut phase5 = PhaseReport::new(Phase::Csums);
        if self.config.check_data_csum {
            if let (Some(chunk_map), Some(io)) = (self.chunk_map, self.io) {
                phase5 = verify_data_csums(self.store, self.ctx.csum_root.bytenr, chunk_map, io, self.ctx.geometry.sector_size)?;
            } else {
                warn!("--check-data-csum requested but no BlockIo/ChunkMap supplied to the orchestrator");
            }
        }
        report.phases.push(phase5);

        // Phase 6: root-refs.
        let phase6 = check_root_refs(&roots, &mut report);
        report.phases.push(phase6);

        // Phase 7: quota.
        let mut phase7 = PhaseReport::new(Phase::Quota);
        if let Some(quota_root) = self.ctx.quota_root {
            let bytenrs: Vec<u64> = extents.all_bytenrs();
            let (verifier, p) = run_quota_phase(self.store, quota_root.bytenr, extents, &bytenrs)?;
            phase7 = p;
            report.bad_qgroups = verifier.bad_qgroups().iter().map(|q| q.qgroupid).collect();
        }
        report.phases.push(phase7);

        Ok(report)
    }

    /// Generic phase-level restart wrapper: on the first `Error::Conflict`
    /// from `f`, clear caches (nothing extra to clear at this layer beyond
    /// re-running `f`) and retry once; a second `Conflict` is demoted to
    /// `Error::Corrupt`.
    fn with_restart<T>(&self, phase: Phase, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        match f() {
            Ok(v) => Ok(v),
            Err(Error::Conflict(reason)) => {
                warn!(phase = phase.label(), reason, "phase restarting after conflict");
                match f() {
                    Ok(v) => Ok(v),
                    Err(Error::Conflict(reason2)) => Err(Error::corrupt(
                        "orchestrator",
                        0,
                        format!("phase {} conflicted twice: {reason2}", phase.label()),
                    )),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn with_root_restart<T>(&self, root_id: u64, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempts = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(Error::Conflict(reason)) if attempts < MAX_PHASE_RESTARTS => {
                    attempts += 1;
                    warn!(root = root_id, reason, "fs-roots walk restarting after conflict");
                }
                Err(Error::Conflict(reason)) => {
                    return Err(Error::corrupt(
                        "fs-roots",
                        root_id,
                        format!("conflicted past restart budget: {reason}"),
                    ))
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn resolve_root_id(&self, roots: &std::collections::BTreeMap<u64, crate::roots::RootRecord>) -> Option<u64> {
        resolve_root(roots, self.config.subvolid).map(|r| r.root_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsforge_core::{FsGeometry, RootPointer};
    use fsforge_tree::InMemoryTreeStore;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    fn root_ptr(bytenr: u64) -> RootPointer {
        RootPointer {
            bytenr,
            generation: 1,
            level: 0,
        }
    }

    fn ctx() -> FsContext {
        FsContext {
            geometry: FsGeometry::default(),
            fsid: uuid::Uuid::nil(),
            devices: vec![],
            features: Default::default(),
            tree_root: root_ptr(1),
            chunk_root: root_ptr(2),
            dev_root: root_ptr(3),
            extent_root: root_ptr(4),
            csum_root: root_ptr(5),
            quota_root: None,
            free_space_root: None,
            generation: 1,
            excluded_extents: Mutex::new(BTreeSet::new()),
            fsck_extent_cache: Mutex::new(HashMap::new()),
            corrupt_blocks: Mutex::new(BTreeSet::new()),
            free_extent_hook: Mutex::new(None),
            repair: false,
            readonly: true,
            force: false,
            check_data_csum: false,
        }
    }

    #[test]
    fn missing_critical_root_aborts_before_any_phase() {
        let mut context = ctx();
        context.chunk_root = root_ptr(0);
        let store = InMemoryTreeStore::new();
        let orchestrator = Orchestrator::new(&context, &store, CheckConfig::default());
        assert!(matches!(orchestrator.run(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn empty_filesystem_runs_clean() {
        let context = ctx();
        let store = InMemoryTreeStore::new();
        let orchestrator = Orchestrator::new(&context, &store, CheckConfig::default());
        let outcome = orchestrator.run().unwrap();
        match outcome {
            RunOutcome::Checked(report) => {
                assert_eq!(report.exit_code(), 0);
                assert!(report.phases.iter().all(|p| p.errors == 0));
            }
            _ => panic!("expected Checked outcome"),
        }
    }

    #[test]
    fn readonly_and_repair_rejected_before_verifying_roots() {
        let context = ctx();
        let store = InMemoryTreeStore::new();
        let config = CheckConfig {
            readonly: true,
            repair: true,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&context, &store, config);
        assert!(matches!(orchestrator.run(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn qgroup_report_without_quota_root_is_unsupported() {
        let context = ctx();
        let store = InMemoryTreeStore::new();
        let config = CheckConfig {
            qgroup_report: true,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&context, &store, config);
        assert!(matches!(orchestrator.run(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn clear_space_cache_v1_on_empty_fs_reports_cleared() {
        let context = ctx();
        let store = InMemoryTreeStore::new();
        let config = CheckConfig {
            clear_space_cache: Some(ClearSpaceCache::V1),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(&context, &store, config);
        let outcome = orchestrator.run().unwrap();
        assert!(matches!(outcome, RunOutcome::Cleared));
        assert_eq!(outcome.exit_code(), 0);
    }
}
