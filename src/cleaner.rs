//! Directory-level chain cleaner (component C7): walks a VM backup directory,
//! prunes broken and orphaned VHDs, keeps backup-metadata JSON files honest
//! about the size of what they describe, and (optionally) folds unused
//! differencing chains back into the disk they ultimately stem from.
//!
//! The directory shape this module understands is `<vmDir>/vdis/*/*/*`
//! (pool directory, then VDI directory, then the VHDs and merge sidecars
//! themselves) plus loose JSON/XVA backup artifacts directly under
//! `<vmDir>`.

use crate::handler::{ByteHandle, ByteHandler, OpenMode};
use crate::merge::{child_from_sidecar_name, merge_vhd};
use crate::vhd::{VhdFile, VhdInstance, VhdType};
use crate::{Result, VhdError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// What a [`clean_vm`] run is allowed to do. Every flag defaults to `false`
/// (or `1` for `merge_limit`), matching a dry-run / report-only pass.
#[derive(Debug, Clone)]
pub struct CleanOptions {
    /// Unlink broken and orphaned VHDs, and stale backup-metadata JSON whose
    /// referenced payload no longer exists, instead of only reporting them.
    pub remove: bool,
    /// Actually run discovered chain merges (otherwise the plan is only
    /// reported, nothing is coalesced).
    pub merge: bool,
    /// Rewrite backup-metadata JSON size fields that undercount the actual
    /// on-disk payload (a size is never shrunk, only grown).
    pub fix_metadata: bool,
    /// Upper bound on how many merge chains may run concurrently. This
    /// implementation executes chains sequentially (correctness does not
    /// depend on parallelism here), so the field is accepted for API
    /// compatibility and validated but otherwise unused.
    pub merge_limit: usize,
}

impl Default for CleanOptions {
    fn default() -> Self {
        CleanOptions {
            remove: false,
            merge: false,
            fix_metadata: false,
            merge_limit: 1,
        }
    }
}

/// What a [`clean_vm`] run actually did (or would do, with `remove`/`merge`
/// left off).
#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub broken_removed: Vec<PathBuf>,
    pub orphans_removed: Vec<PathBuf>,
    pub metadata_removed: Vec<PathBuf>,
    pub metadata_fixed: Vec<PathBuf>,
    /// Each entry is a chain in merge order: `[root, ..., surviving leaf]`.
    pub merged_chains: Vec<Vec<PathBuf>>,
    pub merged_bytes: u64,
}

/// On-disk shape of a backup-metadata JSON file. Unknown fields round-trip
/// through `extra` so rewriting a `size` does not clobber anything this
/// crate does not understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xva: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhds: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

struct VhdInfo {
    parent: Option<PathBuf>,
    size: u64,
}

fn is_vhd_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|e| e.eq_ignore_ascii_case("vhd"))
        .unwrap_or(false)
}

fn is_json_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Collects every VHD under `<vm_dir>/vdis/*/*/` plus the interrupted-merge
/// sidecars sitting alongside them.
fn scan_vdis<HR: ByteHandler>(
    handler: &HR,
    vm_dir: &Path,
) -> Result<(Vec<PathBuf>, HashSet<PathBuf>)> {
    let mut vhds = Vec::new();
    let mut interrupted = HashSet::new();

    let vdis_dir = vm_dir.join("vdis");
    for pool_dir in handler.list(&vdis_dir)? {
        for vdi_dir in handler.list(&pool_dir)? {
            for entry in handler.list(&vdi_dir)? {
                let name = match entry.file_name() {
                    Some(n) => n.to_string_lossy().into_owned(),
                    None => continue,
                };
                if let Some(child) = child_from_sidecar_name(&vdi_dir, &name) {
                    interrupted.insert(child);
                } else if is_vhd_name(&name) {
                    vhds.push(entry);
                }
            }
        }
    }

    Ok((vhds, interrupted))
}

/// Opens every VHD found by [`scan_vdis`], unlinking (if `remove`) any that
/// fail to parse, and returns the survivors keyed by path.
fn open_and_prune_broken<HR: ByteHandler>(
    handler: &HR,
    vhds: Vec<PathBuf>,
    interrupted: &HashSet<PathBuf>,
    remove: bool,
    report: &mut CleanReport,
    on_log: &mut dyn FnMut(&str, bool),
) -> Result<HashMap<PathBuf, VhdInfo>> {
    let mut surviving = HashMap::new();

    for path in vhds {
        let check_second_footer = !interrupted.contains(&path);
        match VhdFile::open(handler, &path, check_second_footer) {
            Ok(vf) => {
                let parent = if vf.disk_type() == VhdType::Diff {
                    let dir = path.parent().unwrap_or_else(|| Path::new(""));
                    Some(dir.join(vf.header().prt_name()))
                } else {
                    None
                };
                surviving.insert(
                    path,
                    VhdInfo {
                        parent,
                        size: vf.footer().current_size(),
                    },
                );
            }
            Err(e) => {
                on_log(&format!("{}: broken VHD ({})", path.display(), e), true);
                log::warn!("broken VHD at {}: {}", path.display(), e);
                if remove {
                    handler.unlink(&path)?;
                    report.broken_removed.push(path);
                }
            }
        }
    }

    Ok(surviving)
}

/// Builds the child -> parent adjacency, flagging (and dropping) any parent
/// claimed by more than one child: such a parent's chain cannot be reasoned
/// about safely, so neither side is considered for merging.
fn build_children_map(
    surviving: &HashMap<PathBuf, VhdInfo>,
    on_log: &mut dyn FnMut(&str, bool),
) -> HashMap<PathBuf, PathBuf> {
    let mut children_of: HashMap<PathBuf, PathBuf> = HashMap::new();
    let mut conflicted: HashSet<PathBuf> = HashSet::new();

    for (child, info) in surviving {
        if let Some(parent) = &info.parent {
            match children_of.get(parent) {
                Some(existing) if existing != child => {
                    conflicted.insert(parent.clone());
                    let err = VhdError::MultipleChildren(parent.display().to_string());
                    on_log(
                        &format!("{} ({} and {} both claim it)", err, existing.display(), child.display()),
                        true,
                    );
                }
                _ => {
                    children_of.insert(parent.clone(), child.clone());
                }
            }
        }
    }

    children_of.retain(|parent, _| !conflicted.contains(parent));
    children_of
}

/// Iteratively drops any differencing VHD whose declared parent is not
/// among the survivors, cascading until a fixed point (removing a VHD can
/// orphan its own children in turn).
fn prune_orphans<HR: ByteHandler>(
    handler: &HR,
    surviving: &mut HashMap<PathBuf, VhdInfo>,
    children_of: &mut HashMap<PathBuf, PathBuf>,
    remove: bool,
    report: &mut CleanReport,
    on_log: &mut dyn FnMut(&str, bool),
) -> Result<()> {
    loop {
        let orphaned: Vec<(PathBuf, PathBuf)> = surviving
            .iter()
            .filter_map(|(child, info)| match &info.parent {
                Some(p) if !surviving.contains_key(p) => Some((child.clone(), p.clone())),
                _ => None,
            })
            .collect();

        if orphaned.is_empty() {
            break;
        }

        for (child, parent) in orphaned {
            surviving.remove(&child);
            children_of.retain(|_, v| v != &child);
            let err = VhdError::ParentMissing(parent.display().to_string());
            on_log(&format!("{} (child: {})", err, child.display()), true);
            log::warn!("{} (child: {})", err, child.display());
            if remove {
                handler.unlink(&child)?;
            }
            report.orphans_removed.push(child);
        }
    }

    Ok(())
}

/// Reads every `*.json` directly under `vm_dir`, validating that what it
/// references still exists and marking those paths as used. Stale metadata
/// (missing XVA or missing VHD member) is logged and, with `remove`,
/// unlinked.
fn scan_backup_metadata<HR: ByteHandler>(
    handler: &HR,
    vm_dir: &Path,
    surviving: &HashMap<PathBuf, VhdInfo>,
    remove: bool,
    report: &mut CleanReport,
    on_log: &mut dyn FnMut(&str, bool),
) -> Result<(HashSet<PathBuf>, Vec<(PathBuf, BackupMetadata)>)> {
    let mut used = HashSet::new();
    let mut kept = Vec::new();

    for path in handler.list(vm_dir)? {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => continue,
        };
        if !is_json_name(&name) {
            continue;
        }

        let bytes = handler.read_file(&path)?;
        let meta: BackupMetadata = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(e) => {
                on_log(&format!("{}: unparsable backup metadata ({})", path.display(), e), true);
                log::warn!("unparsable backup metadata at {}: {}", path.display(), e);
                continue;
            }
        };

        match meta.mode.as_str() {
            "full" => {
                let xva_rel = meta.xva.clone().unwrap_or_default();
                let xva_path = vm_dir.join(&xva_rel);
                if xva_rel.is_empty() || !handler.exists(&xva_path) {
                    on_log(&format!("{}: referenced XVA is missing", path.display()), true);
                    log::warn!("{} references a missing XVA", path.display());
                    if remove {
                        handler.unlink(&path)?;
                        report.metadata_removed.push(path);
                    }
                    continue;
                }
                used.insert(xva_path.clone());
                let checksum_path = xva_path.with_extension("xva.checksum");
                if handler.exists(&checksum_path) {
                    used.insert(checksum_path);
                }
            }
            "delta" => {
                let vhds_map = meta.vhds.clone().unwrap_or_default();
                let mut resolved = Vec::with_capacity(vhds_map.len());
                let mut all_present = !vhds_map.is_empty();
                for rel in vhds_map.values() {
                    let p = vm_dir.join(rel);
                    if !surviving.contains_key(&p) {
                        all_present = false;
                        break;
                    }
                    resolved.push(p);
                }
                if !all_present {
                    on_log(&format!("{}: referenced VHD chain is incomplete", path.display()), true);
                    log::warn!("{} references an incomplete VHD chain", path.display());
                    if remove {
                        handler.unlink(&path)?;
                        report.metadata_removed.push(path);
                    }
                    continue;
                }
                used.extend(resolved);
            }
            other => {
                on_log(&format!("{}: unknown backup mode '{}'", path.display(), other), true);
                log::warn!("{} has unknown backup mode '{}'", path.display(), other);
                continue;
            }
        }

        kept.push((path, meta));
    }

    Ok((used, kept))
}

/// For every surviving backup-metadata JSON, recomputes the actual size of
/// what it describes and grows (never shrinks) the recorded `size`.
fn fix_metadata_sizes<HR: ByteHandler>(
    handler: &HR,
    vm_dir: &Path,
    kept: &[(PathBuf, BackupMetadata)],
    report: &mut CleanReport,
) -> Result<()> {
    for (path, meta) in kept {
        let actual = match meta.mode.as_str() {
            "full" => {
                let xva_path = vm_dir.join(meta.xva.as_deref().unwrap_or_default());
                handler.open(&xva_path, OpenMode::ReadWrite)?.size()?
            }
            "delta" => {
                let mut total = 0_u64;
                for rel in meta.vhds.as_ref().into_iter().flat_map(|m| m.values()) {
                    let p = vm_dir.join(rel);
                    total += handler.open(&p, OpenMode::ReadWrite)?.size()?;
                }
                total
            }
            _ => continue,
        };

        if actual > meta.size.unwrap_or(0) {
            let mut updated = meta.clone();
            updated.size = Some(actual);
            let bytes = serde_json::to_vec_pretty(&updated)?;
            handler.write_file(path, &bytes)?;
            report.metadata_fixed.push(path.clone());
            log::info!("{}: grew recorded size to {} bytes", path.display(), actual);
        }
    }

    Ok(())
}

/// Finds the longest chains of *unused* differencing VHDs, each terminating
/// either at the first used descendant or at a leaf with no further child.
/// Every interrupted-merge sidecar also contributes its own `[parent,
/// child]` pair unconditionally, so a crash mid-merge is always resumed
/// even if usage has changed since.
fn build_merge_plan(
    surviving: &HashMap<PathBuf, VhdInfo>,
    children_of: &HashMap<PathBuf, PathBuf>,
    used: &HashSet<PathBuf>,
    interrupted: &HashSet<PathBuf>,
) -> Vec<Vec<PathBuf>> {
    let mut plan = Vec::new();
    let mut covered_pairs: HashSet<(PathBuf, PathBuf)> = HashSet::new();

    let mut roots: Vec<&PathBuf> = surviving.keys().collect();
    roots.sort();

    for path in roots {
        if used.contains(path) {
            continue;
        }
        let info = &surviving[path];
        let is_root_of_unused_subchain = match &info.parent {
            None => true,
            Some(p) => used.contains(p) || !surviving.contains_key(p),
        };
        if !is_root_of_unused_subchain {
            continue;
        }

        let mut chain = vec![path.clone()];
        let mut current = path.clone();
        while let Some(child) = children_of.get(&current) {
            chain.push(child.clone());
            if used.contains(child) {
                break;
            }
            current = child.clone();
        }

        if chain.len() >= 2 {
            for pair in chain.windows(2) {
                covered_pairs.insert((pair[0].clone(), pair[1].clone()));
            }
            plan.push(chain);
        }
    }

    let mut sidecar_children: Vec<&PathBuf> = interrupted.iter().collect();
    sidecar_children.sort();
    for child_path in sidecar_children {
        if let Some(info) = surviving.get(child_path) {
            if let Some(parent_path) = &info.parent {
                let pair = (parent_path.clone(), child_path.clone());
                if !covered_pairs.contains(&pair) {
                    covered_pairs.insert(pair);
                    plan.push(vec![parent_path.clone(), child_path.clone()]);
                }
            }
        }
    }

    plan
}

/// Executes a merge plan sequentially: for each chain, repeatedly merges the
/// running result into the next element and renames it over that element's
/// path, so each step's output becomes the next step's parent in place.
fn execute_merge_plan<HR: ByteHandler>(
    handler: &HR,
    plan: &[Vec<PathBuf>],
    report: &mut CleanReport,
    on_log: &mut dyn FnMut(&str, bool),
) -> Result<()> {
    for chain in plan {
        let mut current_parent = chain[0].clone();
        let mut ok = true;

        for next in &chain[1..] {
            match merge_vhd(handler, &current_parent, next, |_, _| {}) {
                Ok(bytes) => {
                    report.merged_bytes += bytes;
                    if let Err(e) = handler.rename(&current_parent, next) {
                        on_log(
                            &format!("failed to finalize merge of {} into {}: {}", current_parent.display(), next.display(), e),
                            true,
                        );
                        ok = false;
                        break;
                    }
                    current_parent = next.clone();
                }
                Err(e) => {
                    on_log(
                        &format!("merge of {} into {} failed: {}", next.display(), current_parent.display(), e),
                        true,
                    );
                    log::error!("merge of {} into {} failed: {}", next.display(), current_parent.display(), e);
                    ok = false;
                    break;
                }
            }
        }

        if ok {
            log::info!("merged chain {:?} into {}", chain, current_parent.display());
            report.merged_chains.push(chain.clone());
        }
    }

    Ok(())
}

/// Cleans a single VM's backup directory: prunes broken/orphaned VHDs,
/// validates and optionally repairs backup-metadata JSON, and (with
/// `options.merge`) folds unused differencing chains back into their root.
///
/// `on_log` receives `(message, is_error)` for every noteworthy decision,
/// mirroring what also goes to the `log` crate at `warn`/`info` level.
pub fn clean_vm<HR: ByteHandler>(
    handler: &HR,
    vm_dir: &Path,
    options: &CleanOptions,
    mut on_log: impl FnMut(&str, bool),
) -> Result<CleanReport> {
    if options.merge_limit == 0 {
        return Err(VhdError::AssertionFailure("merge_limit must be at least 1"));
    }

    let mut report = CleanReport::default();

    let (vhd_paths, interrupted) = scan_vdis(handler, vm_dir)?;
    let mut surviving = open_and_prune_broken(
        handler,
        vhd_paths,
        &interrupted,
        options.remove,
        &mut report,
        &mut on_log,
    )?;

    let mut children_of = build_children_map(&surviving, &mut on_log);
    prune_orphans(
        handler,
        &mut surviving,
        &mut children_of,
        options.remove,
        &mut report,
        &mut on_log,
    )?;

    let (used, kept_metadata) =
        scan_backup_metadata(handler, vm_dir, &surviving, options.remove, &mut report, &mut on_log)?;

    if options.merge {
        let plan = build_merge_plan(&surviving, &children_of, &used, &interrupted);
        execute_merge_plan(handler, &plan, &mut report, &mut on_log)?;
    }

    if options.fix_metadata {
        fix_metadata_sizes(handler, vm_dir, &kept_metadata, &mut report)?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MemHandler;
    use crate::sizes;

    fn make_dynamic(handler: &MemHandler, path: &Path, capacity: u64) -> VhdFile<crate::handler::MemHandle> {
        VhdFile::create_dynamic(handler, path, capacity).unwrap()
    }

    #[test]
    fn merges_unused_chain_into_used_leaf() {
        let handler = MemHandler::new();
        let vm_dir = PathBuf::from("/vm");
        let vdi_dir = vm_dir.join("vdis/pool/vdi0");

        let a_path = vdi_dir.join("a.vhd");
        let b_path = vdi_dir.join("b.vhd");
        let c_path = vdi_dir.join("c.vhd");

        let capacity = 4 * sizes::MIB;
        let a = make_dynamic(&handler, &a_path, capacity);
        let block_size = a.geometry().block_size;
        drop(a);

        {
            let a = VhdFile::open(&handler, &a_path, true).unwrap();
            let mut b = VhdFile::create_diff(&handler, &b_path, &a, "a.vhd").unwrap();
            b.write_data(0, &vec![0x11_u8; block_size as usize]).unwrap();
        }
        {
            let b = VhdFile::open(&handler, &b_path, true).unwrap();
            let mut c = VhdFile::create_diff(&handler, &c_path, &b, "b.vhd").unwrap();
            c.write_data(block_size as u64 / sizes::SECTOR_U64, &vec![0x22_u8; block_size as usize])
                .unwrap();
        }

        let backup_json = vm_dir.join("backup.json");
        let meta = BackupMetadata {
            mode: "delta".to_string(),
            size: Some(0),
            xva: None,
            vhds: Some(HashMap::from([(
                "disk0".to_string(),
                "vdis/pool/vdi0/c.vhd".to_string(),
            )])),
            extra: serde_json::Map::new(),
        };
        handler
            .write_file(&backup_json, &serde_json::to_vec(&meta).unwrap())
            .unwrap();

        let options = CleanOptions {
            remove: true,
            merge: true,
            fix_metadata: true,
            merge_limit: 1,
        };
        let report = clean_vm(&handler, &vm_dir, &options, |_, _| {}).unwrap();

        assert_eq!(report.merged_chains.len(), 1);
        assert_eq!(report.merged_chains[0], vec![a_path.clone(), b_path.clone(), c_path.clone()]);
        assert!(!handler.exists(&a_path));
        assert!(!handler.exists(&b_path));
        assert!(handler.exists(&c_path));

        let mut merged = VhdFile::open(&handler, &c_path, true).unwrap();
        assert_eq!(merged.disk_type(), VhdType::Dynamic);
        let first_block = merged.read_block(0, false).unwrap();
        assert_eq!(first_block.data.unwrap()[0], 0x11);

        assert!(!report.metadata_fixed.is_empty());
    }

    #[test]
    fn orphan_is_pruned_when_parent_missing() {
        let handler = MemHandler::new();
        let vm_dir = PathBuf::from("/vm");
        let vdi_dir = vm_dir.join("vdis/pool/vdi0");

        let a_path = vdi_dir.join("a.vhd");
        let b_path = vdi_dir.join("b.vhd");

        let a = make_dynamic(&handler, &a_path, sizes::MIB);
        VhdFile::create_diff(&handler, &b_path, &a, "a.vhd").unwrap();
        drop(a);
        handler.unlink(&a_path).unwrap();

        let options = CleanOptions {
            remove: true,
            ..CleanOptions::default()
        };
        let report = clean_vm(&handler, &vm_dir, &options, |_, _| {}).unwrap();

        assert_eq!(report.orphans_removed, vec![b_path.clone()]);
        assert!(!handler.exists(&b_path));
    }

    #[test]
    fn broken_vhd_is_reported_not_removed_without_remove_flag() {
        let handler = MemHandler::new();
        let vm_dir = PathBuf::from("/vm");
        let vdi_dir = vm_dir.join("vdis/pool/vdi0");
        let broken_path = vdi_dir.join("broken.vhd");
        handler.write_file(&broken_path, b"not a vhd").unwrap();

        let mut logged = Vec::new();
        let report = clean_vm(&handler, &vm_dir, &CleanOptions::default(), |msg, is_err| {
            logged.push((msg.to_string(), is_err));
        })
        .unwrap();

        assert!(report.broken_removed.is_empty());
        assert!(handler.exists(&broken_path));
        assert!(logged.iter().any(|(_, is_err)| *is_err));
    }
}
