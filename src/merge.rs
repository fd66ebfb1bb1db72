//! Chain merger (component C6): coalesces every allocated block of a
//! differencing VHD into its parent, one block at a time, tracking progress
//! in a durable sidecar file so the operation can resume after a crash.
//!
//! Ordering note: repeated calls to [`merge_vhd`] compose correctly when
//! walked from the oldest ancestor downward (merge the root into nothing,
//! then merge each child into the result in turn, renaming the result over
//! the child's path after each step -- see [`crate::cleaner`]). Each call
//! only ever touches the *size* fields of the parent's identity, never its
//! own ancestor pointer, so a parent that was a root before merging is still
//! a root afterward, and a parent that pointed further up the chain still
//! does. That is what lets a long chain collapse via a sequence of pairwise
//! merges without any intermediate step producing a dangling parent pointer.

use crate::handler::ByteHandler;
use crate::vhd::{VhdFile, VhdInstance, VhdType};
use crate::{Result, VhdError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk shape of a `.{child basename}.merge.json` recovery marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSidecar {
    pub parent: String,
    pub child: String,
    /// Count of child blocks processed so far; the next block to merge.
    pub merged_blocks: u32,
}

/// Sidecar path for a child VHD about to be merged into its parent.
pub fn sidecar_path(child_path: &Path) -> PathBuf {
    let name = child_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let marker = format!(".{}.merge.json", name);
    match child_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(marker),
        _ => PathBuf::from(marker),
    }
}

/// Parses a directory entry's file name back into the child path it marks a
/// merge for, or `None` if it is not a sidecar at all.
pub fn child_from_sidecar_name(dir: &Path, name: &str) -> Option<PathBuf> {
    let rest = name.strip_prefix('.')?;
    let rest = rest.strip_suffix(".merge.json")?;
    Some(dir.join(rest))
}

fn write_sidecar<HR: ByteHandler>(handler: &HR, path: &Path, state: &MergeSidecar) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(state)?;
    // Write to a temp name and rename into place so a crash mid-write can
    // never leave a half-written (but syntactically partial) sidecar behind.
    let tmp = path.with_extension("json.tmp");
    handler.write_file(&tmp, &bytes)?;
    handler.rename(&tmp, path)
}

/// Coalesces every block of the differencing VHD at `child_path` into the
/// VHD at `parent_path`, both reachable through `handler`. `on_progress` is
/// called as `(blocks_done, blocks_total)` after each block.
///
/// Safe to call again after a crash: an existing sidecar for `child_path` is
/// read back and the merge resumes from the block index it recorded, rather
/// than starting over (replaying an already-merged block is harmless, since
/// coalescing is just "copy these sectors" against sectors already copied).
///
/// Returns the number of bytes actually coalesced in this call.
pub fn merge_vhd<HR: ByteHandler>(
    handler: &HR,
    parent_path: &Path,
    child_path: &Path,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<u64> {
    let sidecar = sidecar_path(child_path);
    let resuming = handler.exists(&sidecar);

    // A crash mid-merge can leave the parent's end footer stale (block
    // relocation durably rewrites only the end copy between blocks -- see
    // `write_footer(only_end)`), so a resume must not demand head/tail
    // agreement the way a from-scratch merge does.
    let mut parent = VhdFile::open(handler, parent_path, !resuming)?;
    let mut child = VhdFile::open(handler, child_path, true)?;

    if !matches!(parent.disk_type(), VhdType::Dynamic | VhdType::Diff) {
        return Err(VhdError::ParentNotDynamic);
    }
    if child.disk_type() != VhdType::Diff {
        return Err(VhdError::NeedDynamicOrDiffImage);
    }

    let total = child.header().max_bat_size();

    let start_block = if resuming {
        let bytes = handler.read_file(&sidecar)?;
        let state: MergeSidecar = serde_json::from_slice(&bytes)?;
        state.merged_blocks.min(total)
    } else {
        let state = MergeSidecar {
            parent: parent_path.display().to_string(),
            child: child_path.display().to_string(),
            merged_blocks: 0,
        };
        write_sidecar(handler, &sidecar, &state)?;
        0
    };

    parent.ensure_bat_size(total)?;

    let mut merged_bytes = 0_u64;
    for block_id in start_block..total {
        if child.contains_block(block_id) {
            merged_bytes += parent.coalesce_block(&mut child, block_id)?;
        }

        let state = MergeSidecar {
            parent: parent_path.display().to_string(),
            child: child_path.display().to_string(),
            merged_blocks: block_id + 1,
        };
        write_sidecar(handler, &sidecar, &state)?;
        on_progress((block_id + 1) as u64, total as u64);

        log::debug!(
            "merged block {} of {} from {} into {}",
            block_id + 1,
            total,
            child_path.display(),
            parent_path.display()
        );
    }

    parent.inherit_identity_from(&child);
    parent.write_header()?;
    parent.write_footer(false)?;

    handler.unlink(&sidecar)?;

    log::info!(
        "merged {} bytes from {} into {}",
        merged_bytes,
        child_path.display(),
        parent_path.display()
    );

    Ok(merged_bytes)
}
