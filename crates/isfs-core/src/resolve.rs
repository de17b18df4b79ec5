//! Path resolution over the FST sibling/child tree.
//!
//! The FST is a flat entry array: `sub` points at a directory's first
//! child (or a file's first cluster), `sib` at the next entry in the same
//! directory, 0xFFFF terminating either chain. The root is entry 0 and is
//! never compared by name.
//!
//! Flash content is untrusted: indices are bounds-checked by the parsing
//! layer and the traversal carries a visited-entry budget so a cyclic
//! sibling chain terminates instead of spinning.

use isfs_error::{IsfsError, Result};
use isfs_ondisk::{EntryKind, FstEntry, Superblock};
use isfs_types::EntryIndex;

fn corrupt(detail: impl Into<String>) -> IsfsError {
    IsfsError::Corruption {
        page: 0,
        detail: detail.into(),
    }
}

/// Resolve a volume-relative path (the remainder after `name:`, keeping
/// its leading slash) to an FST entry.
///
/// Matching rules, per component over each sibling chain:
/// - a directory whose name matches with components left descends into
///   its children; with nothing left (or only a trailing slash) it is the
///   result
/// - a file matches only as the final component, with no trailing slash
/// - a non-matching entry continues to its sibling; mismatch is never
///   terminal
///
/// Returns `Ok(None)` when the chain ends without a match.
pub(crate) fn resolve_path(
    superblock: &Superblock,
    path: &str,
) -> Result<Option<(EntryIndex, FstEntry)>> {
    let root = superblock
        .entry(EntryIndex::ROOT)
        .map_err(|err| corrupt(err.to_string()))?;

    let trailing_slash = path.ends_with('/');
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        // "name:/" resolves to the root directory itself.
        return Ok(Some((EntryIndex::ROOT, root)));
    }

    // Total entries visited across the whole walk; a bound of the FST
    // capacity means any cycle in the table trips it.
    let mut budget = superblock.entry_capacity();
    let mut chain = root.first_child();

    for (depth, component) in components.iter().enumerate() {
        let last = depth + 1 == components.len();
        let mut descended = false;

        while let Some(index) = chain {
            if budget == 0 {
                return Err(corrupt("FST sibling chain exceeds table capacity"));
            }
            budget -= 1;

            let entry = superblock
                .entry(index)
                .map_err(|err| corrupt(err.to_string()))?;

            match entry.kind() {
                EntryKind::File => {
                    if last && !trailing_slash && entry.name_str() == *component {
                        return Ok(Some((index, entry)));
                    }
                }
                EntryKind::Directory => {
                    if entry.name_str() == *component {
                        if last {
                            return Ok(Some((index, entry)));
                        }
                        if let Some(child) = entry.first_child() {
                            chain = Some(child);
                            descended = true;
                            break;
                        }
                        // Childless directory with components remaining:
                        // keep scanning the chain.
                    }
                }
                EntryKind::Unused | EntryKind::Invalid => {}
            }
            chain = entry.next_sibling();
        }

        if !descended {
            return Ok(None);
        }
    }

    // Every component descended; unreachable because the last component
    // returns directly.
    Ok(None)
}
