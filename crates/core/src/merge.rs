//! Derives Git merge-parent edges from `svn:mergeinfo` deltas and
//! copyfrom directory/file copies.
//!
//! Mergeinfo bookkeeping (parsing, inheritance, delta) lives here; the
//! coverage check and fast-forward collapse need the commit graph the
//! history builder owns, so that part of the reconstruction runs as a
//! method call from `history.rs` against the deltas this module produces.

use std::collections::BTreeMap;

use crate::errors::MergeError;
use crate::model::{MergeinfoState, RevRange, Revnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeCategory {
    BranchMerge,
    FileMerge,
    DirCopy,
    FileCopy,
}

pub struct MergeEngine {
    /// SVN directory path -> mergeinfo state as last observed on that path.
    state: BTreeMap<String, MergeinfoState>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self {
            state: BTreeMap::new(),
        }
    }

    /// Records (or clears) the `svn:mergeinfo` property observed on
    /// `path` at the current revision.
    pub fn observe_props(&mut self, path: &str, raw: Option<&[u8]>) -> Result<(), MergeError> {
        match raw {
            Some(bytes) => {
                let parsed = parse_mergeinfo(bytes)?;
                self.state.insert(path.to_string(), parsed);
            }
            None => {
                self.state.remove(path);
            }
        }
        Ok(())
    }

    /// Mergeinfo effective at `path`: its own entry if present, else
    /// inherited from the nearest ancestor directory that carries the
    /// attribute (unless `inherit` is `false`).
    pub fn effective_at(&self, path: &str, inherit: bool) -> MergeinfoState {
        if let Some(state) = self.state.get(path) {
            return state.clone();
        }
        if !inherit {
            return MergeinfoState::default();
        }
        let mut candidate = path;
        while let Some(idx) = candidate.rfind('/') {
            candidate = &candidate[..idx];
            if let Some(state) = self.state.get(candidate) {
                return state.clone();
            }
        }
        self.state.get("").cloned().unwrap_or_default()
    }

    /// Newly-added `(source-path, rev-ranges)` entries at `path` between
    /// `prior` and the currently observed state.
    pub fn delta_at(
        &self,
        path: &str,
        inherit: bool,
        prior: &MergeinfoState,
    ) -> BTreeMap<String, Vec<RevRange>> {
        self.effective_at(path, inherit).delta_since(prior)
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses an `svn:mergeinfo` property value: lines of `path:ranges`,
/// ranges comma-separated `N` or `N-M`, optionally suffixed `*`
/// (non-inheritable; treated the same as inheritable here since the
/// converter only cares whether a revision was merged at all).
fn parse_mergeinfo(bytes: &[u8]) -> Result<MergeinfoState, MergeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| MergeError::MalformedMergeinfo("not valid utf-8".to_string()))?;
    let mut state = MergeinfoState::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (path, ranges) = line
            .split_once(':')
            .ok_or_else(|| MergeError::MalformedMergeinfo(line.to_string()))?;
        let mut parsed_ranges = Vec::new();
        for part in ranges.split(',') {
            let part = part.trim().trim_end_matches('*');
            let (start, end) = match part.split_once('-') {
                Some((a, b)) => (
                    a.parse::<Revnum>()
                        .map_err(|_| MergeError::MalformedMergeinfo(part.to_string()))?,
                    b.parse::<Revnum>()
                        .map_err(|_| MergeError::MalformedMergeinfo(part.to_string()))?,
                ),
                None => {
                    let rev = part
                        .parse::<Revnum>()
                        .map_err(|_| MergeError::MalformedMergeinfo(part.to_string()))?;
                    (rev, rev)
                }
            };
            if start > end {
                return Err(MergeError::InvalidRange { start, end });
            }
            parsed_ranges.push(RevRange { start, end });
        }
        state.entries.insert(path.to_string(), parsed_ranges);
    }
    Ok(state)
}

/// Classifies a copyfrom-backed merge candidate. `similarity` is the
/// fraction of the destination branch's path set already present (by
/// name) in the source, used for the file_copy >50% threshold.
pub fn classify_copy(is_dir: bool, similarity: f64) -> MergeCategory {
    match (is_dir, similarity > 0.5) {
        (true, _) => MergeCategory::DirCopy,
        (false, true) => MergeCategory::FileCopy,
        (false, false) => MergeCategory::FileMerge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_mergeinfo() {
        let state = parse_mergeinfo(b"/branches/feat:10-20,25").unwrap();
        assert_eq!(
            state.entries["/branches/feat"],
            vec![
                RevRange { start: 10, end: 20 },
                RevRange { start: 25, end: 25 }
            ]
        );
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse_mergeinfo(b"no-colon-here").is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(parse_mergeinfo(b"/branches/feat:20-10").is_err());
    }

    #[test]
    fn inherits_from_nearest_ancestor() {
        let mut engine = MergeEngine::new();
        engine
            .observe_props("/trunk", Some(b"/branches/feat:1-5"))
            .unwrap();
        let effective = engine.effective_at("/trunk/sub/dir", true);
        assert_eq!(
            effective.merged_revs("/branches/feat"),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn no_inherit_returns_empty_for_child() {
        let mut engine = MergeEngine::new();
        engine
            .observe_props("/trunk", Some(b"/branches/feat:1-5"))
            .unwrap();
        let effective = engine.effective_at("/trunk/sub", false);
        assert!(effective.entries.is_empty());
    }

    #[test]
    fn delta_reports_only_new_ranges() {
        let mut engine = MergeEngine::new();
        engine
            .observe_props("/trunk", Some(b"/branches/feat:1-5"))
            .unwrap();
        let prior = engine.effective_at("/trunk", true);
        engine
            .observe_props("/trunk", Some(b"/branches/feat:1-10"))
            .unwrap();
        let delta = engine.delta_at("/trunk", true, &prior);
        assert_eq!(delta["/branches/feat"], vec![RevRange { start: 1, end: 10 }]);
    }

    #[test]
    fn classify_copy_picks_threshold() {
        assert_eq!(classify_copy(true, 0.0), MergeCategory::DirCopy);
        assert_eq!(classify_copy(false, 0.9), MergeCategory::FileCopy);
        assert_eq!(classify_copy(false, 0.1), MergeCategory::FileMerge);
    }
}
