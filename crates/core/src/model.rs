//! Domain types shared across the dump decoder, path tree, history builder,
//! merge reconstructor and object pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An SVN revision number. Monotonic, with permitted gaps.
pub type Revnum = u64;

/// Kind of a path node in an SVN tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn label(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

/// Action recorded against a node in a single dump revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAction {
    Add,
    Delete,
    Change,
    Replace,
}

/// A `Node-copyfrom-*` reference: this node originates from `(path, rev)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFrom {
    pub path: String,
    pub rev: Revnum,
}

/// Raw content as it arrives off the dump stream, before delta resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeContent {
    /// Fully buffered bytes.
    Full(Vec<u8>),
    /// An svndiff0 delta against `source`, not yet applied.
    Delta {
        source: CopyFrom,
        delta_bytes: Vec<u8>,
    },
    /// No content change (property-only change, or directory node).
    None,
}

/// One node-record from the dump stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpNode {
    pub path: String,
    pub kind: NodeKind,
    pub action: NodeAction,
    pub copyfrom: Option<CopyFrom>,
    pub props: BTreeMap<String, Vec<u8>>,
    /// `true` when the dump recorded a property change (as opposed to a
    /// fresh property set); used to distinguish `change` from `add|replace`
    /// when props are absent from the record entirely.
    pub props_present: bool,
    pub content: NodeContent,
    pub content_md5: Option<String>,
    pub content_sha1: Option<String>,
}

/// One `(revision-header, [node-records])` pair as yielded by the decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpRevision {
    pub rev: Revnum,
    pub author: Option<String>,
    pub date: Option<String>,
    pub log: Option<String>,
    pub nodes: Vec<DumpNode>,
}

// ---------------------------------------------------------------------------
// Tree-level types
// ---------------------------------------------------------------------------

/// Stable arena index for a tree node. See `tree.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// A resolved path entity: either a file or a directory.
///
/// Mirrors the data-model "Path node" variant from the original design:
/// `File(content-ref, props, exec-flag, special-flag)` /
/// `Dir(ordered mapping from name to Path node, props)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    File {
        content: ContentRef,
        props: BTreeMap<String, Vec<u8>>,
        executable: bool,
        special: bool,
    },
    Dir {
        children: BTreeMap<String, NodeId>,
        props: BTreeMap<String, Vec<u8>>,
    },
}

impl TreeNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            TreeNode::File { .. } => NodeKind::File,
            TreeNode::Dir { .. } => NodeKind::Dir,
        }
    }

    pub fn props(&self) -> &BTreeMap<String, Vec<u8>> {
        match self {
            TreeNode::File { props, .. } => props,
            TreeNode::Dir { props, .. } => props,
        }
    }
}

/// A handle that eventually resolves to raw file bytes. May stay a pending
/// delta against another content-ref until materialized on the blob stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContentRef {
    Bytes(Vec<u8>),
    Delta {
        source: Box<ContentRef>,
        delta_bytes: Vec<u8>,
    },
}

/// A fully closed, immutable tree at one revision.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rev: Revnum,
    pub root: NodeId,
}

// ---------------------------------------------------------------------------
// Branch-level types
// ---------------------------------------------------------------------------

/// A Git ref backed by an SVN directory, tracked across its lifecycle
/// (including termination and revival with a sibling name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub refname: String,
    pub first_rev: Revnum,
    pub parent_branch: Option<String>,
    pub tip_commit: Option<String>,
    /// SVN path that this branch's worktree is rooted at, at the revision
    /// it was last touched.
    pub svn_path: String,
    pub tree_prefix: Option<String>,
    pub is_tag: bool,
    pub terminated_at: Option<Revnum>,
    /// Whether merge-edge reconstruction (`<MapPath RecreateMerges>`) is
    /// enabled for this branch; `false` downgrades every merge candidate
    /// that would otherwise become a parent edge into a cherry-pick
    /// annotation instead.
    pub recreate_merges: bool,
}

impl Branch {
    pub fn new(refname: impl Into<String>, first_rev: Revnum, svn_path: impl Into<String>) -> Self {
        Self {
            refname: refname.into(),
            first_rev,
            parent_branch: None,
            tip_commit: None,
            svn_path: svn_path.into(),
            tree_prefix: None,
            is_tag: false,
            terminated_at: None,
            recreate_merges: true,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.terminated_at.is_none()
    }
}

/// A ref to a not-yet-materialized or already-materialized commit, used as a
/// parent pointer before the object pipeline has assigned a real SHA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitRef {
    Pending(u64),
    Sha(String),
}

/// Everything needed to synthesize one Git commit from one SVN revision on
/// one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub branch: String,
    pub svn_rev: Revnum,
    pub parents: Vec<CommitRef>,
    pub tree: NodeId,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
    pub timestamp: i64,
    pub message: String,
    pub change_id: Option<String>,
    pub cherry_picked_from: Vec<(String, Revnum)>,
}

/// A revision-range, inclusive, as it appears in an `svn:mergeinfo` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevRange {
    pub start: Revnum,
    pub end: Revnum,
}

/// Per-directory mergeinfo: `source-path -> merged revision ranges`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeinfoState {
    pub entries: BTreeMap<String, Vec<RevRange>>,
}

impl MergeinfoState {
    pub fn merged_revs(&self, source_path: &str) -> Vec<Revnum> {
        let mut out = Vec::new();
        if let Some(ranges) = self.entries.get(source_path) {
            for range in ranges {
                out.extend(range.start..=range.end);
            }
        }
        out
    }

    /// Entries present in `self` but absent from `prior` — the delta between
    /// two successive revisions' mergeinfo.
    pub fn delta_since(&self, prior: &MergeinfoState) -> BTreeMap<String, Vec<RevRange>> {
        let mut delta = BTreeMap::new();
        for (source, ranges) in &self.entries {
            let prior_revs: std::collections::BTreeSet<Revnum> = prior
                .merged_revs(source)
                .into_iter()
                .collect();
            let mut new_ranges = Vec::new();
            for range in ranges {
                let has_new = (range.start..=range.end).any(|r| !prior_revs.contains(&r));
                if has_new {
                    new_ranges.push(*range);
                }
            }
            if !new_ranges.is_empty() {
                delta.insert(source.clone(), new_ranges);
            }
        }
        delta
    }
}

/// `refname -> commit-ref`, with collision detection via `__<n>` suffixing.
#[derive(Debug, Clone, Default)]
pub struct RefRegistry {
    pub refs: BTreeMap<String, CommitRef>,
}

impl RefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, refname: &str) -> bool {
        self.refs.contains_key(refname)
    }

    pub fn insert(&mut self, refname: String, commit: CommitRef) {
        self.refs.insert(refname, commit);
    }
}
