//! Per-revision orchestration: applies a decoded revision to the path
//! tree, attributes touched paths to branches, synthesizes commit
//! messages, resolves merge parents, and hands back plan objects ready for
//! the object pipeline to execute.
//!
//! Grounded on the teacher's `sync_engine.rs` (`SyncEngine::do_sync_cycle`)
//! for the general shape of an orchestrator owning a state machine over a
//! sequence of upstream changes and emitting Git-side operations — restated
//! here for one-directional per-revision-to-commit synthesis instead of
//! bidirectional sync cycles. Deliberately kept synchronous and
//! side-effect-free on the Git side: [`HistoryBuilder`] only ever produces
//! [`PreparedCommit`] values; a caller drives the (async) object pipeline
//! and reports back the resulting SHA via [`HistoryBuilder::record_commit`]
//! before the next revision is processed, so every parent this builder
//! hands out is always already a real commit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use sha1::{Digest, Sha1};
use tracing::{debug, instrument, warn};

use crate::authors::{AuthorsMap, Identity};
use crate::config::rules::RuleSet;
use crate::errors::HistoryError;
use crate::merge::MergeEngine;
use crate::model::{Branch, CopyFrom, DumpNode, DumpRevision, NodeAction, NodeContent, NodeKind, Revnum};
use crate::pipeline::FileMode;
use crate::refmap::{MappedRef, RefMapper, Resolution};
use crate::tree::PathTree;

/// One file slated for a commit's tree, after overlay rules (ignore,
/// chmod, inject, add/delete, gitignore conversion) have been applied to
/// the branch's raw SVN subtree.
#[derive(Debug, Clone)]
pub struct OverlayFile {
    pub path: String,
    pub mode: FileMode,
    pub content: Vec<u8>,
}

/// A fully planned commit, ready for the object pipeline to materialize
/// and write. `parents` are already-resolved SHAs — this builder never
/// hands out a pending/unresolved reference.
#[derive(Debug, Clone)]
pub struct PreparedCommit {
    pub refname: String,
    pub svn_path: String,
    pub svn_rev: Revnum,
    pub parents: Vec<String>,
    pub files: Vec<OverlayFile>,
    pub message: String,
    pub author: Identity,
    pub committer: Identity,
    pub timestamp: i64,
    pub change_id: Option<String>,
    pub cherry_picked_from: Vec<(String, Revnum)>,
    /// `true` when this "commit" is really a fast-forward pointer update:
    /// the proposed merge parent already contains everything the branch
    /// would otherwise commit. The caller should move the ref to
    /// `parents[0]` instead of creating a new commit object.
    pub is_fast_forward: bool,
}

/// The outcome of closing one revision: zero or more planned commits, plus
/// any branch-termination refs that should be written once the branch's
/// last tip is confirmed unreachable from every surviving branch.
#[derive(Debug, Clone, Default)]
pub struct RevisionOutcome {
    pub commits: Vec<PreparedCommit>,
}

pub struct HistoryBuilder<'cfg> {
    rules: &'cfg RuleSet,
    mapper: RefMapper<'cfg>,
    tree: PathTree,
    merge_engine: MergeEngine,
    /// refname -> branch state, including terminated branches (kept around
    /// so a later `record_commit`/ancestor check can still see their tip).
    branches: BTreeMap<String, Branch>,
    /// alive SVN directory path -> owning refname, for ancestor-path
    /// attribution of a touched descendant path.
    path_to_refname: BTreeMap<String, String>,
    commit_history: HashMap<String, BTreeMap<Revnum, String>>,
    commit_parents: HashMap<String, Vec<String>>,
    mergeinfo_prior: HashMap<String, crate::model::MergeinfoState>,
    /// refname -> message text pending from a `<SkipCommit>`-suppressed
    /// revision, to be prepended to the branch's next emitted commit.
    skip_pending: HashMap<String, String>,
    skip_revs: HashSet<Revnum>,
    deleted_candidates: Vec<(String, String)>, // (deleted-ref-name, tip sha)
    current_rev: Revnum,
    /// `--link-orphan-revs`: when set, a branch whose root commit has no
    /// copyfrom-derived parent is linked to an earlier orphan root instead
    /// of starting parentless, provided their initial file sets overlap by
    /// more than half.
    link_orphan_revs: bool,
    /// Root commits of branches created with no copyfrom parent, in
    /// creation order: `(refname, path set, root sha)`.
    orphan_roots: Vec<(String, BTreeSet<String>, String)>,
    /// refname -> file path set for a just-planned, not-yet-recorded
    /// parentless root commit, consumed by `record_commit`.
    pending_orphan_candidates: HashMap<String, BTreeSet<String>>,
}

impl<'cfg> HistoryBuilder<'cfg> {
    pub fn new(rules: &'cfg RuleSet) -> Result<Self, HistoryError> {
        let mapper = RefMapper::new(rules)?;
        let mut skip_revs = HashSet::new();
        for rule in &rules.skip_commits {
            skip_revs.extend(rule.revs.iter().copied());
        }
        Ok(Self {
            rules,
            mapper,
            tree: PathTree::new(),
            merge_engine: MergeEngine::new(),
            branches: BTreeMap::new(),
            path_to_refname: BTreeMap::new(),
            commit_history: HashMap::new(),
            commit_parents: HashMap::new(),
            mergeinfo_prior: HashMap::new(),
            skip_pending: HashMap::new(),
            skip_revs,
            deleted_candidates: Vec::new(),
            current_rev: 0,
            link_orphan_revs: false,
            orphan_roots: Vec::new(),
            pending_orphan_candidates: HashMap::new(),
        })
    }

    /// Enables `--link-orphan-revs`: a parentless branch root commit is
    /// linked to an earlier orphan root with majority-overlapping content
    /// instead of starting history from scratch.
    pub fn with_orphan_linking(mut self, enabled: bool) -> Self {
        self.link_orphan_revs = enabled;
        self
    }

    pub fn begin_revision(&mut self, rev: Revnum) {
        self.current_rev = rev;
        self.tree.begin_revision(rev);
    }

    /// Applies one dump node-record to the snapshot under construction.
    #[instrument(skip(self, node), fields(path = %node.path))]
    pub fn apply_node(&mut self, node: &DumpNode) -> Result<(), HistoryError> {
        match node.action {
            NodeAction::Add => self.apply_add(node)?,
            NodeAction::Change => self.apply_change(node)?,
            NodeAction::Delete => {
                self.tree.delete(&node.path)?;
            }
            NodeAction::Replace => {
                // A Replace may change kind, so start from a clean slate:
                // drop whatever is there (if anything) and add fresh.
                let _ = self.tree.delete(&node.path);
                self.apply_add(node)?;
            }
        }

        if node.kind == NodeKind::Dir && node.props_present {
            let mergeinfo = node.props.get("svn:mergeinfo").map(Vec::as_slice);
            self.merge_engine.observe_props(&node.path, mergeinfo)?;
        }

        Ok(())
    }

    fn apply_add(&mut self, node: &DumpNode) -> Result<(), HistoryError> {
        match node.kind {
            NodeKind::Dir => {
                if let Some(copyfrom) = &node.copyfrom {
                    self.tree.copy(&copyfrom.path, copyfrom.rev, &node.path)?;
                } else {
                    self.tree.add(
                        &node.path,
                        crate::model::TreeNode::Dir {
                            children: Default::default(),
                            props: node.props.clone(),
                        },
                    )?;
                }
            }
            NodeKind::File => {
                let content = self.resolve_content(node)?;
                let executable = node.props.get("svn:executable").is_some();
                let special = matches!(&content, crate::model::ContentRef::Bytes(b) if b.starts_with(b"link "));
                self.tree.add(
                    &node.path,
                    crate::model::TreeNode::File {
                        content,
                        props: node.props.clone(),
                        executable,
                        special,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn apply_change(&mut self, node: &DumpNode) -> Result<(), HistoryError> {
        let existing_id = self.tree.get_building(&node.path)?;
        let existing = self.tree.node_ref(existing_id).clone();
        match existing {
            crate::model::TreeNode::Dir { children, props } => {
                let new_props = if node.props_present { node.props.clone() } else { props };
                self.tree.change(
                    &node.path,
                    crate::model::TreeNode::Dir {
                        children,
                        props: new_props,
                    },
                )?;
            }
            crate::model::TreeNode::File { content, props, .. } => {
                let new_content = match &node.content {
                    NodeContent::None => content,
                    _ => self.resolve_content(node)?,
                };
                let new_props = if node.props_present { node.props.clone() } else { props };
                let executable = new_props.get("svn:executable").is_some();
                let special =
                    matches!(&new_content, crate::model::ContentRef::Bytes(b) if b.starts_with(b"link "));
                self.tree.change(
                    &node.path,
                    crate::model::TreeNode::File {
                        content: new_content,
                        props: new_props,
                        executable,
                        special,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn resolve_content(&self, node: &DumpNode) -> Result<crate::model::ContentRef, HistoryError> {
        match &node.content {
            NodeContent::Full(bytes) => Ok(crate::model::ContentRef::Bytes(bytes.clone())),
            NodeContent::Delta { source, delta_bytes } => {
                let source_ref = self.lookup_content_ref(source)?;
                Ok(crate::model::ContentRef::Delta {
                    source: Box::new(source_ref),
                    delta_bytes: delta_bytes.clone(),
                })
            }
            NodeContent::None => Ok(crate::model::ContentRef::Bytes(Vec::new())),
        }
    }

    fn lookup_content_ref(&self, source: &CopyFrom) -> Result<crate::model::ContentRef, HistoryError> {
        let id = self.tree.get(source.rev, &source.path)?;
        match self.tree.node_ref(id) {
            crate::model::TreeNode::File { content, .. } => Ok(content.clone()),
            crate::model::TreeNode::Dir { .. } => Err(HistoryError::Tree(crate::errors::TreeError::NotFound(
                source.path.clone(),
            ))),
        }
    }

    /// Finds the branch (alive or terminated) whose current/last-known SVN
    /// path is `path` or the nearest ancestor of it.
    fn branch_for_path(&self, path: &str) -> Option<&Branch> {
        if let Some(refname) = self.path_to_refname.get(path) {
            return self.branches.get(refname);
        }
        let mut candidate = path;
        while let Some(idx) = candidate.rfind('/') {
            candidate = &candidate[..idx];
            if let Some(refname) = self.path_to_refname.get(candidate) {
                return self.branches.get(refname);
            }
        }
        None
    }

    /// Finds the not-yet-alive branch root that should own `touched_path`:
    /// walks upward through the ref mapper until a directory resolves to a
    /// concrete ref. Returns `None` once `touched_path` is already owned by
    /// a live branch (the caller checks that first) or once no ancestor
    /// maps to anything.
    fn resolve_new_owner(&mut self, touched_path: &str) -> Result<Option<(String, MappedRef)>, HistoryError> {
        let mut candidate = touched_path.to_string();
        loop {
            match self.mapper.resolve(&candidate)? {
                Resolution::Mapped(m) => return Ok(Some((candidate, m))),
                Resolution::Blocked => {
                    // This directory is explicitly excluded; keep walking
                    // upward in case an ancestor is still a branch root.
                }
                Resolution::Unmapped => {}
            }
            match candidate.rfind('/') {
                Some(idx) => candidate.truncate(idx),
                None => return Ok(None),
            }
        }
    }

    fn nearest_alive_refname(&self, path: &str) -> Option<String> {
        if let Some(r) = self.path_to_refname.get(path) {
            return Some(r.clone());
        }
        let mut candidate = path;
        while let Some(idx) = candidate.rfind('/') {
            candidate = &candidate[..idx];
            if let Some(r) = self.path_to_refname.get(candidate) {
                return Some(r.clone());
            }
        }
        None
    }

    /// Closes the revision: resolves touched paths to branches, plans a
    /// commit per touched branch, and returns them ready for execution.
    #[instrument(skip(self, rev, authors))]
    pub fn close_revision(
        &mut self,
        rev: &DumpRevision,
        authors: &AuthorsMap,
        compute_change_id: bool,
    ) -> Result<RevisionOutcome, HistoryError> {
        let snapshot = self.tree.close_revision()?;
        let touched = self.tree.touched_paths().to_vec();

        // First pass: find every touched path's owning branch root,
        // discovering (but not yet creating) any new root along the way.
        // Dedup new roots by svn_path — several touched paths under the
        // same still-to-be-created branch must not each spawn a branch.
        let mut newly_mapped: BTreeMap<String, MappedRef> = BTreeMap::new();
        let mut unresolved: Vec<String> = Vec::new();
        for (path, _change) in &touched {
            if self.nearest_alive_refname(path).is_some() {
                continue;
            }
            match self.resolve_new_owner(path)? {
                Some((svn_path, mapped)) => {
                    newly_mapped.entry(svn_path).or_insert(mapped);
                }
                None => {
                    debug!(path, "path is unmapped, skipping");
                    unresolved.push(path.clone());
                }
            }
        }

        // Create (or revive) a branch for each freshly-mapped root.
        for (svn_path, m) in &newly_mapped {
            let is_new = !self.branches.get(&m.refname).is_some_and(Branch::is_alive);
            if is_new {
                let mut branch = Branch::new(m.refname.clone(), rev.rev, svn_path.clone());
                branch.recreate_merges = m.recreate_merges;
                branch.is_tag = m.is_tag;
                branch.tree_prefix = m.tree_prefix.clone();

                if let Some(copy_src) = self.copyfrom_for_root(rev, svn_path) {
                    if let Some(parent) = self.branch_for_path(&copy_src.path) {
                        branch.parent_branch = Some(parent.refname.clone());
                        branch.tip_commit = self.tip_at_or_before(&parent.refname.clone(), copy_src.rev);
                    }
                }
                self.branches.insert(m.refname.clone(), branch);
            }
            self.path_to_refname.insert(svn_path.clone(), m.refname.clone());
        }

        // Second pass: every touched path now resolves to a live branch's
        // refname (either it always did, or its root was just created).
        let mut by_branch: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (path, _change) in &touched {
            if unresolved.contains(path) {
                continue;
            }
            if let Some(refname) = self.nearest_alive_refname(path) {
                by_branch.entry(refname).or_default().push(path.clone());
            }
        }

        // Detect branch termination: an alive branch whose svn_path was
        // itself deleted this revision.
        let mut terminated_this_rev = Vec::new();
        for (path, change) in &touched {
            if *change == crate::tree::PathChange::Deleted {
                if let Some(refname) = self.path_to_refname.get(path).cloned() {
                    terminated_this_rev.push((path.clone(), refname));
                }
            }
        }
        for (path, refname) in &terminated_this_rev {
            self.path_to_refname.remove(path);
            if let Some(branch) = self.branches.get_mut(refname) {
                branch.terminated_at = Some(rev.rev);
                if let Some(tip) = &branch.tip_commit {
                    self.deleted_candidates
                        .push((format!("{refname}_deleted@r{}", rev.rev), tip.clone()));
                }
            }
            // A branch-root deletion ends the branch outright; nothing
            // further is committed to it this revision.
            by_branch.remove(refname);
        }

        let mut commits = Vec::new();
        for (refname, paths) in by_branch {
            if paths.is_empty() {
                continue;
            }
            if let Some(commit) = self.plan_commit(&refname, rev, authors, compute_change_id)? {
                commits.push(commit);
            }
        }

        debug!(rev = rev.rev, commits = commits.len(), tree_root = ?snapshot.root, "closed revision");
        Ok(RevisionOutcome { commits })
    }

    fn copyfrom_for_root<'a>(&self, rev: &'a DumpRevision, svn_path: &str) -> Option<&'a CopyFrom> {
        rev.nodes
            .iter()
            .find(|n| n.path == svn_path && n.kind == NodeKind::Dir)
            .and_then(|n| n.copyfrom.as_ref())
    }

    fn tip_at_or_before(&self, refname: &str, rev: Revnum) -> Option<String> {
        self.commit_history
            .get(refname)
            .and_then(|history| history.range(..=rev).next_back())
            .map(|(_, sha)| sha.clone())
    }

    fn plan_commit(
        &mut self,
        refname: &str,
        rev: &DumpRevision,
        authors: &AuthorsMap,
        compute_change_id: bool,
    ) -> Result<Option<PreparedCommit>, HistoryError> {
        let branch = self
            .branches
            .get(refname)
            .ok_or_else(|| HistoryError::NoParentTip(refname.to_string()))?
            .clone();

        let parent0 = branch.tip_commit.clone();
        let (merge_parents, cherry_picks) = self.compute_merge_parents(&branch)?;

        let is_skip_rev = self.skip_revs.contains(&rev.rev);
        let would_be_merge = !merge_parents.is_empty();
        let is_copy_source = rev.nodes.iter().any(|n| {
            n.copyfrom
                .as_ref()
                .is_some_and(|c| c.path == branch.svn_path || c.path.starts_with(&format!("{}/", branch.svn_path)))
        });

        if is_skip_rev && !would_be_merge && !is_copy_source {
            let log_text = rev.log.clone().unwrap_or_default();
            let entry = self.skip_pending.entry(refname.to_string()).or_default();
            if entry.is_empty() {
                *entry = log_text;
            } else {
                entry.push_str("\n\n");
                entry.push_str(&log_text);
            }
            return Ok(None);
        }

        let mut parents = Vec::new();
        if let Some(p0) = &parent0 {
            parents.push(p0.clone());
        }
        let mut is_fast_forward = false;
        for (sha, _category) in &merge_parents {
            if parent0.as_deref().is_some_and(|tip| self.is_ancestor(tip, sha)) && merge_parents.len() == 1 {
                is_fast_forward = true;
            }
            if !parents.contains(sha) {
                parents.push(sha.clone());
            }
        }

        let files = self.build_overlay(&branch, rev.rev)?;

        // `--link-orphan-revs`: a freshly created branch with no
        // copyfrom-derived parent and no merge parent of its own can still
        // be linked to an earlier orphan root if their initial content
        // overlaps by more than half, in branch-creation order.
        if self.link_orphan_revs
            && parents.is_empty()
            && rev.rev == branch.first_rev
            && branch.parent_branch.is_none()
        {
            let this_paths: BTreeSet<String> = files.iter().map(|f| f.path.clone()).collect();
            if !this_paths.is_empty() {
                let link = self.orphan_roots.iter().find_map(|(other_ref, other_paths, sha)| {
                    let overlap = this_paths.intersection(other_paths).count();
                    let union = this_paths.union(other_paths).count().max(1);
                    (overlap as f64 / union as f64 > 0.5).then(|| (other_ref.clone(), sha.clone()))
                });
                match link {
                    Some((other_refname, sha)) => {
                        debug!(refname, %other_refname, "linking orphan root to overlapping sibling");
                        parents.push(sha);
                    }
                    None => {
                        self.pending_orphan_candidates
                            .insert(refname.to_string(), this_paths);
                    }
                }
            }
        }

        let raw_log = rev.log.clone().unwrap_or_default();
        let mut message = match self.skip_pending.remove(refname) {
            Some(pending) if !pending.is_empty() => format!("{pending}\n\n{raw_log}"),
            _ => raw_log,
        };
        message = self.apply_edit_msg_chain(&message);
        if message.starts_with("\n\n") {
            let summary = self.change_summary(&branch.svn_path);
            message = format!("{summary}{message}");
        }

        let username = rev.author.clone().unwrap_or_else(|| "unknown".to_string());
        let identity = authors.resolve(&username);
        let timestamp = parse_svn_date(rev.date.as_deref());

        let change_id = if compute_change_id {
            Some(compute_change_id_hash(&parents, &identity, timestamp, &message))
        } else {
            None
        };

        Ok(Some(PreparedCommit {
            refname: refname.to_string(),
            svn_path: branch.svn_path.clone(),
            svn_rev: rev.rev,
            parents,
            files,
            message,
            author: identity.clone(),
            committer: identity,
            timestamp,
            change_id,
            cherry_picked_from: cherry_picks,
            is_fast_forward,
        }))
    }

    fn compute_merge_parents(
        &mut self,
        branch: &Branch,
    ) -> Result<(Vec<(String, crate::merge::MergeCategory)>, Vec<(String, Revnum)>), HistoryError> {
        let prior = self
            .mergeinfo_prior
            .get(&branch.refname)
            .cloned()
            .unwrap_or_default();
        let effective = self
            .merge_engine
            .effective_at(&branch.svn_path, self.rules.inherit_mergeinfo);
        let delta = effective.delta_since(&prior);
        self.mergeinfo_prior.insert(branch.refname.clone(), effective);

        let mut merge_parents = Vec::new();
        let mut cherry_picks = Vec::new();

        for (source_path, ranges) in &delta {
            // svn:mergeinfo source paths are repository-absolute (leading
            // `/`); branch svn_paths are stored without it.
            let normalized = source_path.trim_start_matches('/');
            let Some(source_branch) = self.branch_for_path(normalized).cloned() else {
                warn!(source_path, "merge source does not resolve to a known branch");
                continue;
            };
            if source_branch.refname == branch.refname {
                continue;
            }
            let range_end = ranges.iter().map(|r| r.end).max().unwrap_or(0);

            let required: BTreeSet<Revnum> = self
                .commit_history
                .get(&source_branch.refname)
                .into_iter()
                .flat_map(|h| h.range(..=range_end).map(|(r, _)| *r))
                .filter(|r| *r >= source_branch.first_rev)
                .collect();
            let merged: HashSet<Revnum> = ranges.iter().flat_map(|r| r.start..=r.end).collect();
            let missing = required.iter().any(|r| !merged.contains(r));

            if missing {
                cherry_picks.push((source_path.clone(), range_end));
                continue;
            }

            let Some(merge_base) = self.tip_at_or_before(&source_branch.refname, range_end) else {
                continue;
            };

            if branch.recreate_merges {
                merge_parents.push((merge_base, crate::merge::MergeCategory::BranchMerge));
            } else {
                cherry_picks.push((source_path.clone(), range_end));
            }
        }

        Ok((merge_parents, cherry_picks))
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        if ancestor == descendant {
            return true;
        }
        let mut stack = vec![descendant.to_string()];
        let mut seen = HashSet::new();
        while let Some(sha) = stack.pop() {
            if !seen.insert(sha.clone()) {
                continue;
            }
            if let Some(parents) = self.commit_parents.get(&sha) {
                for p in parents {
                    if p == ancestor {
                        return true;
                    }
                    stack.push(p.clone());
                }
            }
        }
        false
    }

    /// Builds the overlay file list for `branch` at the revision just
    /// closed: the raw SVN subtree, filtered by `<IgnoreFiles>`, with
    /// `<Chmod>` overrides, `<InjectFile>`/`<AddFile>`/`<DeletePath>`
    /// applied, and `svn:gitignore` converted to a literal `.gitignore`.
    fn build_overlay(&self, branch: &Branch, rev: Revnum) -> Result<Vec<OverlayFile>, HistoryError> {
        let root = match self.tree.get(self.tree_head_rev(), &branch.svn_path) {
            Ok(id) => id,
            Err(_) => return Ok(Vec::new()),
        };

        let prefixed = |relative: &str| -> String {
            match &branch.tree_prefix {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}/{relative}"),
                _ => relative.to_string(),
            }
        };

        let mut out: BTreeMap<String, OverlayFile> = BTreeMap::new();
        for (relative_path, bytes) in self.tree.walk_gitignore_props(root) {
            let gitignore_path = if relative_path.is_empty() {
                ".gitignore".to_string()
            } else {
                format!("{relative_path}/.gitignore")
            };
            let path = prefixed(&gitignore_path);
            out.insert(
                path.clone(),
                OverlayFile {
                    path,
                    mode: FileMode::Blob,
                    content: bytes,
                },
            );
        }

        for (relative_path, id) in self.tree.walk_files(root) {
            if self.rules.ignore_files.iter().any(|g| g.matches_fully(&relative_path)) {
                continue;
            }
            let path = prefixed(&relative_path);
            let crate::model::TreeNode::File {
                content,
                executable,
                special,
                ..
            } = self.tree.node_ref(id)
            else {
                continue;
            };
            let mut mode = if *special {
                FileMode::Symlink
            } else if *executable {
                FileMode::BlobExecutable
            } else {
                FileMode::Blob
            };
            for chmod in &self.rules.chmods {
                if let Ok(g) = crate::glob::Glob::compile(&chmod.pattern) {
                    if g.matches_fully(&path) {
                        mode = if chmod.executable {
                            FileMode::BlobExecutable
                        } else {
                            FileMode::Blob
                        };
                    }
                }
            }
            let bytes = self.tree.materialize(content)?;
            out.insert(path.clone(), OverlayFile { path, mode, content: bytes });
        }

        for inject in &self.rules.inject_files {
            let content = std::fs::read(&inject.content_path).unwrap_or_default();
            out.insert(
                inject.path.clone(),
                OverlayFile {
                    path: inject.path.clone(),
                    mode: FileMode::Blob,
                    content,
                },
            );
        }

        for add in &self.rules.add_files {
            if add.rev.is_some_and(|r| r == rev) {
                if self.rules.delete_wins(rev, &add.path) {
                    continue;
                }
                let content = std::fs::read(&add.content_path).unwrap_or_default();
                out.insert(
                    add.path.clone(),
                    OverlayFile {
                        path: add.path.clone(),
                        mode: FileMode::Blob,
                        content,
                    },
                );
            }
        }
        for del in &self.rules.delete_paths {
            if del.rev.is_some_and(|r| r == rev) && self.rules.delete_wins(rev, &del.path) {
                out.remove(&del.path);
            }
        }

        Ok(out.into_values().collect())
    }

    fn tree_head_rev(&self) -> Revnum {
        self.current_rev
    }

    /// Applies the resolved `<EditMsg>` chain: first matching rule's
    /// replacement wins unless marked `Final`, in which case no further
    /// rules are tried.
    fn apply_edit_msg_chain(&self, message: &str) -> String {
        let mut current = message.to_string();
        for rule in &self.rules.edit_msgs {
            let Ok(glob) = crate::glob::Glob::compile(&rule.match_pattern) else {
                continue;
            };
            if glob.matches_fully(&current) {
                current = rule.replacement.clone();
                if rule.is_final {
                    break;
                }
            }
        }
        current
    }

    fn change_summary(&self, svn_path: &str) -> String {
        format!("Changes from SVN {svn_path}\n")
    }

    /// Records the result of executing a [`PreparedCommit`]: the branch's
    /// tip now points at `sha`, and future parent/ancestor lookups can see
    /// it.
    pub fn record_commit(&mut self, refname: &str, rev: Revnum, sha: String, parent_shas: Vec<String>) {
        if let Some(branch) = self.branches.get_mut(refname) {
            branch.tip_commit = Some(sha.clone());
        }
        self.commit_history
            .entry(refname.to_string())
            .or_default()
            .insert(rev, sha.clone());
        if let Some(paths) = self.pending_orphan_candidates.remove(refname) {
            self.orphan_roots.push((refname.to_string(), paths, sha.clone()));
        }
        self.commit_parents.insert(sha, parent_shas);
    }

    /// Returns every `<branch>_deleted@r<N>` ref that should be written:
    /// branches terminated during the run whose last tip is not reachable
    /// from any branch still alive.
    pub fn finalize_deleted_refs(&self) -> Vec<(String, String)> {
        let alive_tips: Vec<String> = self
            .branches
            .values()
            .filter(|b| b.is_alive())
            .filter_map(|b| b.tip_commit.clone())
            .collect();

        self.deleted_candidates
            .iter()
            .filter(|(_, tip)| !alive_tips.iter().any(|alive| self.is_ancestor(tip, alive)))
            .cloned()
            .collect()
    }

    pub fn branch(&self, refname: &str) -> Option<&Branch> {
        self.branches.get(refname)
    }
}

fn parse_svn_date(date: Option<&str>) -> i64 {
    date.and_then(|d| chrono::DateTime::parse_from_rfc3339(d).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

fn compute_change_id_hash(parents: &[String], author: &Identity, timestamp: i64, message: &str) -> String {
    let mut hasher = Sha1::new();
    for parent in parents {
        hasher.update(parent.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(author.name.as_bytes());
    hasher.update(b"\0");
    hasher.update(author.email.as_bytes());
    hasher.update(b"\0");
    hasher.update(timestamp.to_le_bytes());
    hasher.update(message.as_bytes());
    format!("I{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::parse_document;
    use crate::model::{NodeAction, NodeKind};

    fn rules_from(xml: &str) -> RuleSet {
        let doc = parse_document(xml).unwrap();
        RuleSet::resolve(&doc, &[]).unwrap()
    }

    fn dir_node(path: &str) -> DumpNode {
        DumpNode {
            path: path.to_string(),
            kind: NodeKind::Dir,
            action: NodeAction::Add,
            copyfrom: None,
            props: Default::default(),
            props_present: false,
            content: NodeContent::None,
            content_md5: None,
            content_sha1: None,
        }
    }

    fn file_node(path: &str, action: NodeAction, bytes: &[u8]) -> DumpNode {
        DumpNode {
            path: path.to_string(),
            kind: NodeKind::File,
            action,
            copyfrom: None,
            props: Default::default(),
            props_present: false,
            content: NodeContent::Full(bytes.to_vec()),
            content_md5: None,
            content_sha1: None,
        }
    }

    fn revision(rev: Revnum, log: &str, nodes: Vec<DumpNode>) -> DumpRevision {
        DumpRevision {
            rev,
            author: Some("alice".to_string()),
            date: Some("2024-01-01T00:00:00Z".to_string()),
            log: Some(log.to_string()),
            nodes,
        }
    }

    #[test]
    fn trunk_commit_has_no_parents() {
        let rules = rules_from(
            r#"<Config><Default><MapPath Path="trunk" Refname="refs/heads/main"/></Default></Config>"#,
        );
        let mut hb = HistoryBuilder::new(&rules).unwrap();
        let authors = AuthorsMap::empty();

        hb.begin_revision(1);
        hb.apply_node(&dir_node("trunk")).unwrap();
        hb.apply_node(&file_node("trunk/a.txt", NodeAction::Add, b"hello")).unwrap();
        let outcome = hb.close_revision(&revision(1, "initial", vec![]), &authors, false).unwrap();

        assert_eq!(outcome.commits.len(), 1);
        let commit = &outcome.commits[0];
        assert_eq!(commit.refname, "refs/heads/main");
        assert!(commit.parents.is_empty());
        assert_eq!(commit.files.len(), 1);
        assert_eq!(commit.files[0].path, "a.txt");
    }

    #[test]
    fn branch_copy_then_merge_produces_two_parents() {
        let rules = rules_from(
            r#"<Config><Default>
                <MapPath Path="trunk" Refname="refs/heads/main"/>
                <MapPath Path="branches/*" Refname="refs/heads/$1"/>
            </Default></Config>"#,
        );
        let mut hb = HistoryBuilder::new(&rules).unwrap();
        let authors = AuthorsMap::empty();

        hb.begin_revision(1);
        hb.apply_node(&dir_node("trunk")).unwrap();
        hb.apply_node(&file_node("trunk/a.txt", NodeAction::Add, b"hello")).unwrap();
        let r1 = hb.close_revision(&revision(1, "init", vec![]), &authors, false).unwrap();
        assert_eq!(r1.commits.len(), 1);
        hb.record_commit("refs/heads/main", 1, "sha-main-1".to_string(), vec![]);

        hb.begin_revision(2);
        let mut copy = dir_node("branches/feat");
        copy.copyfrom = Some(CopyFrom {
            path: "trunk".to_string(),
            rev: 1,
        });
        hb.apply_node(&copy).unwrap();
        let r2 = hb
            .close_revision(&revision(2, "branch feat", vec![copy]), &authors, false)
            .unwrap();
        assert_eq!(r2.commits.len(), 1);
        assert_eq!(r2.commits[0].parents, vec!["sha-main-1".to_string()]);
        hb.record_commit(
            "refs/heads/feat",
            2,
            "sha-feat-2".to_string(),
            vec!["sha-main-1".to_string()],
        );

        hb.begin_revision(3);
        hb.apply_node(&file_node("branches/feat/a.txt", NodeAction::Change, b"world"))
            .unwrap();
        let r3 = hb.close_revision(&revision(3, "work on feat", vec![]), &authors, false).unwrap();
        assert_eq!(r3.commits.len(), 1);
        hb.record_commit(
            "refs/heads/feat",
            3,
            "sha-feat-3".to_string(),
            vec!["sha-feat-2".to_string()],
        );

        // r4: trunk diverges on its own (independent of feat), so the later
        // merge cannot collapse into a fast-forward.
        hb.begin_revision(4);
        hb.apply_node(&file_node("trunk/other.txt", NodeAction::Add, b"unrelated"))
            .unwrap();
        let r4 = hb.close_revision(&revision(4, "unrelated trunk work", vec![]), &authors, false).unwrap();
        assert_eq!(r4.commits.len(), 1);
        hb.record_commit(
            "refs/heads/main",
            4,
            "sha-main-4".to_string(),
            vec!["sha-main-1".to_string()],
        );

        // r5: merge feat back into trunk via svn:mergeinfo.
        hb.begin_revision(5);
        let mut mergeinfo_node = dir_node("trunk");
        mergeinfo_node.action = NodeAction::Change;
        mergeinfo_node.props_present = true;
        mergeinfo_node
            .props
            .insert("svn:mergeinfo".to_string(), b"/branches/feat:2-3".to_vec());
        hb.apply_node(&mergeinfo_node).unwrap();
        hb.apply_node(&file_node("trunk/a.txt", NodeAction::Change, b"world"))
            .unwrap();
        let r5 = hb
            .close_revision(&revision(5, "merge feat to trunk", vec![]), &authors, false)
            .unwrap();

        assert_eq!(r5.commits.len(), 1);
        let merge_commit = &r5.commits[0];
        assert_eq!(merge_commit.refname, "refs/heads/main");
        assert!(!merge_commit.is_fast_forward);
        assert_eq!(merge_commit.parents.len(), 2);
        assert!(merge_commit.parents.contains(&"sha-main-4".to_string()));
        assert!(merge_commit.parents.contains(&"sha-feat-3".to_string()));
    }

    #[test]
    fn skip_commit_message_is_prepended_to_next() {
        let rules = rules_from(
            r#"<Config><Default>
                <MapPath Path="trunk" Refname="refs/heads/main"/>
                <SkipCommit Revs="1"/>
            </Default></Config>"#,
        );
        let mut hb = HistoryBuilder::new(&rules).unwrap();
        let authors = AuthorsMap::empty();

        hb.begin_revision(1);
        hb.apply_node(&dir_node("trunk")).unwrap();
        hb.apply_node(&file_node("trunk/a.txt", NodeAction::Add, b"x")).unwrap();
        let r1 = hb.close_revision(&revision(1, "typo", vec![]), &authors, false).unwrap();
        assert!(r1.commits.is_empty());

        hb.begin_revision(2);
        hb.apply_node(&file_node("trunk/b.txt", NodeAction::Add, b"y")).unwrap();
        let r2 = hb.close_revision(&revision(2, "fix thing", vec![]), &authors, false).unwrap();
        assert_eq!(r2.commits.len(), 1);
        assert!(r2.commits[0].message.starts_with("typo\n\nfix thing"));
    }

    #[test]
    fn deleted_branch_schedules_deleted_ref_when_never_merged() {
        let rules = rules_from(
            r#"<Config><Default><MapPath Path="branches/*" Refname="refs/heads/$1"/></Default></Config>"#,
        );
        let mut hb = HistoryBuilder::new(&rules).unwrap();
        let authors = AuthorsMap::empty();

        hb.begin_revision(10);
        hb.apply_node(&dir_node("branches/b")).unwrap();
        hb.apply_node(&file_node("branches/b/x.txt", NodeAction::Add, b"x")).unwrap();
        let r10 = hb.close_revision(&revision(10, "create b", vec![]), &authors, false).unwrap();
        hb.record_commit("refs/heads/b", 10, "sha-b-10".to_string(), vec![]);
        assert_eq!(r10.commits.len(), 1);

        hb.begin_revision(20);
        hb.apply_node(&DumpNode {
            action: NodeAction::Delete,
            ..dir_node("branches/b")
        })
        .unwrap();
        let r20 = hb.close_revision(&revision(20, "remove b", vec![]), &authors, false).unwrap();
        assert!(r20.commits.is_empty());

        let deleted = hb.finalize_deleted_refs();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].0, "refs/heads/b_deleted@r20");
        assert_eq!(deleted[0].1, "sha-b-10");
    }

    #[test]
    fn change_id_is_deterministic_for_identical_inputs() {
        let id = Identity {
            name: "Jane".into(),
            email: "jane@example.com".into(),
        };
        let a = compute_change_id_hash(&["p1".to_string()], &id, 1000, "msg");
        let b = compute_change_id_hash(&["p1".to_string()], &id, 1000, "msg");
        assert_eq!(a, b);
        assert!(a.starts_with('I'));
    }

    #[test]
    fn link_orphan_revs_joins_overlapping_roots() {
        let rules = rules_from(
            r#"<Config><Default>
                <MapPath Path="branches/a" Refname="refs/heads/a"/>
                <MapPath Path="branches/b" Refname="refs/heads/b"/>
            </Default></Config>"#,
        );
        let mut hb = HistoryBuilder::new(&rules).unwrap().with_orphan_linking(true);
        let authors = AuthorsMap::empty();

        hb.begin_revision(100);
        hb.apply_node(&dir_node("branches/a")).unwrap();
        hb.apply_node(&file_node("branches/a/x.txt", NodeAction::Add, b"one")).unwrap();
        hb.apply_node(&file_node("branches/a/y.txt", NodeAction::Add, b"two")).unwrap();
        let r1 = hb.close_revision(&revision(100, "a appears", vec![]), &authors, false).unwrap();
        assert_eq!(r1.commits.len(), 1);
        assert!(r1.commits[0].parents.is_empty());
        hb.record_commit("refs/heads/a", 100, "sha-a-root".to_string(), vec![]);

        hb.begin_revision(101);
        hb.apply_node(&dir_node("branches/b")).unwrap();
        hb.apply_node(&file_node("branches/b/x.txt", NodeAction::Add, b"one")).unwrap();
        hb.apply_node(&file_node("branches/b/y.txt", NodeAction::Add, b"two")).unwrap();
        let r2 = hb.close_revision(&revision(101, "b appears", vec![]), &authors, false).unwrap();
        assert_eq!(r2.commits.len(), 1);
        // Identical content to `a`'s root: links to it rather than starting
        // a second unrelated history.
        assert_eq!(r2.commits[0].parents, vec!["sha-a-root".to_string()]);
    }

    #[test]
    fn link_orphan_revs_leaves_unrelated_roots_parentless() {
        let rules = rules_from(
            r#"<Config><Default>
                <MapPath Path="branches/a" Refname="refs/heads/a"/>
                <MapPath Path="branches/b" Refname="refs/heads/b"/>
            </Default></Config>"#,
        );
        let mut hb = HistoryBuilder::new(&rules).unwrap().with_orphan_linking(true);
        let authors = AuthorsMap::empty();

        hb.begin_revision(100);
        hb.apply_node(&dir_node("branches/a")).unwrap();
        hb.apply_node(&file_node("branches/a/x.txt", NodeAction::Add, b"one")).unwrap();
        let r1 = hb.close_revision(&revision(100, "a appears", vec![]), &authors, false).unwrap();
        hb.record_commit("refs/heads/a", 100, "sha-a-root".to_string(), vec![]);
        assert!(r1.commits[0].parents.is_empty());

        hb.begin_revision(101);
        hb.apply_node(&dir_node("branches/b")).unwrap();
        hb.apply_node(&file_node("branches/b/z.txt", NodeAction::Add, b"unrelated")).unwrap();
        let r2 = hb.close_revision(&revision(101, "b appears", vec![]), &authors, false).unwrap();
        assert!(r2.commits[0].parents.is_empty());
    }
}
