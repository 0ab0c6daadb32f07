//! `git2`-backed [`GitSink`]: writes blobs, trees, commits and refs
//! in-process against a local repository, with no `git` subprocess.
//!
//! Grounded on the teacher's `git/client.rs` (`GitClient` wrapping
//! `git2::Repository` for local mutation — blob/tree/commit writes, ref
//! updates via `Repository::reference`). Since branches here are
//! synthesized independently of any checked-out worktree (a conversion run
//! may produce hundreds of branches, none of which are ever checked out),
//! trees are built directly from a flat per-branch path map via
//! `TreeBuilder` rather than through the repository's index — there is no
//! single working tree to stage into.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use git2::{Oid, Repository, Signature, Time};
use tracing::{info, instrument};

use crate::authors::Identity;
use crate::errors::PipelineError;

use super::{FileMode, GitSink, StageOp};

pub struct Git2Sink {
    repo: Repository,
    /// branch refname -> relative path -> (mode, blob/tree oid).
    staged: HashMap<String, BTreeMap<String, (FileMode, Oid)>>,
}

impl Git2Sink {
    /// Opens an existing repository (bare or not) at `path`.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let repo = Repository::open(path)?;
        Ok(Self {
            repo,
            staged: HashMap::new(),
        })
    }

    /// Initializes a fresh bare repository at `path`, the usual target for
    /// a from-scratch conversion run.
    #[instrument]
    pub fn init_bare(path: &Path) -> Result<Self, PipelineError> {
        info!(path = %path.display(), "initializing bare target repository");
        let repo = Repository::init_bare(path)?;
        Ok(Self {
            repo,
            staged: HashMap::new(),
        })
    }

    fn build_tree(&self, entries: &BTreeMap<String, (FileMode, Oid)>) -> Result<Oid, PipelineError> {
        let mut direct: Vec<(&str, FileMode, Oid)> = Vec::new();
        let mut nested: BTreeMap<&str, BTreeMap<String, (FileMode, Oid)>> = BTreeMap::new();

        for (path, (mode, oid)) in entries {
            match path.split_once('/') {
                Some((first, rest)) => {
                    nested
                        .entry(first)
                        .or_default()
                        .insert(rest.to_string(), (*mode, *oid));
                }
                None => direct.push((path.as_str(), *mode, *oid)),
            }
        }

        let mut builder = self.repo.treebuilder(None)?;
        for (name, mode, oid) in direct {
            builder.insert(name, oid, mode.git_mode())?;
        }
        for (name, children) in nested {
            let sub_oid = self.build_tree(&children)?;
            builder.insert(name, sub_oid, FileMode::Tree.git_mode())?;
        }
        Ok(builder.write()?)
    }
}

impl GitSink for Git2Sink {
    #[instrument(skip(self, bytes))]
    fn hash_object(&mut self, bytes: &[u8]) -> Result<String, PipelineError> {
        let oid = self.repo.blob(bytes)?;
        Ok(oid.to_string())
    }

    #[instrument(skip(self))]
    fn stage(
        &mut self,
        branch: &str,
        op: StageOp,
        path: &str,
        sha: &str,
        mode: FileMode,
    ) -> Result<(), PipelineError> {
        let entries = self.staged.entry(branch.to_string()).or_default();
        match op {
            StageOp::Add => {
                let oid = Oid::from_str(sha)?;
                entries.insert(path.to_string(), (mode, oid));
            }
            StageOp::Remove => {
                entries.remove(path);
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn write_tree(&mut self, branch: &str) -> Result<String, PipelineError> {
        let entries = self.staged.entry(branch.to_string()).or_default().clone();
        let oid = self.build_tree(&entries).map_err(|e| match e {
            PipelineError::Backend(inner) => PipelineError::TreeWrite {
                branch: branch.to_string(),
                detail: inner.to_string(),
            },
            other => other,
        })?;
        Ok(oid.to_string())
    }

    #[instrument(skip(self, author, committer, message))]
    fn commit(
        &mut self,
        tree: &str,
        parents: &[String],
        author: &Identity,
        committer: &Identity,
        timestamp: i64,
        message: &str,
    ) -> Result<String, PipelineError> {
        let tree_oid = Oid::from_str(tree)?;
        let tree = self.repo.find_tree(tree_oid)?;

        let mut parent_commits = Vec::with_capacity(parents.len());
        for parent in parents {
            let oid = Oid::from_str(parent)?;
            parent_commits.push(self.repo.find_commit(oid)?);
        }
        let parent_refs: Vec<&git2::Commit> = parent_commits.iter().collect();

        let time = Time::new(timestamp, 0);
        let author_sig = Signature::new(&author.name, &author.email, &time)?;
        let committer_sig = Signature::new(&committer.name, &committer.email, &time)?;

        let oid = self
            .repo
            .commit(None, &author_sig, &committer_sig, message, &tree, &parent_refs)
            .map_err(|e| PipelineError::CommitWrite(e.to_string()))?;
        Ok(oid.to_string())
    }

    #[instrument(skip(self))]
    fn update_ref(&mut self, refname: &str, sha: &str, prev: Option<&str>) -> Result<(), PipelineError> {
        let oid = Oid::from_str(sha)?;

        if let Some(expected) = prev {
            if let Ok(existing) = self.repo.find_reference(refname) {
                let current = existing.target().map(|o| o.to_string());
                if current.as_deref() != Some(expected) {
                    return Err(PipelineError::RefRace {
                        refname: refname.to_string(),
                        expected: expected.to_string(),
                        found: current.unwrap_or_default(),
                    });
                }
            }
        }

        self.repo
            .reference(refname, oid, true, "svn2git: update ref")
            .map_err(|e| PipelineError::RefUpdate {
                refname: refname.to_string(),
                detail: e.to_string(),
            })?;
        Ok(())
    }
}
