//! The four-stage async Git object-writing pipeline: blob hashing, tree
//! staging, commit creation, and ref updates.
//!
//! Grounded on the teacher's `git/client.rs` (`GitClient` wrapping
//! `git2::Repository`, including the documented pattern of not holding a
//! `git2::Repository` reference across an `.await` point since it isn't
//! `Send`) and `sync_engine.rs`'s `Arc<tokio::sync::Mutex<GitClient>>`
//! shape for sharing one repository handle across concurrent tasks. The
//! object-store sink is a capability interface (a sum of operations), so
//! an in-process `git2` backend and a hypothetical
//! subprocess-`git` backend can both implement [`GitSink`] without an
//! inheritance hierarchy.

pub mod git_sink;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use sha1::{Digest, Sha1};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::authors::Identity;
use crate::errors::PipelineError;
use crate::sha1cache::{CacheKey, Sha1Cache};
use crate::transform::ContentTransformer;

/// Default number of concurrent blob-hashing workers.
pub const DEFAULT_BLOB_WORKERS: usize = 8;

/// Git file mode, as recorded in a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Blob,
    BlobExecutable,
    Symlink,
    Tree,
}

impl FileMode {
    pub fn git_mode(self) -> i32 {
        match self {
            FileMode::Blob => 0o100644,
            FileMode::BlobExecutable => 0o100755,
            FileMode::Symlink => 0o120000,
            FileMode::Tree => 0o040000,
        }
    }
}

/// A staged change to a branch's worktree, queued for the next `write-tree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOp {
    Add,
    Remove,
}

/// Abstract object-store sink: `hash-object` / `stage` / `write-tree` /
/// `commit` / `update-ref`. The reference backend
/// ([`git_sink::Git2Sink`]) spawns no subprocess; an alternate backend
/// that shells out to `git` would implement the same trait.
pub trait GitSink: Send {
    fn hash_object(&mut self, bytes: &[u8]) -> Result<String, PipelineError>;
    fn stage(
        &mut self,
        branch: &str,
        op: StageOp,
        path: &str,
        sha: &str,
        mode: FileMode,
    ) -> Result<(), PipelineError>;
    fn write_tree(&mut self, branch: &str) -> Result<String, PipelineError>;
    fn commit(
        &mut self,
        tree: &str,
        parents: &[String],
        author: &Identity,
        committer: &Identity,
        timestamp: i64,
        message: &str,
    ) -> Result<String, PipelineError>;
    fn update_ref(
        &mut self,
        refname: &str,
        sha: &str,
        prev: Option<&str>,
    ) -> Result<(), PipelineError>;
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Per-branch FIFO serialization: stage/tree writes for one branch never
/// race each other, but different branches proceed concurrently.
#[derive(Default)]
struct BranchLocks {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BranchLocks {
    fn get(&self, branch: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(branch.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Buffers log lines per revision and releases them only once every lower
/// revision has already been released, so the sequenced log output stays
/// monotonic in revision number even though commit production across
/// branches is not ordered.
pub struct RevisionLogSequencer {
    next_to_flush: StdMutex<u64>,
    pending: StdMutex<BTreeMap<u64, Vec<String>>>,
}

impl RevisionLogSequencer {
    pub fn new(start_rev: u64) -> Self {
        Self {
            next_to_flush: StdMutex::new(start_rev),
            pending: StdMutex::new(BTreeMap::new()),
        }
    }

    /// Records a log line for `rev` and returns every line now eligible to
    /// flush (this revision and any already-buffered later ones that are
    /// now contiguous with it).
    pub fn record(&self, rev: u64, line: String) -> Vec<String> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.entry(rev).or_default().push(line);
        drop(pending);
        self.drain_ready()
    }

    /// Marks `rev` as complete even if it produced no log lines, so later
    /// buffered revisions aren't stuck waiting on an empty one forever.
    pub fn mark_complete(&self, rev: u64) -> Vec<String> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.entry(rev).or_default();
        drop(pending);
        self.drain_ready()
    }

    fn drain_ready(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut next = self.next_to_flush.lock().unwrap_or_else(|p| p.into_inner());
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match pending.remove(next.as_ref() as &u64) {
                Some(lines) => {
                    out.extend(lines);
                    *next += 1;
                }
                None => break,
            }
        }
        out
    }
}

/// The object pipeline: owns the sink, the blob memo table, the optional
/// persistent SHA1 cache, and per-branch serialization for staging/tree
/// writes and commit creation.
pub struct ObjectPipeline<S: GitSink> {
    sink: Arc<AsyncMutex<S>>,
    blob_memo: StdMutex<HashMap<String, String>>,
    sha1_cache: Option<Arc<Sha1Cache>>,
    transformer: Arc<dyn ContentTransformer>,
    blob_semaphore: Arc<Semaphore>,
    branch_locks: BranchLocks,
    tree_write_lock: AsyncMutex<()>,
    gitattributes_tree: String,
}

impl<S: GitSink> ObjectPipeline<S> {
    pub fn new(sink: S, transformer: Arc<dyn ContentTransformer>) -> Self {
        Self::with_workers(sink, transformer, DEFAULT_BLOB_WORKERS)
    }

    pub fn with_workers(sink: S, transformer: Arc<dyn ContentTransformer>, workers: usize) -> Self {
        Self {
            sink: Arc::new(AsyncMutex::new(sink)),
            blob_memo: StdMutex::new(HashMap::new()),
            sha1_cache: None,
            transformer,
            blob_semaphore: Arc::new(Semaphore::new(workers.max(1))),
            branch_locks: BranchLocks::default(),
            tree_write_lock: AsyncMutex::new(()),
            gitattributes_tree: String::new(),
        }
    }

    pub fn with_sha1_cache(mut self, cache: Arc<Sha1Cache>) -> Self {
        self.sha1_cache = Some(cache);
        self
    }

    /// Blob stage: transforms, hashes and stages one file's content on one
    /// branch. Memoized by raw content hash — identical bytes never pay
    /// for a second transform+hash. Bounded to [`DEFAULT_BLOB_WORKERS`]
    /// concurrent callers via a semaphore.
    #[instrument(skip(self, content, props))]
    pub async fn stage_blob(
        &self,
        branch: &str,
        path: &str,
        props: &BTreeMap<String, Vec<u8>>,
        content: &[u8],
        mode: FileMode,
        format_spec_hash: &str,
    ) -> Result<String, PipelineError> {
        let _permit = self
            .blob_semaphore
            .acquire()
            .await
            .map_err(|_| PipelineError::ChannelClosed)?;

        let source_hash = sha1_hex(content);

        if let Some(cache) = &self.sha1_cache {
            let key = CacheKey {
                gitattributes_tree: self.gitattributes_tree.clone(),
                file_path: path.to_string(),
                source_hash: source_hash.clone(),
                format_spec_hash: format_spec_hash.to_string(),
            };
            if let Some(sha) = cache.get(&key) {
                debug!(path, "blob sha served from sha1-map cache");
                self.do_stage(branch, path, &sha, mode).await?;
                return Ok(sha);
            }
        }

        if let Some(sha) = self.blob_memo.lock().unwrap_or_else(|p| p.into_inner()).get(&source_hash).cloned() {
            self.do_stage(branch, path, &sha, mode).await?;
            return Ok(sha);
        }

        let transformed = self.transformer.transform(path, props, content);
        let sha = {
            let mut sink = self.sink.lock().await;
            sink.hash_object(&transformed)?
        };

        self.blob_memo
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(source_hash.clone(), sha.clone());

        if let Some(cache) = &self.sha1_cache {
            cache.insert(
                CacheKey {
                    gitattributes_tree: self.gitattributes_tree.clone(),
                    file_path: path.to_string(),
                    source_hash,
                    format_spec_hash: format_spec_hash.to_string(),
                },
                sha.clone(),
            );
        }

        self.do_stage(branch, path, &sha, mode).await?;
        Ok(sha)
    }

    async fn do_stage(&self, branch: &str, path: &str, sha: &str, mode: FileMode) -> Result<(), PipelineError> {
        let lock = self.branch_locks.get(branch);
        let _guard = lock.lock().await;
        let mut sink = self.sink.lock().await;
        sink.stage(branch, StageOp::Add, path, sha, mode)
    }

    pub async fn remove_path(&self, branch: &str, path: &str) -> Result<(), PipelineError> {
        let lock = self.branch_locks.get(branch);
        let _guard = lock.lock().await;
        let mut sink = self.sink.lock().await;
        sink.stage(branch, StageOp::Remove, path, "", FileMode::Blob)
    }

    /// Tree stage: per-branch serialized (the `_branch_guard` held for the
    /// duration), but the actual write is additionally funneled through a
    /// single global lock so two branches never race writing the *same*
    /// tree object concurrently.
    #[instrument(skip(self))]
    pub async fn write_tree(&self, branch: &str) -> Result<String, PipelineError> {
        let branch_lock = self.branch_locks.get(branch);
        let _branch_guard = branch_lock.lock().await;
        let _global_guard = self.tree_write_lock.lock().await;
        let mut sink = self.sink.lock().await;
        sink.write_tree(branch)
    }

    /// Commit stage: per-branch serialized, parallel across branches.
    #[instrument(skip(self, author, committer, message))]
    pub async fn commit(
        &self,
        branch: &str,
        tree: &str,
        parents: &[String],
        author: &Identity,
        committer: &Identity,
        timestamp: i64,
        message: &str,
    ) -> Result<String, PipelineError> {
        let lock = self.branch_locks.get(branch);
        let _guard = lock.lock().await;
        let mut sink = self.sink.lock().await;
        sink.commit(tree, parents, author, committer, timestamp, message)
    }

    /// Ref stage: only ever called after every commit it references is
    /// known (its SHA bound), and after the "all prior commits complete"
    /// barrier the caller is responsible for awaiting.
    #[instrument(skip(self))]
    pub async fn update_ref(&self, refname: &str, sha: &str, prev: Option<&str>) -> Result<(), PipelineError> {
        let mut sink = self.sink.lock().await;
        let result = sink.update_ref(refname, sha, prev);
        if let Err(e) = &result {
            warn!(refname, error = %e, "ref update failed");
        } else {
            info!(refname, sha, "ref updated");
        }
        result
    }

    pub fn blob_memo_len(&self) -> usize {
        self.blob_memo.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
