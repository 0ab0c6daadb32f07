//! Error types for every subsystem, unified behind [`ConvertError`].
//!
//! Each subsystem has its own error type derived with `thiserror`; a
//! top-level [`ConvertError`] enum unifies them all for callers that want a
//! single error type. No manual `From<ConvertError> for anyhow::Error` impl
//! is needed — thiserror's `std::error::Error` impl gives us that for free
//! via anyhow's blanket conversion.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type returned by the conversion pipeline.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Dump(#[from] DumpError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    RefMap(#[from] RefMapError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Dump decoder
// ---------------------------------------------------------------------------

/// Errors raised while decoding the SVN dump stream.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("malformed header at byte offset {offset}: {detail}")]
    MalformedHeader { offset: u64, detail: String },

    #[error("unexpected end of input while reading {context}")]
    UnexpectedEof { context: String },

    #[error("revision {found} arrived after revision {last}, which is not monotonic")]
    RevisionRegression { last: u64, found: u64 },

    #[error("duplicate revision number {0}")]
    DuplicateRevision(u64),

    #[error("content hash mismatch for {path} at r{rev}: expected {expected}, computed {computed}")]
    HashMismatch {
        path: String,
        rev: u64,
        expected: String,
        computed: String,
    },

    #[error("unsupported dump format version {0}")]
    UnsupportedVersion(u32),

    #[error("I/O error reading dump stream: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Delta applier
// ---------------------------------------------------------------------------

/// Errors raised while applying an svndiff0 delta window stream.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("bad svndiff magic bytes: {0:?}")]
    BadMagic([u8; 4]),

    #[error("unexpected end of delta stream while reading {context}")]
    UnexpectedEof { context: String },

    #[error("instruction references source offset {offset} but source view length is {view_len}")]
    OffsetOutOfRange { offset: u64, view_len: u64 },

    #[error("window produced {produced} target bytes, expected {expected}")]
    TargetLengthMismatch { expected: u64, produced: u64 },

    #[error("truncated window: declared {declared} instruction bytes, {available} available")]
    TruncatedWindow { declared: u64, available: u64 },

    #[error("invalid instruction opcode {0}")]
    InvalidOpcode(u8),
}

// ---------------------------------------------------------------------------
// Path tree
// ---------------------------------------------------------------------------

/// Errors raised by the persistent copy-on-write path tree.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("cannot add {0}: parent directory does not exist")]
    ParentMissing(String),

    #[error("cannot add {0}: path already exists")]
    AlreadyExists(String),

    #[error("cannot change {0}: kind mismatch (file vs directory)")]
    KindMismatch(String),

    #[error("path component {0:?} is invalid (empty or contains '/')")]
    InvalidComponent(String),

    #[error("copy source {src_path} does not exist at r{src_rev}")]
    CopySourceMissing { src_path: String, src_rev: u64 },

    #[error("revision {0} has not been closed yet")]
    RevisionNotClosed(u64),

    #[error(transparent)]
    Delta(#[from] DeltaError),
}

// ---------------------------------------------------------------------------
// Config engine
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating the XML configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config XML: {0}")]
    XmlSyntax(String),

    #[error("invalid value for {field}: {detail}")]
    InvalidValue { field: String, detail: String },

    #[error("unknown element <{0}>")]
    UnknownElement(String),

    #[error("missing required attribute {attr} on <{element}>")]
    MissingAttribute { element: String, attr: String },

    #[error("invalid glob pattern {pattern:?}: {detail}")]
    GlobSyntax { pattern: String, detail: String },

    #[error("variable {0:?} participates in a substitution cycle")]
    VariableCycle(String),

    #[error("undefined variable {0:?}")]
    UndefinedVariable(String),

    #[error("project {project:?} requires project {needs:?}, which is not active")]
    MissingDependency { project: String, needs: String },

    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Ref mapper
// ---------------------------------------------------------------------------

/// Errors raised while resolving an SVN path to a Git ref.
#[derive(Debug, Error)]
pub enum RefMapError {
    #[error("refname {0:?} is empty after template substitution")]
    EmptyRefname(String),

    #[error("refname {0:?} is not a valid Git reference")]
    InvalidRefname(String),

    #[error("refname {new:?} is a path-prefix of existing ref {existing:?}")]
    PrefixCollision { new: String, existing: String },

    #[error("capture index ${0} referenced in template but not present in match")]
    MissingCapture(usize),
}

// ---------------------------------------------------------------------------
// History builder
// ---------------------------------------------------------------------------

/// Errors raised while synthesizing commits from a revision's change-set.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("branch {0:?} has no recorded tip to serve as a commit parent")]
    NoParentTip(String),

    #[error("copyfrom source {src_path:?} at r{src_rev} does not resolve to any branch")]
    UnresolvedCopySource { src_path: String, src_rev: u64 },

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    RefMap(#[from] RefMapError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}

// ---------------------------------------------------------------------------
// Merge reconstructor
// ---------------------------------------------------------------------------

/// Errors raised while reconstructing merge edges from mergeinfo deltas.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("malformed svn:mergeinfo value: {0:?}")]
    MalformedMergeinfo(String),

    #[error("merge source {0:?} does not resolve to a known branch")]
    UnresolvedSource(String),

    #[error("revision range {start}-{end} is invalid (start > end)")]
    InvalidRange { start: u64, end: u64 },
}

// ---------------------------------------------------------------------------
// Object pipeline
// ---------------------------------------------------------------------------

/// Errors raised by the Git object pipeline sink.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to write blob: {0}")]
    BlobWrite(String),

    #[error("failed to write tree for branch {branch:?}: {detail}")]
    TreeWrite { branch: String, detail: String },

    #[error("failed to create commit: {0}")]
    CommitWrite(String),

    #[error("failed to update ref {refname:?}: {detail}")]
    RefUpdate { refname: String, detail: String },

    #[error("ref update race on {refname:?}: expected {expected:?}, found {found:?}")]
    RefRace {
        refname: String,
        expected: String,
        found: String,
    },

    #[error("git backend error: {0}")]
    Backend(#[from] git2::Error),

    #[error("worker channel closed unexpectedly")]
    ChannelClosed,
}
