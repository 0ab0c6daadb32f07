//! `svn2git-core`: the SVN-dump-to-Git-object-graph conversion engine.
//!
//! Four tightly coupled subsystems do the hard work — the dump decoder and
//! delta applier (turning a dump stream into bytes), the persistent
//! copy-on-write path tree (SVN's directory state at every revision), the
//! ref mapper and history builder (path/branch attribution and commit
//! synthesis), and the merge reconstructor (deriving Git parent edges from
//! `svn:mergeinfo`). A fifth module, the object pipeline, drives these
//! against an abstract Git object-store sink.

pub mod authors;
pub mod config;
pub mod delta;
pub mod dump;
pub mod errors;
pub mod glob;
pub mod history;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod refmap;
pub mod sha1cache;
pub mod transform;
pub mod tree;

pub use config::ConvertConfig;
pub use errors::ConvertError;
pub use history::HistoryBuilder;
pub use pipeline::git_sink::Git2Sink;
pub use tree::PathTree;
