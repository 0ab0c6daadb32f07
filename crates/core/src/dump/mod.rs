//! Streaming SVN dump-file decoder (format v2/v3).
//!
//! A dump is a sequence of header blocks (`Key: Value` lines terminated by a
//! blank line) optionally followed by a content block whose length is given
//! by one of the `*-content-length` headers. The decoder reads one revision
//! at a time — buffering all of that revision's node records — so callers
//! get a lazy sequence of `(revision-header, [node-records])` pairs without
//! holding the whole dump in memory at once.

mod decoder;

pub use decoder::DumpDecoder;
