use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};

use flate2::bufread::MultiGzDecoder;
use md5::{Digest as _, Md5};
use sha1::{Digest as _, Sha1};
use tracing::{debug, instrument};

use crate::errors::DumpError;
use crate::model::{CopyFrom, DumpNode, DumpRevision, NodeAction, NodeContent, NodeKind, Revnum};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Streams `(revision, [nodes])` pairs out of one or more logically
/// concatenated dump files. Revision numbers must be non-decreasing across
/// stream boundaries; a duplicate or regressed revision number is fatal.
pub struct DumpDecoder {
    streams: std::vec::IntoIter<Box<dyn BufRead>>,
    current: Option<Box<dyn BufRead>>,
    last_rev: Option<Revnum>,
    verify_data_hash: bool,
    /// Pending revision header read ahead of its node records (the dump
    /// format interleaves a `Revision-number` block with the *following*
    /// revision's nodes, so we must read one block ahead to know where a
    /// revision's node list ends).
    pending_revision: Option<PendingRevision>,
    exhausted: bool,
}

struct PendingRevision {
    rev: Revnum,
    author: Option<String>,
    date: Option<String>,
    log: Option<String>,
}

/// One raw header/content block as read off the stream, before it is
/// classified as a revision header or a node record.
struct Block {
    headers: Vec<(String, String)>,
    content: Vec<u8>,
}

impl DumpDecoder {
    /// Builds a decoder over `readers`, sniffing each for a gzip magic
    /// header and transparently inflating it if present.
    pub fn new(readers: Vec<Box<dyn Read>>, verify_data_hash: bool) -> Result<Self, DumpError> {
        let mut streams = Vec::with_capacity(readers.len());
        for reader in readers {
            streams.push(sniff_stream(reader)?);
        }
        Ok(Self {
            streams: streams.into_iter(),
            current: None,
            last_rev: None,
            verify_data_hash,
            pending_revision: None,
            exhausted: false,
        })
    }

    /// Decodes and returns the next revision, or `None` once every input
    /// stream is exhausted.
    #[instrument(skip(self))]
    pub fn next_revision(&mut self) -> Result<Option<DumpRevision>, DumpError> {
        if self.exhausted {
            return Ok(None);
        }

        let pending = match self.pending_revision.take() {
            Some(p) => p,
            None => match self.read_revision_header()? {
                Some(p) => p,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            },
        };

        let mut nodes = Vec::new();
        loop {
            match self.peek_block()? {
                None => {
                    self.exhausted = true;
                    break;
                }
                Some(block) if block.headers.iter().any(|(k, _)| k == "Revision-number") => {
                    self.pending_revision = Some(block_to_pending_revision(block)?);
                    break;
                }
                Some(block) => {
                    nodes.push(self.block_to_node(block)?);
                }
            }
        }

        debug!(rev = pending.rev, nodes = nodes.len(), "decoded revision");
        Ok(Some(DumpRevision {
            rev: pending.rev,
            author: pending.author,
            date: pending.date,
            log: pending.log,
            nodes,
        }))
    }

    fn read_revision_header(&mut self) -> Result<Option<PendingRevision>, DumpError> {
        match self.peek_block()? {
            None => Ok(None),
            Some(block) => {
                if !block.headers.iter().any(|(k, _)| k == "Revision-number") {
                    return Err(DumpError::MalformedHeader {
                        offset: 0,
                        detail: "expected a Revision-number block".to_string(),
                    });
                }
                Ok(Some(block_to_pending_revision(block)?))
            }
        }
    }

    /// Reads the next raw block from the current (or next) stream, skipping
    /// transparently across stream boundaries. Enforces revision
    /// monotonicity as `Revision-number` blocks are read.
    fn peek_block(&mut self) -> Result<Option<Block>, DumpError> {
        loop {
            if self.current.is_none() {
                match self.streams.next() {
                    Some(s) => self.current = Some(s),
                    None => return Ok(None),
                }
            }
            let stream = self.current.as_mut().unwrap();
            match read_block(stream.as_mut())? {
                Some(block) => {
                    let is_revision = block.headers.iter().any(|(k, _)| k == "Revision-number");
                    let is_node = block.headers.iter().any(|(k, _)| k == "Node-path");
                    if !is_revision && !is_node {
                        // Dump preamble (`SVN-fs-dump-format-version`,
                        // `UUID`) — not surfaced to callers.
                        continue;
                    }
                    if is_revision {
                        let (_, value) = block
                            .headers
                            .iter()
                            .find(|(k, _)| k == "Revision-number")
                            .unwrap();
                        let rev: Revnum = value.parse().map_err(|_| DumpError::MalformedHeader {
                            offset: 0,
                            detail: format!("invalid revision number {value:?}"),
                        })?;
                        if let Some(last) = self.last_rev {
                            if rev == last {
                                return Err(DumpError::DuplicateRevision(rev));
                            }
                            if rev < last {
                                return Err(DumpError::RevisionRegression { last, found: rev });
                            }
                        }
                        self.last_rev = Some(rev);
                    }
                    return Ok(Some(block));
                }
                None => {
                    // Current stream exhausted; advance to the next one.
                    self.current = None;
                    if self.streams.len() == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn block_to_node(&self, block: Block) -> Result<DumpNode, DumpError> {
        let get = |k: &str| block.headers.iter().find(|(hk, _)| hk == k).map(|(_, v)| v.clone());

        let path = get("Node-path").ok_or_else(|| DumpError::MalformedHeader {
            offset: 0,
            detail: "Node-path missing".to_string(),
        })?;
        let kind = match get("Node-kind").as_deref() {
            Some("file") => NodeKind::File,
            Some("dir") => NodeKind::Dir,
            Some(other) => {
                return Err(DumpError::MalformedHeader {
                    offset: 0,
                    detail: format!("unknown Node-kind {other:?}"),
                })
            }
            // A `delete` action legally omits Node-kind.
            None => NodeKind::File,
        };
        let action = match get("Node-action").as_deref() {
            Some("add") => NodeAction::Add,
            Some("delete") => NodeAction::Delete,
            Some("change") => NodeAction::Change,
            Some("replace") => NodeAction::Replace,
            Some(other) => {
                return Err(DumpError::MalformedHeader {
                    offset: 0,
                    detail: format!("unknown Node-action {other:?}"),
                })
            }
            None => {
                return Err(DumpError::MalformedHeader {
                    offset: 0,
                    detail: "Node-action missing".to_string(),
                })
            }
        };

        let copyfrom = match (get("Node-copyfrom-path"), get("Node-copyfrom-rev")) {
            (Some(p), Some(r)) => {
                let rev = r.parse().map_err(|_| DumpError::MalformedHeader {
                    offset: 0,
                    detail: format!("invalid Node-copyfrom-rev {r:?}"),
                })?;
                Some(CopyFrom { path: p, rev })
            }
            _ => None,
        };

        let prop_len: usize = get("Prop-content-length")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| DumpError::MalformedHeader {
                offset: 0,
                detail: "invalid Prop-content-length".to_string(),
            })?
            .unwrap_or(0);
        let text_len: usize = get("Text-content-length")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| DumpError::MalformedHeader {
                offset: 0,
                detail: "invalid Text-content-length".to_string(),
            })?
            .unwrap_or(0);

        if block.content.len() < prop_len + text_len {
            return Err(DumpError::UnexpectedEof {
                context: format!("node content for {path}"),
            });
        }

        let props_present = prop_len > 0;
        let props = if props_present {
            parse_props(&block.content[..prop_len])?
        } else {
            BTreeMap::new()
        };

        let text_bytes = &block.content[prop_len..prop_len + text_len];
        let content_md5 = get("Text-content-md5");
        let content_sha1 = get("Text-content-sha1");

        if self.verify_data_hash {
            if let Some(expected) = &content_md5 {
                let mut hasher = Md5::new();
                hasher.update(text_bytes);
                let computed = hex::encode(hasher.finalize());
                if &computed != expected {
                    return Err(DumpError::HashMismatch {
                        path: path.clone(),
                        rev: 0,
                        expected: expected.clone(),
                        computed,
                    });
                }
            }
            if let Some(expected) = &content_sha1 {
                let mut hasher = Sha1::new();
                hasher.update(text_bytes);
                let computed = hex::encode(hasher.finalize());
                if &computed != expected {
                    return Err(DumpError::HashMismatch {
                        path: path.clone(),
                        rev: 0,
                        expected: expected.clone(),
                        computed,
                    });
                }
            }
        }

        let is_delta = get("Text-delta").as_deref() == Some("true");
        let content = if text_len == 0 && action == NodeAction::Delete {
            NodeContent::None
        } else if is_delta {
            let source = copyfrom.clone().unwrap_or(CopyFrom {
                path: path.clone(),
                rev: 0,
            });
            NodeContent::Delta {
                source,
                delta_bytes: text_bytes.to_vec(),
            }
        } else if text_len > 0 || get("Text-content-length").is_some() {
            NodeContent::Full(text_bytes.to_vec())
        } else {
            NodeContent::None
        };

        Ok(DumpNode {
            path,
            kind,
            action,
            copyfrom,
            props,
            props_present,
            content,
            content_md5,
            content_sha1,
        })
    }
}

fn block_to_pending_revision(block: Block) -> Result<PendingRevision, DumpError> {
    let get = |k: &str| block.headers.iter().find(|(hk, _)| hk == k).map(|(_, v)| v.clone());
    let rev: Revnum = get("Revision-number")
        .ok_or_else(|| DumpError::MalformedHeader {
            offset: 0,
            detail: "Revision-number missing".to_string(),
        })?
        .parse()
        .map_err(|_| DumpError::MalformedHeader {
            offset: 0,
            detail: "invalid Revision-number".to_string(),
        })?;

    let prop_len: usize = get("Prop-content-length")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| DumpError::MalformedHeader {
            offset: 0,
            detail: "invalid Prop-content-length".to_string(),
        })?
        .unwrap_or(0);

    let props = if prop_len > 0 && block.content.len() >= prop_len {
        parse_props(&block.content[..prop_len])?
    } else {
        BTreeMap::new()
    };

    let author = props
        .get("svn:author")
        .map(|b| String::from_utf8_lossy(b).into_owned());
    let date = props
        .get("svn:date")
        .map(|b| String::from_utf8_lossy(b).into_owned());
    let log = props
        .get("svn:log")
        .map(|b| String::from_utf8_lossy(b).into_owned());

    Ok(PendingRevision { rev, author, date, log })
}

/// Parses a property block: repeated `K <len>\n<key>\nV <len>\n<value>\n`
/// pairs terminated by `PROPS-END\n`.
fn parse_props(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, DumpError> {
    let mut props = BTreeMap::new();
    let mut pos = 0;
    loop {
        let line_end = find_newline(bytes, pos)?;
        let line = &bytes[pos..line_end];
        if line == b"PROPS-END" {
            break;
        }
        pos = line_end + 1;

        let line_str = std::str::from_utf8(line).map_err(|_| DumpError::MalformedHeader {
            offset: pos as u64,
            detail: "non-UTF8 property length header".to_string(),
        })?;
        let (tag, len_str) = line_str.split_once(' ').ok_or_else(|| DumpError::MalformedHeader {
            offset: pos as u64,
            detail: format!("malformed property header {line_str:?}"),
        })?;
        let len: usize = len_str.parse().map_err(|_| DumpError::MalformedHeader {
            offset: pos as u64,
            detail: format!("invalid property length {len_str:?}"),
        })?;

        if pos + len > bytes.len() {
            return Err(DumpError::UnexpectedEof {
                context: "property value".to_string(),
            });
        }
        let value = bytes[pos..pos + len].to_vec();
        pos += len + 1; // skip the trailing newline after the value

        if tag == "K" {
            // The key's own `K <len>` line was already consumed above as
            // the "tag" line; `value` here *is* the key text.
            let key = String::from_utf8(value).map_err(|_| DumpError::MalformedHeader {
                offset: pos as u64,
                detail: "non-UTF8 property key".to_string(),
            })?;

            let val_line_end = find_newline(bytes, pos)?;
            let val_line = &bytes[pos..val_line_end];
            let val_line_str =
                std::str::from_utf8(val_line).map_err(|_| DumpError::MalformedHeader {
                    offset: pos as u64,
                    detail: "non-UTF8 property value length header".to_string(),
                })?;
            let (vtag, vlen_str) =
                val_line_str
                    .split_once(' ')
                    .ok_or_else(|| DumpError::MalformedHeader {
                        offset: pos as u64,
                        detail: format!("malformed property value header {val_line_str:?}"),
                    })?;
            if vtag != "V" {
                return Err(DumpError::MalformedHeader {
                    offset: pos as u64,
                    detail: format!("expected V tag, got {vtag:?}"),
                });
            }
            let vlen: usize = vlen_str.parse().map_err(|_| DumpError::MalformedHeader {
                offset: pos as u64,
                detail: format!("invalid property value length {vlen_str:?}"),
            })?;
            pos = val_line_end + 1;
            if pos + vlen > bytes.len() {
                return Err(DumpError::UnexpectedEof {
                    context: "property value".to_string(),
                });
            }
            let val_bytes = bytes[pos..pos + vlen].to_vec();
            pos += vlen + 1;
            props.insert(key, val_bytes);
        } else if tag == "D" {
            // Property deletion marker; nothing to record (the key was
            // already consumed as `value` above).
        } else {
            return Err(DumpError::MalformedHeader {
                offset: pos as u64,
                detail: format!("unexpected property tag {tag:?}"),
            });
        }
    }
    Ok(props)
}

fn find_newline(bytes: &[u8], from: usize) -> Result<usize, DumpError> {
    bytes[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| from + i)
        .ok_or_else(|| DumpError::UnexpectedEof {
            context: "property block line".to_string(),
        })
}

/// Reads one `headers\n\n[content]` block. Returns `None` at clean EOF
/// (no more bytes before the next header line).
fn read_block(stream: &mut dyn BufRead) -> Result<Option<Block>, DumpError> {
    let mut headers = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = stream
            .read_until(b'\n', &mut line)
            .map_err(DumpError::Io)?;
        if n == 0 {
            if headers.is_empty() {
                return Ok(None);
            }
            return Err(DumpError::UnexpectedEof {
                context: "header block".to_string(),
            });
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            if headers.is_empty() {
                // Blank lines between blocks are allowed; keep scanning.
                continue;
            }
            break;
        }
        let line_str = String::from_utf8(line).map_err(|_| DumpError::MalformedHeader {
            offset: 0,
            detail: "non-UTF8 header line".to_string(),
        })?;
        let (key, value) = line_str.split_once(": ").ok_or_else(|| DumpError::MalformedHeader {
            offset: 0,
            detail: format!("header line missing ': ' separator: {line_str:?}"),
        })?;
        headers.push((key.to_string(), value.to_string()));
    }

    let content_len: usize = headers
        .iter()
        .find(|(k, _)| k == "Content-length")
        .map(|(_, v)| v.parse())
        .transpose()
        .map_err(|_| DumpError::MalformedHeader {
            offset: 0,
            detail: "invalid Content-length".to_string(),
        })?
        .unwrap_or(0);

    let mut content = vec![0u8; content_len];
    if content_len > 0 {
        stream.read_exact(&mut content).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DumpError::UnexpectedEof {
                    context: "block content".to_string(),
                }
            } else {
                DumpError::Io(e)
            }
        })?;
    }

    Ok(Some(Block { headers, content }))
}

fn sniff_stream(mut reader: Box<dyn Read>) -> Result<Box<dyn BufRead>, DumpError> {
    let mut magic = [0u8; 2];
    let n = peek_fill(&mut reader, &mut magic)?;
    let chained: Box<dyn Read> = Box::new(std::io::Cursor::new(magic[..n].to_vec()).chain(reader));
    if n == 2 && magic == GZIP_MAGIC {
        debug!("sniffed gzip-compressed dump stream");
        let buffered = BufReader::new(chained);
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(buffered))))
    } else {
        Ok(Box::new(BufReader::new(chained)))
    }
}

/// Fills `buf` from `reader`, returning the number of bytes actually read
/// (may be less than `buf.len()` at EOF).
fn peek_fill(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize, DumpError> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).map_err(DumpError::Io)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_block(
        path: &str,
        kind: &str,
        action: &str,
        props: &[(&str, &str)],
        text: &[u8],
    ) -> Vec<u8> {
        let mut prop_bytes = Vec::new();
        for (k, v) in props {
            prop_bytes.extend(format!("K {}\n{}\nV {}\n{}\n", k.len(), k, v.len(), v).into_bytes());
        }
        prop_bytes.extend(b"PROPS-END\n");

        let mut out = Vec::new();
        out.extend(format!("Node-path: {path}\n").into_bytes());
        out.extend(format!("Node-kind: {kind}\n").into_bytes());
        out.extend(format!("Node-action: {action}\n").into_bytes());
        out.extend(format!("Prop-content-length: {}\n", prop_bytes.len()).into_bytes());
        out.extend(format!("Text-content-length: {}\n", text.len()).into_bytes());
        out.extend(
            format!("Content-length: {}\n", prop_bytes.len() + text.len()).into_bytes(),
        );
        out.extend(b"\n");
        out.extend(&prop_bytes);
        out.extend(text);
        out.extend(b"\n\n");
        out
    }

    fn revision_block(rev: u64, author: &str, log: &str) -> Vec<u8> {
        let props = format!(
            "K 10\nsvn:author\nV {}\n{}\nK 7\nsvn:date\nV 20\n2024-01-01T00:00:00Z\nK 8\nsvn:log\nV {}\n{}\nPROPS-END\n",
            author.len(),
            author,
            log.len(),
            log,
        );
        let mut out = Vec::new();
        out.extend(format!("Revision-number: {rev}\n").into_bytes());
        out.extend(format!("Prop-content-length: {}\n", props.len()).into_bytes());
        out.extend(format!("Content-length: {}\n", props.len()).into_bytes());
        out.extend(b"\n");
        out.extend(props.into_bytes());
        out.extend(b"\n\n");
        out
    }

    fn dump_bytes(blocks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = b"SVN-fs-dump-format-version: 3\n\n".to_vec();
        for b in blocks {
            out.extend(b);
        }
        out
    }

    #[test]
    fn decodes_single_revision_with_one_node() {
        let bytes = dump_bytes(&[
            revision_block(1, "alice", "initial import"),
            node_block("trunk", "dir", "add", &[], b""),
            node_block("trunk/a.txt", "file", "add", &[], b"hello"),
        ]);
        let mut decoder =
            DumpDecoder::new(vec![Box::new(std::io::Cursor::new(bytes))], false).unwrap();
        let rev = decoder.next_revision().unwrap().unwrap();
        assert_eq!(rev.rev, 1);
        assert_eq!(rev.author.as_deref(), Some("alice"));
        assert_eq!(rev.nodes.len(), 2);
        assert_eq!(rev.nodes[1].path, "trunk/a.txt");
        match &rev.nodes[1].content {
            NodeContent::Full(bytes) => assert_eq!(bytes, b"hello"),
            other => panic!("expected full content, got {other:?}"),
        }
        assert!(decoder.next_revision().unwrap().is_none());
    }

    #[test]
    fn decodes_multiple_revisions_in_sequence() {
        let bytes = dump_bytes(&[
            revision_block(1, "alice", "r1"),
            node_block("trunk", "dir", "add", &[], b""),
            revision_block(2, "bob", "r2"),
            node_block("trunk/a.txt", "file", "add", &[], b"x"),
        ]);
        let mut decoder =
            DumpDecoder::new(vec![Box::new(std::io::Cursor::new(bytes))], false).unwrap();
        let r1 = decoder.next_revision().unwrap().unwrap();
        assert_eq!(r1.rev, 1);
        assert_eq!(r1.nodes.len(), 1);
        let r2 = decoder.next_revision().unwrap().unwrap();
        assert_eq!(r2.rev, 2);
        assert_eq!(r2.nodes.len(), 1);
        assert!(decoder.next_revision().unwrap().is_none());
    }

    #[test]
    fn rejects_revision_regression() {
        let bytes = dump_bytes(&[revision_block(5, "a", "x"), revision_block(3, "a", "y")]);
        let mut decoder =
            DumpDecoder::new(vec![Box::new(std::io::Cursor::new(bytes))], false).unwrap();
        decoder.next_revision().unwrap();
        let err = decoder.next_revision().unwrap_err();
        assert!(matches!(err, DumpError::RevisionRegression { .. }));
    }

    #[test]
    fn rejects_duplicate_revision() {
        let bytes = dump_bytes(&[revision_block(5, "a", "x"), revision_block(5, "a", "y")]);
        let mut decoder =
            DumpDecoder::new(vec![Box::new(std::io::Cursor::new(bytes))], false).unwrap();
        decoder.next_revision().unwrap();
        let err = decoder.next_revision().unwrap_err();
        assert!(matches!(err, DumpError::DuplicateRevision(5)));
    }

    #[test]
    fn parses_copyfrom_node() {
        let mut block = Vec::new();
        block.extend(b"Node-path: branches/feat\n");
        block.extend(b"Node-kind: dir\n");
        block.extend(b"Node-action: add\n");
        block.extend(b"Node-copyfrom-rev: 4\n");
        block.extend(b"Node-copyfrom-path: trunk\n");
        block.extend(b"\n\n");

        let bytes = dump_bytes(&[revision_block(5, "a", "branch"), block]);
        let mut decoder =
            DumpDecoder::new(vec![Box::new(std::io::Cursor::new(bytes))], false).unwrap();
        let rev = decoder.next_revision().unwrap().unwrap();
        let copyfrom = rev.nodes[0].copyfrom.as_ref().unwrap();
        assert_eq!(copyfrom.path, "trunk");
        assert_eq!(copyfrom.rev, 4);
    }

    #[test]
    fn hash_mismatch_detected_when_verification_enabled() {
        let mut block = node_block("trunk/a.txt", "file", "add", &[], b"hello");
        // Splice in a deliberately wrong md5 header before Content-length.
        let marker = b"Text-content-length: 5\n";
        let pos = block
            .windows(marker.len())
            .position(|w| w == marker)
            .unwrap()
            + marker.len();
        block.splice(pos..pos, *b"Text-content-md5: 00000000000000000000000000000000\n");

        let bytes = dump_bytes(&[revision_block(1, "a", "x"), block]);
        let mut decoder =
            DumpDecoder::new(vec![Box::new(std::io::Cursor::new(bytes))], true).unwrap();
        let err = decoder.next_revision().unwrap_err();
        assert!(matches!(err, DumpError::HashMismatch { .. }));
    }

    #[test]
    fn monotonic_across_stream_boundaries() {
        let first = dump_bytes(&[revision_block(1, "a", "x")]);
        let second = b"Revision-number: 2\nProp-content-length: 10\nContent-length: 10\n\nPROPS-END\n\n\n".to_vec();
        let mut decoder = DumpDecoder::new(
            vec![Box::new(std::io::Cursor::new(first)), Box::new(std::io::Cursor::new(second))],
            false,
        )
        .unwrap();
        assert_eq!(decoder.next_revision().unwrap().unwrap().rev, 1);
        assert_eq!(decoder.next_revision().unwrap().unwrap().rev, 2);
    }
}
