//! Content transforms applied to a blob before hashing.
//!
//! A capability interface, same shape as the object-store sink: a sum of
//! operations rather than an inheritance hierarchy. The crate ships a
//! keyword expander and a no-op passthrough; a C-source indent reformatter
//! is out of scope but can be supplied by a caller as another
//! `ContentTransformer` impl.

use std::collections::BTreeMap;

/// Applies a transformation to file content before it is hashed into the
/// object store.
pub trait ContentTransformer: Send + Sync {
    fn transform(&self, path: &str, props: &BTreeMap<String, Vec<u8>>, content: &[u8]) -> Vec<u8>;
}

/// Leaves content untouched.
pub struct Passthrough;

impl ContentTransformer for Passthrough {
    fn transform(&self, _path: &str, _props: &BTreeMap<String, Vec<u8>>, content: &[u8]) -> Vec<u8> {
        content.to_vec()
    }
}

/// Expands `$Keyword$` and `$Keyword: ...$` markers the way SVN's
/// `svn:keywords` property does, for `Id`, `Revision`, `Date`, `Author`,
/// `HeadURL`, `LastChangedBy`, `LastChangedDate`, `LastChangedRevision`.
/// Only active when the file's `svn:keywords` property names the keyword.
pub struct KeywordExpander {
    pub revision: u64,
    pub date: String,
    pub author: String,
    pub url: String,
}

impl ContentTransformer for KeywordExpander {
    fn transform(&self, path: &str, props: &BTreeMap<String, Vec<u8>>, content: &[u8]) -> Vec<u8> {
        let Some(raw) = props.get("svn:keywords") else {
            return content.to_vec();
        };
        let Ok(spec) = std::str::from_utf8(raw) else {
            return content.to_vec();
        };
        let enabled: std::collections::HashSet<&str> = spec.split_whitespace().collect();
        let Ok(text) = std::str::from_utf8(content) else {
            return content.to_vec();
        };
        expand_keywords(text, path, &enabled, self).into_bytes()
    }
}

fn expand_keywords(
    text: &str,
    path: &str,
    enabled: &std::collections::HashSet<&str>,
    ctx: &KeywordExpander,
) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == '$' {
            if let Some(end) = find_keyword_close(&bytes, i + 1) {
                let inner: String = bytes[i + 1..end].iter().collect();
                let name = inner.split(':').next().unwrap_or("");
                if let Some(value) = keyword_value(name, path, ctx) {
                    if enabled.contains(name) || enabled.contains("Id") && name == "Id" {
                        out.push('$');
                        out.push_str(name);
                        out.push_str(": ");
                        out.push_str(&value);
                        out.push_str(" $");
                        i = end + 1;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn find_keyword_close(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start;
    while j < chars.len() {
        match chars[j] {
            '$' => return Some(j),
            c if c.is_whitespace() => return None,
            _ => j += 1,
        }
    }
    None
}

fn keyword_value(name: &str, path: &str, ctx: &KeywordExpander) -> Option<String> {
    match name {
        "Id" => Some(format!(
            "{} {} {} {}",
            path.rsplit('/').next().unwrap_or(path),
            ctx.revision,
            ctx.date,
            ctx.author
        )),
        "Revision" | "LastChangedRevision" => Some(ctx.revision.to_string()),
        "Date" | "LastChangedDate" => Some(ctx.date.clone()),
        "Author" | "LastChangedBy" => Some(ctx.author.clone()),
        "HeadURL" => Some(format!("{}/{}", ctx.url.trim_end_matches('/'), path)),
        _ => None,
    }
}
