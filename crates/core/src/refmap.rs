//! Path -> ref resolution: turns an SVN directory path into `Unmapped`,
//! `Blocked`, or a concrete `Mapped` refname, with collision avoidance.
//!
//! Collision handling is incremental rather than two-pass (the history
//! builder discovers branches as revisions stream in, it cannot see the
//! whole branch set up front the way a history-then-emit design could), so
//! `__<n>` suffixing is applied deterministically in the order branches are
//! first claimed, so the same conversion run always assigns the same
//! disambiguated refname to the same branch.

use std::collections::BTreeMap;

use tracing::{debug, instrument, warn};

use crate::config::rules::RuleSet;
use crate::errors::RefMapError;
use crate::glob::Glob;

/// Outcome of resolving an SVN path against the active rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Unmapped,
    Blocked,
    Mapped(MappedRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRef {
    pub refname: String,
    pub tree_prefix: Option<String>,
    pub recreate_merges: bool,
    pub is_tag: bool,
}

pub struct RefMapper<'a> {
    rules: &'a RuleSet,
    map_globs: Vec<Glob>,
    unmap_globs: Vec<Glob>,
    /// Parent directories implicitly blocked by a `<Path Path="foo/*">`
    /// rule with `BlockParent` enabled (the default).
    implicit_blocked_parents: Vec<String>,
    /// refname -> the SVN path that first claimed it, in claim order.
    claimed: BTreeMap<String, String>,
    claim_order: Vec<String>,
}

impl<'a> RefMapper<'a> {
    pub fn new(rules: &'a RuleSet) -> Result<Self, RefMapError> {
        let map_globs = rules
            .map_paths
            .iter()
            .map(|r| Glob::compile(&r.pattern))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RefMapError::InvalidRefname("map path pattern".to_string()))?;
        let unmap_globs = rules
            .unmap_paths
            .iter()
            .map(|r| Glob::compile(&r.pattern))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RefMapError::InvalidRefname("unmap path pattern".to_string()))?;

        let mut implicit_blocked_parents = Vec::new();
        for rule in &rules.map_paths {
            if rule.block_parent {
                if let Some(parent) = rule.pattern.strip_suffix("/*") {
                    implicit_blocked_parents.push(parent.to_string());
                }
            }
        }

        Ok(Self {
            rules,
            map_globs,
            unmap_globs,
            implicit_blocked_parents,
            claimed: BTreeMap::new(),
            claim_order: Vec::new(),
        })
    }

    /// Resolves `path` (no `refs/` involved yet, a bare SVN repository
    /// path) to its mapping outcome.
    #[instrument(skip(self))]
    pub fn resolve(&mut self, path: &str) -> Result<Resolution, RefMapError> {
        for glob in &self.unmap_globs {
            if glob.matches_fully(path) {
                debug!(path, "blocked by explicit UnmapPath");
                return Ok(Resolution::Blocked);
            }
        }

        let map_hit = self
            .map_globs
            .iter()
            .zip(self.rules.map_paths.iter())
            .find_map(|(glob, rule)| glob.match_path(path).map(|m| (rule, m)));

        if map_hit.is_none() && self.implicit_blocked_parents.iter().any(|p| p == path) {
            debug!(path, "blocked by implicit parent-block rule");
            return Ok(Resolution::Blocked);
        }

        let (rule, m) = match map_hit {
            Some(hit) => hit,
            None => return Ok(Resolution::Unmapped),
        };
        if !m.residual.is_empty() {
            // The path is *inside* a mapped directory, not the directory
            // itself; the branch root owns the whole subtree, so this is
            // still a hit against the same branch, but the ref mapper is
            // only ever asked about branch-root-candidate paths by the
            // history builder — a non-empty residual here means the
            // caller passed a path below a branch root.
            return Ok(Resolution::Unmapped);
        }

        let template = rule
            .refname_template
            .clone()
            .unwrap_or_else(|| format!("refs/heads/{path}"));
        let mut refname = substitute_captures(&template, &m.captures)?;

        for map_ref in &self.rules.map_refs {
            if let Ok(g) = Glob::compile(&map_ref.from_pattern) {
                if let Some(mm) = g.match_path(&refname) {
                    if mm.residual.is_empty() {
                        refname = substitute_captures(&map_ref.to_template, &mm.captures)?;
                        break;
                    }
                }
            }
        }

        for replace in &self.rules.replaces {
            refname = refname.replace(&replace.from, &replace.to);
        }

        if !refname.starts_with("refs/") {
            refname = format!("refs/heads/{refname}");
        }
        if refname.trim_end_matches("refs/").is_empty() || refname == "refs/" {
            return Err(RefMapError::EmptyRefname(path.to_string()));
        }

        let refname = self.deconflict(refname, path);

        Ok(Resolution::Mapped(MappedRef {
            refname,
            tree_prefix: rule.add_tree_prefix.then(|| path.to_string()),
            recreate_merges: rule.recreate_merges,
            is_tag: rule.is_tag,
        }))
    }

    /// Applies `__<n>` suffixing, both for exact-name collisions (a
    /// different SVN path already claimed this refname) and for Git's
    /// prefix-collision rule (no ref may be a path-prefix of another).
    fn deconflict(&mut self, base: String, svn_path: &str) -> String {
        if let Some(existing) = self.claimed.get(&base) {
            if existing == svn_path {
                return base;
            }
        }

        let mut candidate = base.clone();
        let mut n = 2;
        loop {
            let exact_collision = self
                .claimed
                .get(&candidate)
                .is_some_and(|owner| owner != svn_path);
            let prefix_collision = self.claim_order.iter().any(|existing| {
                existing != &candidate
                    && (is_ref_prefix(existing, &candidate) || is_ref_prefix(&candidate, existing))
            });
            if !exact_collision && !prefix_collision {
                break;
            }
            if candidate != base {
                warn!(base = %base, candidate = %candidate, "refname collision, applying suffix");
            }
            candidate = format!("{base}__{n}");
            n += 1;
        }

        if !self.claimed.contains_key(&candidate) {
            self.claimed.insert(candidate.clone(), svn_path.to_string());
            self.claim_order.push(candidate.clone());
        }
        candidate
    }
}

fn is_ref_prefix(candidate: &str, other: &str) -> bool {
    match other.strip_prefix(candidate) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Substitutes `$1..$n` positional references in `template` with `captures`.
fn substitute_captures(template: &str, captures: &[String]) -> Result<String, RefMapError> {
    let mut out = String::new();
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit() {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            let idx: usize = chars[i + 1..j].iter().collect::<String>().parse().unwrap();
            if idx == 0 || idx > captures.len() {
                return Err(RefMapError::MissingCapture(idx));
            }
            out.push_str(&captures[idx - 1]);
            i = j;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::parse_document;

    fn rules_from(xml: &str) -> RuleSet {
        let doc = parse_document(xml).unwrap();
        RuleSet::resolve(&doc, &[]).unwrap()
    }

    #[test]
    fn trunk_maps_to_main() {
        let rules = rules_from(
            r#"<Config><Default><MapPath Path="trunk" Refname="refs/heads/main"/></Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        let res = mapper.resolve("trunk").unwrap();
        assert_eq!(
            res,
            Resolution::Mapped(MappedRef {
                refname: "refs/heads/main".to_string(),
                tree_prefix: None,
                recreate_merges: true,
                is_tag: false,
            })
        );
    }

    #[test]
    fn user_branch_path_example() {
        let rules = rules_from(
            r#"<Config><Default><MapPath Path="Proj1/users/branches/*" Refname="refs/heads/Proj1/users/$1"/></Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        let res = mapper.resolve("Proj1/users/branches/alice").unwrap();
        match res {
            Resolution::Mapped(m) => assert_eq!(m.refname, "refs/heads/Proj1/users/alice"),
            other => panic!("expected mapped, got {other:?}"),
        }
    }

    #[test]
    fn implicit_parent_block() {
        let rules = rules_from(
            r#"<Config><Default><MapPath Path="branches/*" Refname="refs/heads/$1"/></Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        assert_eq!(mapper.resolve("branches").unwrap(), Resolution::Blocked);
        assert!(matches!(
            mapper.resolve("branches/feat").unwrap(),
            Resolution::Mapped(_)
        ));
    }

    #[test]
    fn block_parent_no_disables_implicit_block() {
        let rules = rules_from(
            r#"<Config><Default><MapPath Path="branches/*" Refname="refs/heads/$1" BlockParent="No"/></Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        assert_eq!(mapper.resolve("branches").unwrap(), Resolution::Unmapped);
    }

    #[test]
    fn explicit_unmap_blocks() {
        let rules = rules_from(
            r#"<Config><Default>
                <MapPath Path="*" Refname="refs/heads/$1"/>
                <UnmapPath Path="wip"/>
            </Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        assert_eq!(mapper.resolve("wip").unwrap(), Resolution::Blocked);
        assert!(matches!(mapper.resolve("trunk").unwrap(), Resolution::Mapped(_)));
    }

    #[test]
    fn collision_gets_suffixed() {
        let rules = rules_from(
            r#"<Config><Default><MapPath Path="*" Refname="refs/heads/main"/></Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        let first = mapper.resolve("trunk").unwrap();
        let second = mapper.resolve("branches").unwrap();
        let (Resolution::Mapped(a), Resolution::Mapped(b)) = (first, second) else {
            panic!("expected both mapped")
        };
        assert_eq!(a.refname, "refs/heads/main");
        assert_eq!(b.refname, "refs/heads/main__2");
    }

    #[test]
    fn same_path_resolved_twice_keeps_same_name() {
        let rules = rules_from(
            r#"<Config><Default><MapPath Path="trunk" Refname="refs/heads/main"/></Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        let a = mapper.resolve("trunk").unwrap();
        let b = mapper.resolve("trunk").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn character_replace_example() {
        let rules = rules_from(
            r#"<Config><Default>
                <MapPath Path="*" Refname="refs/heads/$1"/>
                <Replace From=" " To="_"/>
                <Replace From=":" To="."/>
            </Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        let res = mapper.resolve("feat x:1").unwrap();
        match res {
            Resolution::Mapped(m) => assert_eq!(m.refname, "refs/heads/feat_x.1"),
            other => panic!("expected mapped, got {other:?}"),
        }
    }

    #[test]
    fn prefix_collision_is_suffixed() {
        let rules = rules_from(
            r#"<Config><Default>
                <MapPath Path="a" Refname="refs/heads/shared"/>
                <MapPath Path="b" Refname="refs/heads/shared/child"/>
            </Default></Config>"#,
        );
        let mut mapper = RefMapper::new(&rules).unwrap();
        let first = mapper.resolve("a").unwrap();
        let second = mapper.resolve("b").unwrap();
        let Resolution::Mapped(a) = first else { panic!() };
        let Resolution::Mapped(b) = second else { panic!() };
        assert_eq!(a.refname, "refs/heads/shared");
        assert_ne!(b.refname, "refs/heads/shared/child");
    }
}
