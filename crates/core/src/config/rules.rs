//! Rule resolution: merges a `<Default>` bundle with zero or more active
//! `<Project>` bundles into ordered lookup lists, honoring the precedence
//! inversion the schema requires — mapping rules go project-then-default,
//! post-processing filters go default-then-project.

use crate::config::schema::{
    AddFileRule, ChmodRule, ConfigDocument, DeletePathRule, EditMsgRule, InjectFileRule,
    MapRefRule, PathRule, Project, ReplaceRule, SkipCommitRule,
};
use crate::errors::ConfigError;
use crate::glob::Glob;

/// A fully resolved rule set: every list is already in its correct
/// resolution order, so callers just walk front-to-back and take the first
/// hit.
pub struct RuleSet {
    /// Map/unmap rules in "first-match-wins, user rules first" order:
    /// active projects (in declaration order) then `<Default>`, then
    /// (conceptually) built-ins, which the ref mapper supplies itself.
    pub map_paths: Vec<PathRule>,
    pub unmap_paths: Vec<PathRule>,
    pub inherit_default_mappings: bool,

    /// Post-processing filters, in "defaults first" order per spec: the
    /// inversion is deliberate — defaults are meant to be overridable
    /// per-project, so project rules get the final say when multiple
    /// match, which for a first-match-wins list means defaults go first.
    pub edit_msgs: Vec<EditMsgRule>,
    pub ignore_files: Vec<Glob>,
    pub chmods: Vec<ChmodRule>,
    pub map_refs: Vec<MapRefRule>,
    pub replaces: Vec<ReplaceRule>,

    pub inject_files: Vec<InjectFileRule>,
    pub add_files: Vec<AddFileRule>,
    pub delete_paths: Vec<DeletePathRule>,
    pub skip_commits: Vec<SkipCommitRule>,
    pub empty_dir_placeholder: Option<String>,
    pub inherit_mergeinfo: bool,
}

impl RuleSet {
    /// Builds the effective rule set for a run selecting `active_projects`
    /// (by name, via `--project`). Validates `NeedsProjects` dependencies.
    pub fn resolve(doc: &ConfigDocument, active_projects: &[String]) -> Result<Self, ConfigError> {
        let mut selected: Vec<&Project> = Vec::new();
        for project in &doc.projects {
            let is_explicit_only = project.explicit_only;
            let is_selected = project
                .name
                .as_deref()
                .map(|n| active_projects.iter().any(|a| a == n))
                .unwrap_or(false);
            if is_selected || !is_explicit_only {
                selected.push(project);
            }
        }

        for project in &selected {
            for needed in &project.needs_projects {
                let needed_active = selected
                    .iter()
                    .any(|p| p.name.as_deref() == Some(needed.as_str()));
                if !needed_active {
                    return Err(ConfigError::MissingDependency {
                        project: project.name.clone().unwrap_or_default(),
                        needs: needed.clone(),
                    });
                }
            }
        }

        // Mapping rules: project rules (declaration order across selected
        // projects) first, then Default.
        let mut map_paths = Vec::new();
        let mut unmap_paths = Vec::new();
        for project in &selected {
            map_paths.extend(project.map_paths.iter().cloned());
            unmap_paths.extend(project.unmap_paths.iter().cloned());
        }
        map_paths.extend(doc.default.map_paths.iter().cloned());
        unmap_paths.extend(doc.default.unmap_paths.iter().cloned());

        // Post-processing filters: Default first, then project rules.
        let mut edit_msgs = doc.default.edit_msgs.clone();
        let mut ignore_file_patterns = doc.default.ignore_files.clone();
        let mut chmods = doc.default.chmods.clone();
        let mut map_refs = doc.default.map_refs.clone();
        let mut replaces = doc.default.replaces.clone();
        for project in &selected {
            edit_msgs.extend(project.edit_msgs.iter().cloned());
            ignore_file_patterns.extend(project.ignore_files.iter().cloned());
            chmods.extend(project.chmods.iter().cloned());
            map_refs.extend(project.map_refs.iter().cloned());
            replaces.extend(project.replaces.iter().cloned());
        }

        let mut ignore_files = Vec::with_capacity(ignore_file_patterns.len());
        for pattern in &ignore_file_patterns {
            ignore_files.push(Glob::compile(pattern)?);
        }

        let mut inject_files = Vec::new();
        let mut add_files = Vec::new();
        let mut delete_paths = Vec::new();
        let mut skip_commits = Vec::new();
        let mut empty_dir_placeholder = doc.default.empty_dir_placeholder.clone();
        for project in &selected {
            inject_files.extend(project.inject_files.iter().cloned());
            add_files.extend(project.add_files.iter().cloned());
            delete_paths.extend(project.delete_paths.iter().cloned());
            skip_commits.extend(project.skip_commits.iter().cloned());
            if project.empty_dir_placeholder.is_some() {
                empty_dir_placeholder = project.empty_dir_placeholder.clone();
            }
        }
        inject_files.extend(doc.default.inject_files.iter().cloned());
        add_files.extend(doc.default.add_files.iter().cloned());
        delete_paths.extend(doc.default.delete_paths.iter().cloned());
        skip_commits.extend(doc.default.skip_commits.iter().cloned());

        let inherit_default_mappings = selected
            .first()
            .map(|p| p.inherit_default_mappings)
            .unwrap_or(doc.default.inherit_default_mappings);
        let inherit_mergeinfo = selected
            .first()
            .map(|p| p.inherit_mergeinfo)
            .unwrap_or(doc.default.inherit_mergeinfo);

        Ok(Self {
            map_paths,
            unmap_paths,
            inherit_default_mappings,
            edit_msgs,
            ignore_files,
            chmods,
            map_refs,
            replaces,
            inject_files,
            add_files,
            delete_paths,
            skip_commits,
            empty_dir_placeholder,
            inherit_mergeinfo,
        })
    }

    /// Applies `<DeletePath>` vs `<AddFile>` at the same revision: when both
    /// target the same path at the same revision, whichever rule was
    /// declared later in document order wins (tie-break is document order,
    /// not revision). With only one of the two present, that one applies
    /// unconditionally (a lone `<DeletePath>` still deletes).
    pub fn delete_wins(&self, rev: u64, path: &str) -> bool {
        let last_add = self
            .add_files
            .iter()
            .filter(|r| r.rev == Some(rev) && r.path == path)
            .map(|r| r.doc_order)
            .max();
        let last_delete = self
            .delete_paths
            .iter()
            .filter(|r| r.rev == Some(rev) && r.path == path)
            .map(|r| r.doc_order)
            .max();
        match (last_add, last_delete) {
            (Some(add), Some(delete)) => delete > add,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::parse_document;

    fn doc_with_project() -> ConfigDocument {
        parse_document(
            r#"
            <Config>
              <Default>
                <MapPath Path="trunk" Refname="refs/heads/main"/>
                <IgnoreFiles Pattern="*.o"/>
              </Default>
              <Project name="libA">
                <MapPath Path="branches/*" Refname="refs/heads/$1"/>
                <IgnoreFiles Pattern="*.bak"/>
              </Project>
            </Config>
            "#,
        )
        .unwrap()
    }

    #[test]
    fn project_map_paths_precede_default() {
        let doc = doc_with_project();
        let rules = RuleSet::resolve(&doc, &["libA".to_string()]).unwrap();
        assert_eq!(rules.map_paths[0].pattern, "branches/*");
        assert_eq!(rules.map_paths[1].pattern, "trunk");
    }

    #[test]
    fn ignore_files_default_precedes_project() {
        let doc = doc_with_project();
        let rules = RuleSet::resolve(&doc, &["libA".to_string()]).unwrap();
        assert!(rules.ignore_files[0].matches_fully("a.o"));
        assert!(rules.ignore_files[1].matches_fully("a.bak"));
    }

    #[test]
    fn explicit_only_project_is_inert_unless_selected() {
        let doc = parse_document(
            r#"
            <Config>
              <Default/>
              <Project name="special" ExplicitOnly="Yes">
                <MapPath Path="x" Refname="refs/heads/x"/>
              </Project>
            </Config>
            "#,
        )
        .unwrap();
        let rules = RuleSet::resolve(&doc, &[]).unwrap();
        assert!(rules.map_paths.is_empty());

        let rules_selected = RuleSet::resolve(&doc, &["special".to_string()]).unwrap();
        assert_eq!(rules_selected.map_paths.len(), 1);
    }

    #[test]
    fn needs_projects_enforced() {
        let doc = parse_document(
            r#"
            <Config>
              <Default/>
              <Project name="a" NeedsProjects="b"/>
              <Project name="b"/>
            </Config>
            "#,
        )
        .unwrap();
        let err = RuleSet::resolve(&doc, &["a".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDependency { .. }));

        assert!(RuleSet::resolve(&doc, &["a".to_string(), "b".to_string()]).is_ok());
    }

    #[test]
    fn add_file_after_delete_path_in_document_order_wins() {
        let doc = parse_document(
            r#"
            <Config>
              <Default>
                <DeletePath Path="trunk/a.txt" Rev="5"/>
                <AddFile Path="trunk/a.txt" Content="/tmp/a.txt" Rev="5"/>
              </Default>
            </Config>
            "#,
        )
        .unwrap();
        let rules = RuleSet::resolve(&doc, &[]).unwrap();
        assert!(!rules.delete_wins(5, "trunk/a.txt"));
    }

    #[test]
    fn delete_path_after_add_file_in_document_order_wins() {
        let doc = parse_document(
            r#"
            <Config>
              <Default>
                <AddFile Path="trunk/a.txt" Content="/tmp/a.txt" Rev="5"/>
                <DeletePath Path="trunk/a.txt" Rev="5"/>
              </Default>
            </Config>
            "#,
        )
        .unwrap();
        let rules = RuleSet::resolve(&doc, &[]).unwrap();
        assert!(rules.delete_wins(5, "trunk/a.txt"));
    }

    #[test]
    fn lone_delete_path_applies_unconditionally() {
        let doc = parse_document(
            r#"
            <Config>
              <Default>
                <DeletePath Path="trunk/a.txt" Rev="5"/>
              </Default>
            </Config>
            "#,
        )
        .unwrap();
        let rules = RuleSet::resolve(&doc, &[]).unwrap();
        assert!(rules.delete_wins(5, "trunk/a.txt"));
    }
}
