//! Typed representation of the XML configuration schema, parsed directly
//! off a `roxmltree::Document` with no intermediate serde layer — the
//! schema is attribute-heavy and order-sensitive (rule declaration order
//! matters for resolution), which roxmltree's DOM walk suits better than a
//! derive-based deserializer.

use roxmltree::Node;

use crate::errors::ConfigError;

/// Parses the set of boolean spellings the XML schema accepts:
/// `{1,Yes,yes,True,true,0,No,no,False,false}`.
pub fn parse_bool(value: &str, attr: &str, element: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "Yes" | "yes" | "True" | "true" => Ok(true),
        "0" | "No" | "no" | "False" | "false" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            field: format!("{element}.{attr}"),
            detail: format!("{other:?} is not a recognized boolean"),
        }),
    }
}

fn attr<'a>(node: &'a Node, name: &str) -> Option<&'a str> {
    node.attribute(name)
}

fn attr_bool(node: &Node, name: &str, default: bool, element: &str) -> Result<bool, ConfigError> {
    match attr(node, name) {
        Some(v) => parse_bool(v, name, element),
        None => Ok(default),
    }
}

/// A single `<MapPath>` or `<UnmapPath>` rule.
#[derive(Debug, Clone)]
pub struct PathRule {
    pub pattern: String,
    pub refname_template: Option<String>,
    pub block_parent: bool,
    pub add_tree_prefix: bool,
    pub recreate_merges: bool,
    pub is_tag: bool,
}

/// `<EditMsg>`: a message-rewrite rule, matched against the commit message
/// (or a revision filter — `match_pattern` is a glob against the raw SVN
/// log text).
#[derive(Debug, Clone)]
pub struct EditMsgRule {
    pub match_pattern: String,
    pub replacement: String,
    pub is_final: bool,
}

/// `<Chmod>`: forces the executable bit on matching paths.
#[derive(Debug, Clone)]
pub struct ChmodRule {
    pub pattern: String,
    pub executable: bool,
}

/// `<MapRef>`: remaps an already-resolved refname.
#[derive(Debug, Clone)]
pub struct MapRefRule {
    pub from_pattern: String,
    pub to_template: String,
}

/// `<Replace>`: a character substitution applied to the final refname.
#[derive(Debug, Clone)]
pub struct ReplaceRule {
    pub from: String,
    pub to: String,
}

/// `<InjectFile>`: adds a file with literal content at every commit on the
/// matching branch.
#[derive(Debug, Clone)]
pub struct InjectFileRule {
    pub path: String,
    pub content_path: String,
}

/// `<AddFile>` / `<DeletePath>`: one-shot tree edits applied at a specific
/// revision. `doc_order` is a position counter shared between the two rule
/// kinds, assigned at parse time, so a later resolution pass can tell which
/// of two same-path/same-revision rules was declared later in the document
/// even though they end up in separate lists.
#[derive(Debug, Clone)]
pub struct AddFileRule {
    pub rev: Option<u64>,
    pub path: String,
    pub content_path: String,
    pub doc_order: usize,
}

#[derive(Debug, Clone)]
pub struct DeletePathRule {
    pub rev: Option<u64>,
    pub path: String,
    pub doc_order: usize,
}

/// `<SkipCommit Revs="...">`: revisions whose commit is suppressed, with
/// its message prepended to the next emitted commit on the same branch.
#[derive(Debug, Clone)]
pub struct SkipCommitRule {
    pub revs: Vec<u64>,
}

/// A `<Default>` or `<Project>` rule bundle. `<Default>` is represented as
/// a `Project` with `name == None`.
#[derive(Debug, Clone, Default)]
pub struct Project {
    pub name: Option<String>,
    pub explicit_only: bool,
    pub needs_projects: Vec<String>,
    pub inherit_default_mappings: bool,
    pub inherit_mergeinfo: bool,

    pub map_paths: Vec<PathRule>,
    pub unmap_paths: Vec<PathRule>,
    pub edit_msgs: Vec<EditMsgRule>,
    pub ignore_files: Vec<String>,
    pub chmods: Vec<ChmodRule>,
    pub map_refs: Vec<MapRefRule>,
    pub replaces: Vec<ReplaceRule>,
    pub inject_files: Vec<InjectFileRule>,
    pub add_files: Vec<AddFileRule>,
    pub delete_paths: Vec<DeletePathRule>,
    pub empty_dir_placeholder: Option<String>,
    pub skip_commits: Vec<SkipCommitRule>,
}

impl Project {
    fn with_defaults() -> Self {
        Self {
            inherit_default_mappings: true,
            inherit_mergeinfo: true,
            ..Default::default()
        }
    }
}

/// The whole parsed document: a `<Default>` bundle plus zero or more
/// `<Project>` bundles.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    pub default: Project,
    pub projects: Vec<Project>,
    pub variables: Vec<(String, String)>,
}

pub fn parse_document(xml: &str) -> Result<ConfigDocument, ConfigError> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| ConfigError::XmlSyntax(e.to_string()))?;
    let root = doc.root_element();

    let mut document = ConfigDocument {
        default: Project::with_defaults(),
        projects: Vec::new(),
        variables: Vec::new(),
    };

    // Shared across every <Project>/<Default> bundle so `<AddFile>`/
    // `<DeletePath>` document order is comparable across the whole document,
    // not just within one bundle.
    let mut doc_order = 0usize;

    for child in root.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "Variable" => {
                let name = attr(&child, "Name").ok_or_else(|| ConfigError::MissingAttribute {
                    element: "Variable".into(),
                    attr: "Name".into(),
                })?;
                let value = attr(&child, "Value").unwrap_or("");
                document.variables.push((name.to_string(), value.to_string()));
            }
            "Default" => {
                document.default = parse_project_body(&child, None, &mut doc_order)?;
            }
            "Project" => {
                let name = attr(&child, "name").map(str::to_string);
                document.projects.push(parse_project_body(&child, name, &mut doc_order)?);
            }
            other => return Err(ConfigError::UnknownElement(other.to_string())),
        }
    }

    Ok(document)
}

fn parse_project_body(
    node: &Node,
    name: Option<String>,
    doc_order: &mut usize,
) -> Result<Project, ConfigError> {
    let element = name.clone().unwrap_or_else(|| "Default".to_string());
    let mut project = Project::with_defaults();
    project.name = name;
    project.explicit_only = attr_bool(node, "ExplicitOnly", false, &element)?;
    project.inherit_default_mappings = attr_bool(node, "InheritDefaultMappings", true, &element)?;
    project.inherit_mergeinfo = attr_bool(node, "InheritMergeinfo", true, &element)?;
    if let Some(needs) = attr(node, "NeedsProjects") {
        project.needs_projects = needs.split(',').map(|s| s.trim().to_string()).collect();
    }

    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "MapPath" => project.map_paths.push(parse_path_rule(&child, false)?),
            "UnmapPath" => project.unmap_paths.push(parse_path_rule(&child, true)?),
            "EditMsg" => project.edit_msgs.push(parse_edit_msg(&child)?),
            "IgnoreFiles" => {
                let pattern = attr(&child, "Pattern").ok_or_else(|| ConfigError::MissingAttribute {
                    element: "IgnoreFiles".into(),
                    attr: "Pattern".into(),
                })?;
                project.ignore_files.push(pattern.to_string());
            }
            "Chmod" => project.chmods.push(parse_chmod(&child)?),
            "MapRef" => project.map_refs.push(parse_map_ref(&child)?),
            "Replace" => project.replaces.push(parse_replace(&child)?),
            "InjectFile" => project.inject_files.push(parse_inject_file(&child)?),
            "AddFile" => {
                project.add_files.push(parse_add_file(&child, *doc_order)?);
                *doc_order += 1;
            }
            "DeletePath" => {
                project.delete_paths.push(parse_delete_path(&child, *doc_order)?);
                *doc_order += 1;
            }
            "EmptyDirPlaceholder" => {
                project.empty_dir_placeholder = attr(&child, "Name").map(str::to_string);
            }
            "SkipCommit" => project.skip_commits.push(parse_skip_commit(&child)?),
            other => return Err(ConfigError::UnknownElement(other.to_string())),
        }
    }

    Ok(project)
}

fn parse_path_rule(node: &Node, is_unmap: bool) -> Result<PathRule, ConfigError> {
    let element = if is_unmap { "UnmapPath" } else { "MapPath" };
    let pattern = attr(node, "Path").ok_or_else(|| ConfigError::MissingAttribute {
        element: element.into(),
        attr: "Path".into(),
    })?;
    Ok(PathRule {
        pattern: pattern.to_string(),
        refname_template: attr(node, "Refname").map(str::to_string),
        block_parent: attr_bool(node, "BlockParent", true, element)?,
        add_tree_prefix: attr_bool(node, "AddTreePrefix", false, element)?,
        recreate_merges: attr_bool(node, "RecreateMerges", true, element)?,
        is_tag: attr_bool(node, "Tag", false, element)?,
    })
}

fn parse_edit_msg(node: &Node) -> Result<EditMsgRule, ConfigError> {
    let match_pattern = attr(node, "Match").unwrap_or("**").to_string();
    let replacement = node.text().unwrap_or("").to_string();
    Ok(EditMsgRule {
        match_pattern,
        replacement,
        is_final: attr_bool(node, "Final", false, "EditMsg")?,
    })
}

fn parse_chmod(node: &Node) -> Result<ChmodRule, ConfigError> {
    let pattern = attr(node, "Path").ok_or_else(|| ConfigError::MissingAttribute {
        element: "Chmod".into(),
        attr: "Path".into(),
    })?;
    Ok(ChmodRule {
        pattern: pattern.to_string(),
        executable: attr_bool(node, "Executable", true, "Chmod")?,
    })
}

fn parse_map_ref(node: &Node) -> Result<MapRefRule, ConfigError> {
    let from = attr(node, "From").ok_or_else(|| ConfigError::MissingAttribute {
        element: "MapRef".into(),
        attr: "From".into(),
    })?;
    let to = attr(node, "To").ok_or_else(|| ConfigError::MissingAttribute {
        element: "MapRef".into(),
        attr: "To".into(),
    })?;
    Ok(MapRefRule {
        from_pattern: from.to_string(),
        to_template: to.to_string(),
    })
}

fn parse_replace(node: &Node) -> Result<ReplaceRule, ConfigError> {
    let from = attr(node, "From").ok_or_else(|| ConfigError::MissingAttribute {
        element: "Replace".into(),
        attr: "From".into(),
    })?;
    let to = attr(node, "To").unwrap_or("_");
    Ok(ReplaceRule {
        from: from.to_string(),
        to: to.to_string(),
    })
}

fn parse_inject_file(node: &Node) -> Result<InjectFileRule, ConfigError> {
    let path = attr(node, "Path").ok_or_else(|| ConfigError::MissingAttribute {
        element: "InjectFile".into(),
        attr: "Path".into(),
    })?;
    let content_path = attr(node, "Content").ok_or_else(|| ConfigError::MissingAttribute {
        element: "InjectFile".into(),
        attr: "Content".into(),
    })?;
    Ok(InjectFileRule {
        path: path.to_string(),
        content_path: content_path.to_string(),
    })
}

fn parse_add_file(node: &Node, doc_order: usize) -> Result<AddFileRule, ConfigError> {
    let path = attr(node, "Path").ok_or_else(|| ConfigError::MissingAttribute {
        element: "AddFile".into(),
        attr: "Path".into(),
    })?;
    let content_path = attr(node, "Content").ok_or_else(|| ConfigError::MissingAttribute {
        element: "AddFile".into(),
        attr: "Content".into(),
    })?;
    let rev = parse_opt_u64(node, "Rev", "AddFile")?;
    Ok(AddFileRule {
        rev,
        path: path.to_string(),
        content_path: content_path.to_string(),
        doc_order,
    })
}

fn parse_delete_path(node: &Node, doc_order: usize) -> Result<DeletePathRule, ConfigError> {
    let path = attr(node, "Path").ok_or_else(|| ConfigError::MissingAttribute {
        element: "DeletePath".into(),
        attr: "Path".into(),
    })?;
    let rev = parse_opt_u64(node, "Rev", "DeletePath")?;
    Ok(DeletePathRule {
        rev,
        path: path.to_string(),
        doc_order,
    })
}

fn parse_skip_commit(node: &Node) -> Result<SkipCommitRule, ConfigError> {
    let revs = attr(node, "Revs").ok_or_else(|| ConfigError::MissingAttribute {
        element: "SkipCommit".into(),
        attr: "Revs".into(),
    })?;
    let mut parsed = Vec::new();
    for part in revs.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        parsed.push(part.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
            field: "SkipCommit.Revs".into(),
            detail: format!("{part:?} is not a valid revision number"),
        })?);
    }
    Ok(SkipCommitRule { revs: parsed })
}

fn parse_opt_u64(node: &Node, attr_name: &str, element: &str) -> Result<Option<u64>, ConfigError> {
    match attr(node, attr_name) {
        Some(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: format!("{element}.{attr_name}"),
                detail: format!("{v:?} is not a valid revision number"),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_boolean_spellings() {
        for v in ["1", "Yes", "yes", "True", "true"] {
            assert!(parse_bool(v, "x", "Y").unwrap());
        }
        for v in ["0", "No", "no", "False", "false"] {
            assert!(!parse_bool(v, "x", "Y").unwrap());
        }
        assert!(parse_bool("maybe", "x", "Y").is_err());
    }

    #[test]
    fn parses_minimal_document() {
        let xml = r#"
            <Config>
              <Default>
                <MapPath Path="trunk" Refname="refs/heads/main"/>
              </Default>
              <Project name="proj1" ExplicitOnly="Yes">
                <MapPath Path="branches/*" Refname="refs/heads/$1"/>
              </Project>
            </Config>
        "#;
        let doc = parse_document(xml).unwrap();
        assert_eq!(doc.default.map_paths.len(), 1);
        assert_eq!(doc.projects.len(), 1);
        assert_eq!(doc.projects[0].name.as_deref(), Some("proj1"));
        assert!(doc.projects[0].explicit_only);
    }

    #[test]
    fn rejects_unknown_element() {
        let xml = r#"<Config><Bogus/></Config>"#;
        let err = parse_document(xml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownElement(_)));
    }

    #[test]
    fn skip_commit_parses_rev_list() {
        let xml = r#"
            <Config>
              <Default>
                <SkipCommit Revs="42, 43"/>
              </Default>
            </Config>
        "#;
        let doc = parse_document(xml).unwrap();
        assert_eq!(doc.default.skip_commits[0].revs, vec![42, 43]);
    }
}
