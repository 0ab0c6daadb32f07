//! Top-level config loading: XML document parse, variable resolution, and
//! rule-set resolution, bundled behind one `ConvertConfig::load`.

pub mod rules;
pub mod schema;

use crate::errors::ConfigError;
use crate::glob::VariableTable;
use rules::RuleSet;
use schema::{parse_document, ConfigDocument};

/// A fully loaded, validated configuration ready to drive a conversion run.
pub struct ConvertConfig {
    pub document: ConfigDocument,
    pub variables: VariableTable,
    pub rules: RuleSet,
}

impl ConvertConfig {
    /// Parses `xml`, resolves `<Variable>` definitions, selects
    /// `active_projects`, and builds the effective rule set — variables are
    /// substituted recursively at load time, not deferred to match time.
    pub fn load(xml: &str, active_projects: &[String]) -> Result<Self, ConfigError> {
        let document = parse_document(xml)?;

        let mut variables = VariableTable::new();
        for (name, value) in &document.variables {
            variables.set(name.clone(), value.clone());
        }
        // Force eager resolution of every variable now, so a cycle or an
        // undefined reference surfaces at load time rather than mid-run.
        for (name, _) in &document.variables {
            variables.resolve(&format!("${{{name}}}"))?;
        }

        let document = substitute_document(document, &variables)?;
        let rules = RuleSet::resolve(&document, active_projects)?;

        Ok(Self {
            document,
            variables,
            rules,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for needed in &self.rules.skip_commits {
            if needed.revs.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "SkipCommit".to_string(),
                    detail: "no revisions listed".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Walks every pattern/template string in the parsed document and resolves
/// `$name`/`${name}`/`$(name)` references against `variables`.
fn substitute_document(
    mut document: ConfigDocument,
    variables: &VariableTable,
) -> Result<ConfigDocument, ConfigError> {
    substitute_project(&mut document.default, variables)?;
    for project in &mut document.projects {
        substitute_project(project, variables)?;
    }
    Ok(document)
}

fn substitute_project(
    project: &mut schema::Project,
    variables: &VariableTable,
) -> Result<(), ConfigError> {
    for rule in project
        .map_paths
        .iter_mut()
        .chain(project.unmap_paths.iter_mut())
    {
        rule.pattern = variables.resolve_for_glob(&rule.pattern)?;
        if let Some(template) = &rule.refname_template {
            rule.refname_template = Some(variables.resolve(template)?);
        }
    }
    for rule in &mut project.ignore_files {
        *rule = variables.resolve_for_glob(rule)?;
    }
    for rule in &mut project.map_refs {
        rule.from_pattern = variables.resolve_for_glob(&rule.from_pattern)?;
        rule.to_template = variables.resolve(&rule.to_template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_document() {
        let cfg = ConvertConfig::load(
            r#"<Config><Default><MapPath Path="trunk" Refname="refs/heads/main"/></Default></Config>"#,
            &[],
        )
        .unwrap();
        assert_eq!(cfg.rules.map_paths.len(), 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn variable_is_substituted_into_pattern() {
        let cfg = ConvertConfig::load(
            r#"<Config>
                <Variable Name="proj" Value="Proj1"/>
                <Default><MapPath Path="$proj/trunk" Refname="refs/heads/main"/></Default>
            </Config>"#,
            &[],
        )
        .unwrap();
        assert_eq!(cfg.rules.map_paths[0].pattern, "Proj1/trunk");
    }

    #[test]
    fn undefined_variable_is_rejected() {
        let err = ConvertConfig::load(
            r#"<Config><Default><MapPath Path="$missing/trunk" Refname="refs/heads/main"/></Default></Config>"#,
            &[],
        );
        assert!(err.is_err());
    }
}
