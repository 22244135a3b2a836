//! Control descriptor assembly.
//!
//! The template is copied verbatim and the generated fields are appended after
//! it. Parsers of the control format take the last value of a repeated key, so
//! a generated field always wins over a template field of the same name.

use eyre::Result;
use tracing::*;

use crate::fs::{exists, set_mode};
use crate::util::config::{BuildParameters, DATA_MODE};
use crate::util::BuildError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    template: String,
    pub template_fields: Vec<(String, String)>,
    pub generated_fields: Vec<(String, String)>,
}

impl ControlDescriptor {
    pub fn new(template: String, params: &BuildParameters) -> Self {
        let template_fields = parse_fields(&template);
        ControlDescriptor {
            template,
            template_fields,
            generated_fields: vec![
                ("Package".into(), params.package_name.clone()),
                ("Version".into(), params.version.clone()),
            ],
        }
    }

    /// Generated keys that the template already sets.
    pub fn collisions(&self) -> Vec<&str> {
        self.generated_fields
            .iter()
            .filter(|(key, _)| {
                self.template_fields
                    .iter()
                    .any(|(existing, _)| existing.eq_ignore_ascii_case(key))
            })
            .map(|(key, _)| key.as_str())
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = self.template.clone();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        for (key, value) in &self.generated_fields {
            out.push_str(&format!("{key}: {value}\n"));
        }
        out
    }
}

/// `Key: value` fields in order of appearance. Continuation lines and
/// comments are skipped.
pub fn parse_fields(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter(|line| !line.starts_with([' ', '\t', '#']))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// The value a control parser would read for `key`: the last one.
pub fn field_value(text: &str, key: &str) -> Option<String> {
    parse_fields(text)
        .into_iter()
        .rev()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Render the template plus generated fields into the staging tree's
/// metadata directory.
pub async fn assemble(params: &BuildParameters) -> Result<ControlDescriptor> {
    let template_path = &params.sources.control_template;
    if !exists(template_path).await {
        return Err(BuildError::MissingSource {
            path: template_path.clone(),
        }
        .into());
    }

    let template = tokio::fs::read_to_string(template_path)
        .await
        .map_err(BuildError::fs(template_path))?;
    let descriptor = ControlDescriptor::new(template, params);
    for key in descriptor.collisions() {
        warn!("control template already sets `{key}`, the generated value overrides it");
    }

    let dest = params.control_path();
    debug!("writing control descriptor to {dest:?}");
    tokio::fs::write(&dest, descriptor.render())
        .await
        .map_err(BuildError::fs(&dest))?;
    set_mode(&dest, DATA_MODE).await?;

    Ok(descriptor)
}
