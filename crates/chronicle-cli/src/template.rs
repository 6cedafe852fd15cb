//! Pipeline templates
//!
//! A pipeline file holds either a single pipeline description or a catalog of
//! named templates:
//!
//! ```yaml
//! templates:
//!   claims_history:
//!     policy: type2
//!     natural_key_fields:
//!       - claim_id
//!     sequence_fields:
//!       - ${sequence_field:-modified_at}
//!       - created_at
//!     exclude_fields:
//!       - ${rescued_column}
//! ```
//!
//! `${name}` and `${name:-default}` placeholders are resolved from explicit
//! parameters first, then the process environment, then the inline default.
//! A placeholder with no value anywhere is an error.

use anyhow::{anyhow, bail, Context, Result};
use chronicle::config::DEFAULT_PIPELINE_NAME;
use chronicle::PipelineDescription;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

/// Pre-compiled regex for parameter expansion
/// Pattern: ${NAME} or ${NAME:-default}
static PARAM_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("param regex pattern is invalid - this is a bug")
});

/// Key that marks a file as a template catalog.
const TEMPLATES_KEY: &str = "templates";

/// Explicit template parameters.
#[derive(Debug, Clone)]
pub struct TemplateParams {
    values: BTreeMap<String, String>,
    use_env: bool,
}

impl TemplateParams {
    /// Parameters backed by the process environment.
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            use_env: true,
        }
    }

    /// Parse `name=value` arguments.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut params = Self::new();
        for arg in args {
            let (name, value) = arg
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid parameter '{}': expected name=value", arg))?;
            if name.is_empty() {
                bail!("Invalid parameter '{}': empty name", arg);
            }
            params.values.insert(name.to_string(), value.to_string());
        }
        Ok(params)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Ignore the process environment.
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned().or_else(|| {
            self.use_env
                .then(|| std::env::var(name).ok())
                .flatten()
        })
    }
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace every placeholder in `content`.
pub fn expand_params(content: &str, params: &TemplateParams) -> Result<String> {
    let mut missing = Vec::new();
    let expanded = PARAM_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let name = &caps[1];
            match params
                .lookup(name)
                .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
            {
                Some(value) => value,
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            }
        })
        .to_string();

    if !missing.is_empty() {
        missing.dedup();
        bail!("Unresolved template parameters: {}", missing.join(", "));
    }
    Ok(expanded)
}

/// Load, expand and validate a pipeline description.
///
/// `template` selects an entry of a catalog file; it may be omitted when the
/// catalog has exactly one entry.
pub fn load_pipeline(
    path: &Path,
    template: Option<&str>,
    params: &TemplateParams,
) -> Result<PipelineDescription> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
    let expanded = expand_params(&content, params)?;
    let document: serde_yaml::Value = serde_yaml::from_str(&expanded)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let is_catalog = document
        .as_mapping()
        .is_some_and(|m| m.contains_key(TEMPLATES_KEY));

    let description = if is_catalog {
        select_template(document, template)?
    } else {
        if let Some(name) = template {
            bail!(
                "{} holds a single pipeline, cannot select template '{}'",
                path.display(),
                name
            );
        }
        serde_yaml::from_value(document).context("Invalid pipeline description")?
    };

    description.validate()?;
    info!(
        "Loaded {} pipeline '{}' from {}",
        description.policy,
        description.name,
        path.display()
    );
    Ok(description)
}

fn select_template(document: serde_yaml::Value, template: Option<&str>) -> Result<PipelineDescription> {
    #[derive(serde::Deserialize)]
    struct Catalog {
        templates: BTreeMap<String, serde_yaml::Value>,
    }

    let mut catalog: Catalog =
        serde_yaml::from_value(document).context("Invalid template catalog")?;
    let available = || catalog_names(&catalog.templates);

    let name = match template {
        Some(name) => name.to_string(),
        None if catalog.templates.len() == 1 => catalog
            .templates
            .keys()
            .next()
            .cloned()
            .unwrap_or_default(),
        None => bail!(
            "Catalog has {} templates, choose one with --template ({})",
            catalog.templates.len(),
            available()
        ),
    };

    let available = available();
    let value = catalog
        .templates
        .remove(&name)
        .ok_or_else(|| anyhow!("Unknown template '{}' (available: {})", name, available))?;

    let mut description: PipelineDescription = serde_yaml::from_value(value)
        .with_context(|| format!("Invalid template '{}'", name))?;
    if description.name == DEFAULT_PIPELINE_NAME {
        debug!("Naming pipeline after template '{}'", name);
        description.name = name;
    }
    Ok(description)
}

fn catalog_names(templates: &BTreeMap<String, serde_yaml::Value>) -> String {
    templates.keys().cloned().collect::<Vec<_>>().join(", ")
}
