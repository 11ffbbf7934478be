use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static TAG_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{image(?:\.([^{}]+))?\}").unwrap());

static HOOK_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// A parsed `tag_tmpl` value such as `1.17.0-alpine_{image.alpine}`.
///
/// `{image}` expands to the definition's own key and `{image.<dep>}` to the
/// resolved tag of `<dep>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTemplate {
    raw: String,
    references: Vec<String>,
}

impl TagTemplate {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Err("template is empty".to_string());
        }

        let mut references = Vec::new();
        for caps in TAG_PLACEHOLDER.captures_iter(raw) {
            if let Some(dep) = caps.get(1) {
                let dep = dep.as_str().trim();
                if dep.is_empty() {
                    return Err("empty image reference in template".to_string());
                }
                if !references.iter().any(|r| r == dep) {
                    references.push(dep.to_string());
                }
            }
        }

        let leftover = TAG_PLACEHOLDER.replace_all(raw, "");
        if leftover.contains('{') || leftover.contains('}') {
            return Err(format!(
                "unsupported placeholder in '{}' (expected {{image}} or {{image.<name>}})",
                raw
            ));
        }

        Ok(Self {
            raw: raw.to_string(),
            references,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of the images referenced through `{image.<name>}`, in order of appearance.
    pub fn references(&self) -> &[String] {
        &self.references
    }

    /// Expand the template, asking `lookup` for the tag of every referenced image.
    pub fn render<F>(&self, own_key: &str, mut lookup: F) -> Result<String, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut missing = None;
        let rendered = TAG_PLACEHOLDER.replace_all(&self.raw, |caps: &Captures| {
            match caps.get(1) {
                None => own_key.to_string(),
                Some(dep) => {
                    let dep = dep.as_str().trim();
                    lookup(dep).unwrap_or_else(|| {
                        missing.get_or_insert_with(|| dep.to_string());
                        String::new()
                    })
                }
            }
        });

        match missing {
            Some(dep) => Err(format!("no tag available for referenced image '{}'", dep)),
            None => Ok(rendered.into_owned()),
        }
    }
}

/// Substitute `{name}` placeholders in a hook token. `{{` and `}}` produce literal braces.
pub fn render_placeholders(input: &str, values: &HashMap<&str, String>) -> Result<String, String> {
    let mut unknown = None;
    let rendered = HOOK_PLACEHOLDER.replace_all(input, |caps: &Captures| {
        match caps.get(0).map(|m| m.as_str()) {
            Some("{{") => "{".to_string(),
            Some("}}") => "}".to_string(),
            _ => {
                let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                values.get(name).cloned().unwrap_or_else(|| {
                    unknown.get_or_insert_with(|| name.to_string());
                    String::new()
                })
            }
        }
    });

    match unknown {
        Some(name) => Err(format!("unknown placeholder '{{{}}}' in '{}'", name, input)),
        None => Ok(rendered.into_owned()),
    }
}
