use crate::error::{CraftsbotError, Result};
use crate::utils::template::TagTemplate;
use crate::utils::toml::TomlUtils;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use toml_edit::DocumentMut;

/// DefinitionLoader reads a craftsbot file into a validated [`DefinitionSet`].
pub struct DefinitionLoader;

impl DefinitionLoader {
    pub fn new() -> Self {
        Self
    }

    /// Read and validate the craftsbot file at `path`.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<DefinitionSet> {
        let path = path.as_ref();
        tracing::debug!("Loading image definitions from '{}'", path.display());

        let content = fs::read_to_string(path).map_err(|e| {
            CraftsbotError::TomlParsing(format!("Failed to read '{}': {}", path.display(), e))
        })?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.parse_str(&content, base_dir)
    }

    /// Parse craftsbot TOML. Relative working directories resolve against `base_dir`.
    pub fn parse_str(&self, content: &str, base_dir: &Path) -> Result<DefinitionSet> {
        let raw: RawCraftsFile = toml::from_str(content)
            .map_err(|e| CraftsbotError::TomlParsing(format!("Failed to parse TOML: {}", e)))?;

        // serde loses declaration order, toml_edit keeps it
        let doc = content
            .parse::<DocumentMut>()
            .map_err(|e| CraftsbotError::TomlParsing(format!("Failed to parse TOML: {}", e)))?;
        let order = TomlUtils::image_keys(&doc);

        let mut raw_images = raw.images;
        let mut definitions = Vec::with_capacity(raw_images.len());
        for name in order {
            if let Some(image) = raw_images.remove(&name) {
                definitions.push(image.into_definition(name)?);
            }
        }

        // Anything toml_edit did not report (should not happen) keeps a stable order.
        let mut leftovers: Vec<_> = raw_images.into_iter().collect();
        leftovers.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, image) in leftovers {
            definitions.push(image.into_definition(name)?);
        }

        DefinitionSet::new(definitions, base_dir)
    }
}

impl Default for DefinitionLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RawCraftsFile {
    #[serde(default)]
    images: HashMap<String, RawImage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawImage {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    tag_tmpl: Option<String>,
    #[serde(default)]
    workdir: Option<PathBuf>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    depends_on: BTreeMap<String, RawDependency>,
    #[serde(default)]
    on_success: Option<Hook>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Flag(bool),
    Tag(String),
}

impl RawImage {
    fn into_definition(self, name: String) -> Result<ImageDefinition> {
        let invalid = |reason: String| CraftsbotError::InvalidDefinition {
            image: name.clone(),
            reason,
        };

        let mut depends_on = BTreeMap::new();
        for (dep, value) in self.depends_on {
            let dependency = match value {
                RawDependency::Flag(true) => Dependency::Any,
                RawDependency::Flag(false) => {
                    return Err(invalid(format!(
                        "depends_on.{} must be `true` or a tag string",
                        dep
                    )));
                }
                RawDependency::Tag(tag) if tag.trim().is_empty() => {
                    return Err(invalid(format!("depends_on.{} has an empty tag", dep)));
                }
                RawDependency::Tag(tag) => Dependency::Pinned(tag),
            };
            depends_on.insert(dep, dependency);
        }

        let tag_template = self
            .tag_tmpl
            .as_deref()
            .map(TagTemplate::parse)
            .transpose()
            .map_err(|reason| CraftsbotError::InvalidTemplate {
                image: name.clone(),
                reason,
            })?;

        let repositories = if self.images.is_empty() {
            vec![name.clone()]
        } else {
            self.images
        };

        Ok(ImageDefinition {
            name,
            description: self.description,
            repositories,
            tag: self.tag,
            tag_template,
            workdir: self.workdir,
            depends_on,
            on_success: self.on_success,
        })
    }
}

/// Version constraint an image places on one of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// `true`: rebuild on any change of the dependency.
    Any,
    /// A tag string: rebuild only when the dependency moves to exactly this tag.
    Pinned(String),
}

impl Dependency {
    pub fn accepts(&self, tag: &str) -> bool {
        match self {
            Dependency::Any => true,
            Dependency::Pinned(pinned) => pinned == tag,
        }
    }
}

impl Serialize for Dependency {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Dependency::Any => serializer.serialize_bool(true),
            Dependency::Pinned(tag) => serializer.serialize_str(tag),
        }
    }
}

/// The `on_success` hook: a command template and extra environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Hook {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDefinition {
    pub name: String,
    pub description: Option<String>,
    /// Backing repositories, built together as one unit. Never empty.
    pub repositories: Vec<String>,
    pub tag: Option<String>,
    pub tag_template: Option<TagTemplate>,
    pub workdir: Option<PathBuf>,
    pub depends_on: BTreeMap<String, Dependency>,
    pub on_success: Option<Hook>,
}

impl ImageDefinition {
    /// Repository used for `{image}` in hooks.
    pub fn primary_repository(&self) -> &str {
        self.repositories
            .first()
            .map(String::as_str)
            .unwrap_or(&self.name)
    }
}

#[cfg(test)]
impl ImageDefinition {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            repositories: vec![name.clone()],
            name,
            description: None,
            tag: Some(tag.into()),
            tag_template: None,
            workdir: None,
            depends_on: BTreeMap::new(),
            on_success: None,
        }
    }

    pub fn depending_on(mut self, name: impl Into<String>, dependency: Dependency) -> Self {
        self.depends_on.insert(name.into(), dependency);
        self
    }

    pub fn with_template(mut self, template: TagTemplate) -> Self {
        self.tag_template = Some(template);
        self
    }
}

/// All image definitions of one craftsbot file, in declaration order, with
/// referential integrity checked.
#[derive(Debug, Clone)]
pub struct DefinitionSet {
    definitions: Vec<ImageDefinition>,
    index: HashMap<String, usize>,
    repository_owners: HashMap<String, String>,
    base_dir: PathBuf,
}

impl DefinitionSet {
    pub fn new(definitions: Vec<ImageDefinition>, base_dir: &Path) -> Result<Self> {
        let mut index = HashMap::with_capacity(definitions.len());
        for (position, definition) in definitions.iter().enumerate() {
            if index.insert(definition.name.clone(), position).is_some() {
                return Err(CraftsbotError::InvalidDefinition {
                    image: definition.name.clone(),
                    reason: "image is defined more than once".to_string(),
                });
            }
        }

        let mut repository_owners = HashMap::new();
        for definition in &definitions {
            Self::validate_definition(definition, &index)?;

            for repository in &definition.repositories {
                if let Some(owner) =
                    repository_owners.insert(repository.clone(), definition.name.clone())
                {
                    return Err(CraftsbotError::InvalidDefinition {
                        image: definition.name.clone(),
                        reason: format!("repository '{}' is also listed by '{}'", repository, owner),
                    });
                }
            }
        }

        Ok(Self {
            definitions,
            index,
            repository_owners,
            base_dir: base_dir.to_path_buf(),
        })
    }

    fn validate_definition(
        definition: &ImageDefinition,
        index: &HashMap<String, usize>,
    ) -> Result<()> {
        let name = &definition.name;

        match (&definition.tag, &definition.tag_template) {
            (None, None) => return Err(CraftsbotError::MissingTag(name.clone())),
            (Some(tag), _) if tag.trim().is_empty() => {
                return Err(CraftsbotError::InvalidDefinition {
                    image: name.clone(),
                    reason: "tag is empty".to_string(),
                });
            }
            _ => {}
        }

        if definition.repositories.iter().any(|r| r.trim().is_empty()) {
            return Err(CraftsbotError::InvalidDefinition {
                image: name.clone(),
                reason: "images contains an empty repository name".to_string(),
            });
        }

        for dependency in definition.depends_on.keys() {
            if !index.contains_key(dependency) {
                return Err(CraftsbotError::UnknownDependency {
                    image: name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        if let Some(template) = &definition.tag_template {
            if let Some(unknown) = template
                .references()
                .iter()
                .find(|reference| !index.contains_key(*reference))
            {
                return Err(CraftsbotError::InvalidTemplate {
                    image: name.clone(),
                    reason: format!("references unknown image '{}'", unknown),
                });
            }
        }

        if let Some(hook) = &definition.on_success {
            if hook.cmd.is_empty() {
                return Err(CraftsbotError::InvalidDefinition {
                    image: name.clone(),
                    reason: "on_success.cmd is empty".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ImageDefinition> {
        self.index.get(name).map(|&i| &self.definitions[i])
    }

    /// Declaration index of an image.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageDefinition> {
        self.definitions.iter()
    }

    pub fn as_slice(&self) -> &[ImageDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definition name owning a backing repository, e.g. `me/alpine` → `alpine`.
    pub fn owner_of_repository(&self, repository: &str) -> Option<&str> {
        self.repository_owners.get(repository).map(String::as_str)
    }

    /// Directory relative working directories are resolved against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
