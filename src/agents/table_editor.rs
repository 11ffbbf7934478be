use crate::error::{CraftsbotError, Result};
use crate::utils::toml::{IMAGES_TABLE, TomlUtils};
use std::fs;
use std::path::{Path, PathBuf};
use toml_edit::DocumentMut;

/// TableEditor writes new tags back into the craftsbot file, keeping its
/// comments and layout intact.
pub struct TableEditor {
    table_path: PathBuf,
    doc: DocumentMut,
}

impl TableEditor {
    pub fn open<P: AsRef<Path>>(table_path: P) -> Result<Self> {
        let table_path = table_path.as_ref().to_path_buf();
        let content = fs::read_to_string(&table_path).map_err(|e| {
            CraftsbotError::TomlParsing(format!(
                "Failed to read '{}': {}",
                table_path.display(),
                e
            ))
        })?;

        let doc = content.parse::<DocumentMut>().map_err(|e| {
            CraftsbotError::TomlParsing(format!(
                "Failed to parse '{}': {}",
                table_path.display(),
                e
            ))
        })?;

        Ok(Self { table_path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.table_path
    }

    pub fn tag_of(&self, image: &str) -> Option<String> {
        self.doc
            .get(IMAGES_TABLE)
            .and_then(|images| images.get(image))
            .and_then(TomlUtils::extract_tag)
    }

    /// Set the tag of `image` and write the file immediately.
    pub fn set_tag(&mut self, image: &str, tag: &str) -> Result<()> {
        if self.tag_of(image).as_deref() == Some(tag) {
            return Ok(());
        }

        // Item::get_mut inserts missing keys, so go through the table view
        let entry = self
            .doc
            .get_mut(IMAGES_TABLE)
            .and_then(|images| images.as_table_like_mut())
            .and_then(|images| images.get_mut(image))
            .ok_or_else(|| CraftsbotError::NotFound(image.to_string()))?;

        if !TomlUtils::update_tag(entry, tag) {
            return Err(CraftsbotError::TomlParsing(format!(
                "Entry for image '{}' is not a table",
                image
            )));
        }

        tracing::debug!(
            "Saving tag '{}' for image '{}' to '{}'",
            tag,
            image,
            self.table_path.display()
        );
        self.write_document()
    }

    fn write_document(&self) -> Result<()> {
        fs::write(&self.table_path, self.doc.to_string()).map_err(|e| {
            CraftsbotError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to write '{}': {}", self.table_path.display(), e),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TABLE: &str = r#"# managed by craftsbot
[images.alpine]
tag = "3.14.1" # base

[images.app]
tag_tmpl = "1.0_{image.alpine}"
depends_on = { alpine = true }
"#;

    #[test]
    fn writes_tag_and_preserves_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".craftsbot.toml");
        fs::write(&path, TABLE).unwrap();

        let mut editor = TableEditor::open(&path).unwrap();
        editor.set_tag("alpine", "3.14.2").unwrap();
        editor.set_tag("app", "1.0_3.14.2").unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# managed by craftsbot\n"));
        assert!(written.contains(r#"tag = "3.14.2" # base"#));
        assert!(written.contains(r#"depends_on = { alpine = true }"#));

        let reopened = TableEditor::open(&path).unwrap();
        assert_eq!(reopened.tag_of("app").as_deref(), Some("1.0_3.14.2"));
    }

    #[test]
    fn unknown_image_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".craftsbot.toml");
        fs::write(&path, TABLE).unwrap();

        let mut editor = TableEditor::open(&path).unwrap();
        assert!(matches!(
            editor.set_tag("ghost", "1"),
            Err(CraftsbotError::NotFound(_))
        ));
        assert!(editor.doc["images"].as_table().unwrap().get("ghost").is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), TABLE);
    }

    #[test]
    fn write_failure_is_not_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".craftsbot.toml");
        fs::write(&path, TABLE).unwrap();

        let mut editor = TableEditor::open(&path).unwrap();
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let err = editor.set_tag("alpine", "3.14.2").unwrap_err();
        assert!(matches!(err, CraftsbotError::Io(_)));
        assert!(!err.is_config_error());
    }

    #[test]
    fn unchanged_tag_does_not_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".craftsbot.toml");
        fs::write(&path, TABLE).unwrap();

        let mut editor = TableEditor::open(&path).unwrap();
        editor.set_tag("alpine", "3.14.1").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), TABLE);
    }
}
