use thiserror::Error;

#[derive(Error, Debug)]
pub enum CraftsbotError {
    #[error("TOML parsing failed: {0}")]
    TomlParsing(String),

    #[error("Invalid definition for image '{image}': {reason}")]
    InvalidDefinition { image: String, reason: String },

    #[error("Image '{0}' not found in the craftsbot file")]
    NotFound(String),

    #[error("Image '{image}' depends on unknown image '{dependency}'")]
    UnknownDependency { image: String, dependency: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Invalid tag template for image '{image}': {reason}")]
    InvalidTemplate { image: String, reason: String },

    #[error("Image '{0}' has no tag and no tag template")]
    MissingTag(String),

    #[error("Invalid working directory for image '{image}': {reason}")]
    InvalidWorkdir { image: String, reason: String },

    #[error("Build of image '{image}' failed: {reason}{}", completed_suffix(.completed))]
    BuildFailed {
        image: String,
        reason: String,
        completed: Vec<String>,
    },

    #[error("on_success hook of image '{image}' failed: {reason}{}", completed_suffix(.completed))]
    NotifyFailed {
        image: String,
        reason: String,
        completed: Vec<String>,
    },

    #[error("Image '{image}' was built but saving its tag failed: {reason}{}", completed_suffix(.completed))]
    TagPersistFailed {
        image: String,
        reason: String,
        completed: Vec<String>,
    },

    #[error("Failed to run '{command}': {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CraftsbotError {
    /// True for errors raised while loading or planning, before any command ran.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CraftsbotError::TomlParsing(_)
                | CraftsbotError::InvalidDefinition { .. }
                | CraftsbotError::NotFound(_)
                | CraftsbotError::UnknownDependency { .. }
                | CraftsbotError::CycleDetected(_)
                | CraftsbotError::InvalidTemplate { .. }
                | CraftsbotError::MissingTag(_)
                | CraftsbotError::InvalidWorkdir { .. }
        )
    }
}

fn completed_suffix(completed: &[String]) -> String {
    if completed.is_empty() {
        String::new()
    } else {
        format!(
            " (already updated, not rolled back: {})",
            completed.join(", ")
        )
    }
}

pub type Result<T> = std::result::Result<T, CraftsbotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_failure_lists_partially_updated_images() {
        let err = CraftsbotError::BuildFailed {
            image: "syncthing".into(),
            reason: "exit code 1".into(),
            completed: vec!["alpine".into()],
        };
        let message = err.to_string();
        assert!(message.contains("syncthing"));
        assert!(message.contains("not rolled back: alpine"));
        assert!(!err.is_config_error());
    }

    #[test]
    fn cycle_message_shows_path() {
        let err = CraftsbotError::CycleDetected(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        assert!(err.is_config_error());
    }

    #[test]
    fn tag_persist_failure_reports_progress() {
        let err = CraftsbotError::TagPersistFailed {
            image: "syncthing".into(),
            reason: "read-only file system".into(),
            completed: vec!["alpine".into()],
        };
        assert!(err.to_string().contains("was built"));
        assert!(err.to_string().contains("not rolled back: alpine"));
        assert!(!err.is_config_error());
    }
}
