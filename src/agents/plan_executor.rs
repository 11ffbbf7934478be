use crate::agents::command_runner::{CommandOutput, CommandRunner, Invocation};
use crate::agents::definition_loader::{DefinitionSet, Dependency, Hook, ImageDefinition};
use crate::agents::table_editor::TableEditor;
use crate::agents::update_planner::{BuildPlan, PlannedImage};
use crate::error::{CraftsbotError, Result};
use crate::utils::dockerfile::rewrite_from_lines;
use crate::utils::path_validator::PathValidator;
use crate::utils::template::render_placeholders;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use jiff::{SignedDuration, Zoned};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DOCKERFILE: &str = "Dockerfile";
const DOCKERFILE_BACKUP: &str = "Dockerfile.bak";
const DOCKERFILE_PENDING: &str = "Dockerfile.craftsbot";

/// What happened to one image of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutcome {
    pub name: String,
    pub tag: String,
    /// False when the definition has no `workdir` and nothing was built.
    pub built: bool,
    /// False when the build succeeded but the rewritten Dockerfile could not be kept.
    pub dockerfile_updated: bool,
    pub hook_ran: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub started_at: Zoned,
    pub elapsed: SignedDuration,
    pub outcomes: Vec<ImageOutcome>,
}

impl ExecutionReport {
    pub fn completed(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.name.as_str()).collect()
    }
}

/// Build context of a planned image, checked before anything runs.
struct PreparedBuild {
    workdir: PathBuf,
    dockerfile: PathBuf,
}

/// PlanExecutor runs a [`BuildPlan`] one image at a time: build, hook, persist tag.
pub struct PlanExecutor<'a> {
    definitions: &'a DefinitionSet,
    runner: Arc<dyn CommandRunner>,
    docker: String,
    show_progress: bool,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(definitions: &'a DefinitionSet, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            definitions,
            runner,
            docker: "docker".to_string(),
            show_progress: false,
        }
    }

    /// Program used for `build`, `docker` by default.
    pub fn with_docker(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Validate every build context and hook of the plan without running anything.
    pub fn preflight(&self, plan: &BuildPlan) -> Result<()> {
        for entry in &plan.entries {
            let definition = self.definition(&entry.name)?;
            self.prepare_build(definition)?;
            if let Some(hook) = &definition.on_success {
                self.render_hook(definition, entry, hook)?;
            }
        }
        Ok(())
    }

    /// Execute the plan. Stops at the first failing build or hook; images that
    /// completed before keep their new tag.
    pub fn execute(&self, plan: &BuildPlan, editor: &mut TableEditor) -> Result<ExecutionReport> {
        self.preflight(plan)?;

        let started_at = Zoned::now();
        let mut outcomes: Vec<ImageOutcome> = Vec::with_capacity(plan.len());

        let pb = ProgressBar::new(plan.len() as u64);
        if !self.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  [{bar:40}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        for entry in &plan.entries {
            let definition = self.definition(&entry.name)?;
            let completed = || outcomes.iter().map(|o| o.name.clone()).collect::<Vec<_>>();
            tracing::info!("Processing image '{}:{}'", entry.name, entry.new_tag);

            let (built, dockerfile_updated) = match self.prepare_build(definition)? {
                Some(prepared) => {
                    pb.set_message(format!("Building {}:{}", entry.name, entry.new_tag));
                    let updated = self
                        .build(definition, entry, plan, &prepared)
                        .map_err(|reason| CraftsbotError::BuildFailed {
                            image: entry.name.clone(),
                            reason,
                            completed: completed(),
                        })?;
                    (true, updated)
                }
                None => (false, false),
            };

            let hook_result = match &definition.on_success {
                Some(hook) => {
                    pb.set_message(format!("Notifying {}:{}", entry.name, entry.new_tag));
                    tracing::info!(
                        "Executing on_success hook of image '{}:{}'",
                        entry.name,
                        entry.new_tag
                    );
                    Some(self.notify(definition, entry, hook))
                }
                None => None,
            };

            // The build itself succeeded, so the tag is recorded even if the hook failed.
            editor
                .set_tag(&entry.name, &entry.new_tag)
                .map_err(|e| CraftsbotError::TagPersistFailed {
                    image: entry.name.clone(),
                    reason: e.to_string(),
                    completed: completed(),
                })?;
            outcomes.push(ImageOutcome {
                name: entry.name.clone(),
                tag: entry.new_tag.clone(),
                built,
                dockerfile_updated,
                hook_ran: hook_result.is_some(),
            });
            pb.inc(1);

            if let Some(Err(reason)) = hook_result {
                pb.abandon();
                return Err(CraftsbotError::NotifyFailed {
                    image: entry.name.clone(),
                    reason,
                    completed: outcomes.iter().map(|o| o.name.clone()).collect(),
                });
            }
        }

        pb.finish_and_clear();

        let elapsed = Zoned::now()
            .timestamp()
            .duration_since(started_at.timestamp());

        Ok(ExecutionReport {
            started_at,
            elapsed,
            outcomes,
        })
    }

    fn definition(&self, name: &str) -> Result<&'a ImageDefinition> {
        self.definitions
            .get(name)
            .ok_or_else(|| CraftsbotError::NotFound(name.to_string()))
    }

    fn prepare_build(&self, definition: &ImageDefinition) -> Result<Option<PreparedBuild>> {
        let Some(workdir) = &definition.workdir else {
            return Ok(None);
        };

        let workdir =
            PathValidator::validate_workdir(&definition.name, workdir, self.definitions.base_dir())?;
        let dockerfile = PathValidator::validate_file_path(workdir.join(DOCKERFILE), &workdir)
            .map_err(|e| CraftsbotError::InvalidWorkdir {
                image: definition.name.clone(),
                reason: format!("no usable {}: {}", DOCKERFILE, e),
            })?;

        Ok(Some(PreparedBuild {
            workdir,
            dockerfile,
        }))
    }

    /// Tag to pin for a base image repository used in a `FROM` line.
    fn pin_for(&self, definition: &ImageDefinition, plan: &BuildPlan, repository: &str) -> Option<String> {
        let owner = self
            .definitions
            .owner_of_repository(repository)
            .unwrap_or(repository);

        match definition.depends_on.get(owner)? {
            Dependency::Pinned(tag) => Some(tag.clone()),
            Dependency::Any => plan.resolved_tag(self.definitions, owner),
        }
    }

    fn build(
        &self,
        definition: &ImageDefinition,
        entry: &PlannedImage,
        plan: &BuildPlan,
        prepared: &PreparedBuild,
    ) -> std::result::Result<bool, String> {
        let original = fs::read_to_string(&prepared.dockerfile)
            .map_err(|e| format!("failed to read {}: {}", prepared.dockerfile.display(), e))?;

        let (rewritten, rewrites) =
            rewrite_from_lines(&original, |repository| self.pin_for(definition, plan, repository));
        for rewrite in &rewrites {
            tracing::info!(
                "{}:{}: FROM {} -> {}",
                DOCKERFILE,
                rewrite.line,
                rewrite.from,
                rewrite.to
            );
        }

        let pending = prepared.workdir.join(DOCKERFILE_PENDING);
        fs::write(&pending, &rewritten)
            .map_err(|e| format!("failed to write {}: {}", pending.display(), e))?;

        let mut invocation = Invocation::new(&self.docker)
            .arg("build")
            .arg("-f")
            .arg(path_arg(&pending));
        for repository in &definition.repositories {
            invocation = invocation
                .arg("-t")
                .arg(format!("{}:{}", repository, entry.new_tag));
        }
        let invocation = invocation
            .arg(path_arg(&prepared.workdir))
            .current_dir(&prepared.workdir);

        let outcome = self.run_checked(&invocation);
        if let Err(reason) = outcome {
            if let Err(e) = fs::remove_file(&pending) {
                tracing::warn!("Could not remove {}: {}", pending.display(), e);
            }
            return Err(reason);
        }
        tracing::debug!("Executed build of image '{}:{}'", entry.name, entry.new_tag);

        // only a successful build gets its rewritten Dockerfile kept
        let backup = prepared.workdir.join(DOCKERFILE_BACKUP);
        let kept = fs::write(&backup, &original)
            .and_then(|_| fs::rename(&pending, &prepared.dockerfile));
        match kept {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(
                    "Image '{}:{}' was built but {} was left unchanged: {}",
                    entry.name,
                    entry.new_tag,
                    prepared.dockerfile.display(),
                    e
                );
                if let Err(e) = fs::remove_file(&pending) {
                    tracing::warn!("Could not remove {}: {}", pending.display(), e);
                }
                Ok(false)
            }
        }
    }

    fn render_hook(
        &self,
        definition: &ImageDefinition,
        entry: &PlannedImage,
        hook: &Hook,
    ) -> Result<Invocation> {
        let values = HashMap::from([
            ("image", definition.primary_repository().to_string()),
            ("alias", definition.name.clone()),
            ("tag", entry.new_tag.clone()),
        ]);
        let invalid = |reason: String| CraftsbotError::InvalidDefinition {
            image: definition.name.clone(),
            reason: format!("on_success: {}", reason),
        };

        let mut tokens = hook
            .cmd
            .iter()
            .map(|token| render_placeholders(token, &values))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(invalid)?
            .into_iter();
        let program = tokens
            .next()
            .ok_or_else(|| invalid("cmd is empty".to_string()))?;

        let env = hook
            .env
            .iter()
            .map(|(key, value)| Ok((key.clone(), render_placeholders(value, &values)?)))
            .collect::<std::result::Result<BTreeMap<_, _>, String>>()
            .map_err(invalid)?;

        Ok(Invocation::new(program)
            .args(tokens)
            .envs(env)
            .current_dir(self.definitions.base_dir()))
    }

    fn notify(
        &self,
        definition: &ImageDefinition,
        entry: &PlannedImage,
        hook: &Hook,
    ) -> std::result::Result<(), String> {
        let invocation = self
            .render_hook(definition, entry, hook)
            .map_err(|e| e.to_string())?;
        self.run_checked(&invocation)?;
        tracing::debug!("Executed on_success hook of image '{}'", entry.name);
        Ok(())
    }

    /// Run and turn a spawn error or non-zero exit into a failure reason.
    fn run_checked(&self, invocation: &Invocation) -> std::result::Result<CommandOutput, String> {
        let output = self.runner.run(invocation).map_err(|e| e.to_string())?;
        if output.success() {
            return Ok(output);
        }

        tracing::error!("'{}' failed with {}", invocation, output.describe_status());
        for (kind, line) in &output.lines {
            tracing::error!("{}: {}", kind, line);
        }
        Err(format!("'{}' failed with {}", invocation.program, output.describe_status()))
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
