use crate::agents::definition_loader::{DefinitionSet, Dependency, ImageDefinition};
use crate::error::{CraftsbotError, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// An update asked for on the command line: `update <image> [<tag>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateRequest {
    pub image: String,
    /// `None` forces a rebuild and skips the version check.
    pub tag: Option<String>,
}

impl UpdateRequest {
    pub fn new(image: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            image: image.into(),
            tag,
        }
    }
}

/// Why an image ended up in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InclusionReason {
    Requested,
    DependsOn { image: String, constraint: Dependency },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedImage {
    pub name: String,
    pub previous_tag: Option<String>,
    pub new_tag: String,
    pub reason: InclusionReason,
}

impl PlannedImage {
    pub fn tag_changes(&self) -> bool {
        self.previous_tag.as_deref() != Some(self.new_tag.as_str())
    }
}

/// Images to rebuild, dependencies first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildPlan {
    pub request: UpdateRequest,
    /// Set when the requested tag is already the current one.
    pub up_to_date: bool,
    pub entries: Vec<PlannedImage>,
}

impl BuildPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlannedImage> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Tag an image will have once the plan ran: its new tag when planned,
    /// its current tag otherwise.
    pub fn resolved_tag(&self, definitions: &DefinitionSet, name: &str) -> Option<String> {
        if let Some(entry) = self.get(name) {
            return Some(entry.new_tag.clone());
        }
        let planned: HashMap<&str, String> = self
            .entries
            .iter()
            .map(|e| (e.name.as_str(), e.new_tag.clone()))
            .collect();
        current_tag(definitions, definitions.get(name)?, &planned, &mut Vec::new())
    }
}

/// UpdatePlanner turns an [`UpdateRequest`] into a [`BuildPlan`].
pub struct UpdatePlanner<'a> {
    definitions: &'a DefinitionSet,
    /// `dependents[i]`: declaration indices of images listing image `i` in `depends_on`.
    dependents: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl<'a> UpdatePlanner<'a> {
    pub fn new(definitions: &'a DefinitionSet) -> Self {
        let mut dependents = vec![Vec::new(); definitions.len()];
        for (idx, definition) in definitions.iter().enumerate() {
            for dependency in definition.depends_on.keys() {
                if let Some(dep_idx) = definitions.position(dependency) {
                    dependents[dep_idx].push(idx);
                }
            }
        }

        Self {
            definitions,
            dependents,
        }
    }

    /// Compute the ordered set of images to rebuild for `request`.
    pub fn resolve(&self, request: &UpdateRequest) -> Result<BuildPlan> {
        let target_idx = self
            .definitions
            .position(&request.image)
            .ok_or_else(|| CraftsbotError::NotFound(request.image.clone()))?;
        let target = &self.definitions.as_slice()[target_idx];

        if let Some(tag) = &request.tag {
            if target.tag_template.is_none() && target.tag.as_deref() == Some(tag.as_str()) {
                tracing::info!("Image '{}' is already at tag '{}'", target.name, tag);
                return Ok(BuildPlan {
                    request: request.clone(),
                    up_to_date: true,
                    entries: Vec::new(),
                });
            }
        }

        let mut marks = vec![Mark::Unvisited; self.definitions.len()];
        let mut path = Vec::new();
        self.visit(target_idx, &mut marks, &mut path)?;
        let reachable: Vec<usize> = (0..marks.len())
            .filter(|&i| marks[i] == Mark::Done)
            .collect();

        let order = self.topological_order(&reachable);
        tracing::debug!(
            "Candidate rebuild order: {}",
            order
                .iter()
                .map(|&i| self.definitions.as_slice()[i].name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut new_tags: HashMap<&str, String> = HashMap::new();
        let mut entries = Vec::new();

        for idx in order {
            let definition = &self.definitions.as_slice()[idx];

            let reason = if idx == target_idx {
                InclusionReason::Requested
            } else {
                let trigger = definition.depends_on.iter().find(|(dep, constraint)| {
                    new_tags
                        .get(dep.as_str())
                        .is_some_and(|tag| constraint.accepts(tag))
                });
                match trigger {
                    Some((dep, constraint)) => InclusionReason::DependsOn {
                        image: dep.clone(),
                        constraint: constraint.clone(),
                    },
                    None => {
                        tracing::debug!(
                            "Skipping '{}': no dependency constraint matches the new tags",
                            definition.name
                        );
                        continue;
                    }
                }
            };

            let fallback = if idx == target_idx {
                request.tag.as_deref()
            } else {
                None
            };
            let new_tag = self.effective_tag(definition, fallback, &new_tags)?;

            if idx == target_idx && definition.tag_template.is_some() {
                if let Some(requested) = request.tag.as_deref().filter(|t| *t != new_tag) {
                    tracing::warn!(
                        "Image '{}' has a tag template; using '{}' instead of '{}'",
                        definition.name,
                        new_tag,
                        requested
                    );
                }
            }

            new_tags.insert(definition.name.as_str(), new_tag.clone());
            entries.push(PlannedImage {
                name: definition.name.clone(),
                previous_tag: definition.tag.clone(),
                new_tag,
                reason,
            });
        }

        Ok(BuildPlan {
            request: request.clone(),
            up_to_date: false,
            entries,
        })
    }

    /// Reject any dependency cycle in the whole table, not just the part
    /// reachable from one image.
    pub fn check_acyclic(&self) -> Result<()> {
        let mut marks = vec![Mark::Unvisited; self.definitions.len()];
        let mut path = Vec::new();
        for idx in 0..self.definitions.len() {
            if marks[idx] == Mark::Unvisited {
                self.visit(idx, &mut marks, &mut path)?;
            }
        }
        Ok(())
    }

    /// Depth-first walk from a dependency to its dependents.
    fn visit(&self, idx: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Result<()> {
        match marks[idx] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = path.iter().position(|&p| p == idx).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| self.definitions.as_slice()[i].name.clone())
                    .collect();
                cycle.push(self.definitions.as_slice()[idx].name.clone());
                return Err(CraftsbotError::CycleDetected(cycle));
            }
            Mark::Unvisited => {}
        }

        marks[idx] = Mark::InProgress;
        path.push(idx);
        for &dependent in &self.dependents[idx] {
            self.visit(dependent, marks, path)?;
        }
        path.pop();
        marks[idx] = Mark::Done;
        Ok(())
    }

    /// Kahn's algorithm over `nodes`; ready nodes leave in declaration order.
    fn topological_order(&self, nodes: &[usize]) -> Vec<usize> {
        let members: BTreeSet<usize> = nodes.iter().copied().collect();
        let mut indegree: HashMap<usize, usize> = nodes.iter().map(|&n| (n, 0)).collect();
        for &node in nodes {
            for dependent in &self.dependents[node] {
                if members.contains(dependent) {
                    *indegree.entry(*dependent).or_default() += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&node, _)| node)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for dependent in &self.dependents[node] {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        order
    }

    fn effective_tag(
        &self,
        definition: &ImageDefinition,
        fallback: Option<&str>,
        new_tags: &HashMap<&str, String>,
    ) -> Result<String> {
        let Some(template) = &definition.tag_template else {
            return fallback
                .map(str::to_string)
                .or_else(|| definition.tag.clone())
                .ok_or_else(|| CraftsbotError::MissingTag(definition.name.clone()));
        };

        let mut visiting = vec![definition.name.clone()];
        template
            .render(&definition.name, |reference| {
                reference_tag(self.definitions, definition, reference, new_tags, &mut visiting)
            })
            .map_err(|reason| CraftsbotError::InvalidTemplate {
                image: definition.name.clone(),
                reason,
            })
    }
}

/// Tag `owner` sees for `{image.<reference>}`: its pin, the planned new tag,
/// or the referenced image's current tag.
fn reference_tag(
    definitions: &DefinitionSet,
    owner: &ImageDefinition,
    reference: &str,
    new_tags: &HashMap<&str, String>,
    visiting: &mut Vec<String>,
) -> Option<String> {
    if let Some(Dependency::Pinned(pinned)) = owner.depends_on.get(reference) {
        return Some(pinned.clone());
    }
    if let Some(tag) = new_tags.get(reference) {
        return Some(tag.clone());
    }
    current_tag(definitions, definitions.get(reference)?, new_tags, visiting)
}

/// Stored tag of an unplanned image. Images with only a template get it
/// rendered; `visiting` stops template loops.
fn current_tag(
    definitions: &DefinitionSet,
    definition: &ImageDefinition,
    new_tags: &HashMap<&str, String>,
    visiting: &mut Vec<String>,
) -> Option<String> {
    if let Some(tag) = &definition.tag {
        return Some(tag.clone());
    }
    let template = definition.tag_template.as_ref()?;
    if visiting.contains(&definition.name) {
        tracing::warn!("Tag template of image '{}' refers back to itself", definition.name);
        return None;
    }

    visiting.push(definition.name.clone());
    let rendered = template
        .render(&definition.name, |reference| {
            reference_tag(definitions, definition, reference, new_tags, visiting)
        })
        .ok();
    visiting.pop();
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::definition_loader::DefinitionLoader;
    use crate::utils::template::TagTemplate;
    use std::path::Path;

    fn load(content: &str) -> DefinitionSet {
        DefinitionLoader::new()
            .parse_str(content, Path::new("."))
            .unwrap()
    }

    const TABLE: &str = r#"
[images.alpine]
tag = "3.14.1"

[images.dnsmasq]
tag = "2.85"
depends_on = { alpine = "3.13.5" }

[images.syncthing]
tag = "1.17.0-alpine_3.14.1"
tag_tmpl = "1.17.0-alpine_{image.alpine}"
depends_on = { alpine = true }

[images.golang]
tag = "1.17"

[images.relay]
tag = "2.0"
depends_on = { syncthing = true, golang = true }
"#;

    fn request(image: &str, tag: Option<&str>) -> UpdateRequest {
        UpdateRequest::new(image, tag.map(str::to_string))
    }

    fn assert_topologically_valid(plan: &BuildPlan, definitions: &DefinitionSet) {
        let names = plan.names();
        for (pos, name) in names.iter().enumerate() {
            let definition = definitions.get(name).unwrap();
            for dep in definition.depends_on.keys() {
                if let Some(dep_pos) = names.iter().position(|n| n == dep) {
                    assert!(dep_pos < pos, "{} must precede {}", dep, name);
                }
            }
        }
    }

    #[test]
    fn alpine_update_rebuilds_templated_dependent() {
        let definitions = load(TABLE);
        let planner = UpdatePlanner::new(&definitions);
        let plan = planner.resolve(&request("alpine", Some("3.14.2"))).unwrap();

        assert_eq!(plan.names(), vec!["alpine", "syncthing", "relay"]);
        assert_eq!(plan.get("alpine").unwrap().new_tag, "3.14.2");
        assert_eq!(
            plan.get("syncthing").unwrap().new_tag,
            "1.17.0-alpine_3.14.2"
        );
        assert_eq!(plan.get("relay").unwrap().new_tag, "2.0");
        assert_topologically_valid(&plan, &definitions);
    }

    #[test]
    fn pinned_dependency_on_other_version_is_excluded() {
        let definitions = load(TABLE);
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("alpine", Some("3.14.2")))
            .unwrap();
        assert!(plan.get("dnsmasq").is_none());
    }

    #[test]
    fn pinned_dependency_on_matching_version_is_included() {
        let definitions = load(TABLE);
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("alpine", Some("3.13.5")))
            .unwrap();
        let dnsmasq = plan.get("dnsmasq").unwrap();
        assert_eq!(
            dnsmasq.reason,
            InclusionReason::DependsOn {
                image: "alpine".into(),
                constraint: Dependency::Pinned("3.13.5".into()),
            }
        );
        assert_eq!(plan.names(), vec!["alpine", "dnsmasq", "syncthing", "relay"]);
    }

    #[test]
    fn missing_tag_forces_rebuild_with_current_tag() {
        let definitions = load(TABLE);
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("alpine", None))
            .unwrap();
        assert!(!plan.up_to_date);
        assert_eq!(plan.get("alpine").unwrap().new_tag, "3.14.1");
        assert!(!plan.get("alpine").unwrap().tag_changes());
        assert_eq!(plan.names(), vec!["alpine", "syncthing", "relay"]);
    }

    #[test]
    fn same_tag_is_up_to_date() {
        let definitions = load(TABLE);
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("alpine", Some("3.14.1")))
            .unwrap();
        assert!(plan.up_to_date);
        assert!(plan.is_empty());
    }

    #[test]
    fn unknown_image_is_not_found() {
        let definitions = load(TABLE);
        let err = UpdatePlanner::new(&definitions)
            .resolve(&request("nginx", Some("1.21")))
            .unwrap_err();
        assert!(matches!(err, CraftsbotError::NotFound(ref name) if name == "nginx"));
    }

    #[test]
    fn two_image_cycle_is_detected() {
        let definitions = load(
            r#"
[images.a]
tag = "1"
depends_on = { b = true }

[images.b]
tag = "1"
depends_on = { a = true }
"#,
        );
        let planner = UpdatePlanner::new(&definitions);
        let err = planner.resolve(&request("a", Some("2"))).unwrap_err();
        assert!(matches!(err, CraftsbotError::CycleDetected(ref path) if path == &["a", "b", "a"]));
        assert!(planner.check_acyclic().is_err());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let definitions = load("[images.a]\ntag = \"1\"\ndepends_on = { a = true }\n");
        let err = UpdatePlanner::new(&definitions)
            .resolve(&request("a", None))
            .unwrap_err();
        assert!(matches!(err, CraftsbotError::CycleDetected(_)));
    }

    #[test]
    fn unreachable_cycle_only_fails_the_global_check() {
        let definitions = load(
            r#"
[images.base]
tag = "1"

[images.x]
tag = "1"
depends_on = { y = true }

[images.y]
tag = "1"
depends_on = { x = true }
"#,
        );
        let planner = UpdatePlanner::new(&definitions);
        assert_eq!(
            planner.resolve(&request("base", Some("2"))).unwrap().names(),
            vec!["base"]
        );
        assert!(matches!(
            planner.check_acyclic(),
            Err(CraftsbotError::CycleDetected(_))
        ));
    }

    #[test]
    fn ties_follow_declaration_order() {
        let definitions = load(
            r#"
[images.base]
tag = "1"

[images.zulu]
tag = "1"
depends_on = { base = true }

[images.alpha]
tag = "1"
depends_on = { base = true }

[images.top]
tag = "1"
depends_on = { alpha = true, zulu = true }
"#,
        );
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("base", Some("2")))
            .unwrap();
        assert_eq!(plan.names(), vec!["base", "zulu", "alpha", "top"]);
    }

    #[test]
    fn dependent_declared_before_its_dependency_still_builds_after() {
        let definitions = load(
            r#"
[images.app]
tag = "1"
depends_on = { base = true }

[images.base]
tag = "1"
"#,
        );
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("base", Some("2")))
            .unwrap();
        assert_eq!(plan.names(), vec!["base", "app"]);
    }

    #[test]
    fn diamond_plan_is_topologically_valid() {
        let definitions = load(
            r#"
[images.d]
tag = "1"
depends_on = { b = true, c = true }

[images.c]
tag = "1"
depends_on = { a = true }

[images.b]
tag = "1"
depends_on = { a = true }

[images.a]
tag = "1"
"#,
        );
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("a", Some("2")))
            .unwrap();
        assert_eq!(plan.names(), vec!["a", "c", "b", "d"]);
        assert_topologically_valid(&plan, &definitions);
    }

    #[test]
    fn templates_use_pins_and_current_tags_of_unplanned_images() {
        let definitions = load(
            r#"
[images.alpine]
tag = "3.14.1"

[images.golang]
tag = "1.17"

[images.tool]
tag = "0"
tag_tmpl = "{image}-go{image.golang}-alpine{image.alpine}"
depends_on = { alpine = "3.14.1", golang = true }
"#,
        );
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("golang", Some("1.18")))
            .unwrap();
        assert_eq!(plan.get("tool").unwrap().new_tag, "tool-go1.18-alpine3.14.1");
    }

    #[test]
    fn templates_render_referenced_images_without_a_stored_tag() {
        let definitions = load(
            r#"
[images.a]
tag_tmpl = "1.0"

[images.c]
tag = "1"

[images.b]
tag_tmpl = "{image.a}-{image.c}"
depends_on = { a = true, c = true }
"#,
        );
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("c", Some("2")))
            .unwrap();
        assert_eq!(plan.names(), vec!["c", "b"]);
        assert_eq!(plan.get("b").unwrap().new_tag, "1.0-2");
        assert_eq!(plan.resolved_tag(&definitions, "a").as_deref(), Some("1.0"));
    }

    #[test]
    fn template_loop_between_untagged_images_is_rejected() {
        let definitions = load(
            r#"
[images.base]
tag = "1"

[images.x]
tag_tmpl = "{image.y}"

[images.y]
tag_tmpl = "{image.x}"

[images.app]
tag_tmpl = "{image.x}-{image.base}"
depends_on = { base = true }
"#,
        );
        let err = UpdatePlanner::new(&definitions)
            .resolve(&request("base", Some("2")))
            .unwrap_err();
        assert!(matches!(err, CraftsbotError::InvalidTemplate { ref image, .. } if image == "app"));
    }

    #[test]
    fn requested_image_with_template_ignores_explicit_tag() {
        let definitions = load(TABLE);
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("syncthing", Some("whatever")))
            .unwrap();
        assert_eq!(plan.names(), vec!["syncthing", "relay"]);
        assert_eq!(
            plan.get("syncthing").unwrap().new_tag,
            "1.17.0-alpine_3.14.1"
        );
    }

    #[test]
    fn resolves_sets_built_in_code() {
        let definitions = DefinitionSet::new(
            vec![
                ImageDefinition::new("base", "1"),
                ImageDefinition::new("app", "0")
                    .depending_on("base", Dependency::Any)
                    .with_template(TagTemplate::parse("app-{image.base}").unwrap()),
            ],
            Path::new("."),
        )
        .unwrap();
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("base", Some("2")))
            .unwrap();
        assert_eq!(plan.get("app").unwrap().new_tag, "app-2");
        assert_eq!(plan.resolved_tag(&definitions, "base").as_deref(), Some("2"));
    }

    #[test]
    fn plan_serializes_to_json() {
        let definitions = load(TABLE);
        let plan = UpdatePlanner::new(&definitions)
            .resolve(&request("alpine", Some("3.13.5")))
            .unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["entries"][1]["name"], "dnsmasq");
        assert_eq!(json["entries"][1]["reason"]["kind"], "depends_on");
        assert_eq!(json["entries"][1]["reason"]["constraint"], "3.13.5");
        assert_eq!(json["entries"][2]["reason"]["constraint"], true);
    }
}
