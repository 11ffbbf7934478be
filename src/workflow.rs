use crate::agents::{
    BuildPlan, DefinitionLoader, DefinitionSet, Dependency, ExecutionReport, InclusionReason,
    PlanExecutor, SystemCommandRunner, TableEditor, UpdatePlanner, UpdateRequest,
};
use crate::error::Result;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

/// Options shared by the commands that may run external tools.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub docker: String,
    pub show_progress: bool,
}

/// Execute the update workflow
pub fn execute_update<P: AsRef<Path>>(
    table_path: P,
    image: &str,
    tag: Option<String>,
    dry_run: bool,
    options: &RunOptions,
) -> Result<()> {
    let table_path = table_path.as_ref();
    println!("{}", "Starting image update process...".cyan().bold());

    // Step 1: Load definitions
    println!("\n{}", "1. Loading image definitions...".yellow());
    let definitions = load_definitions(table_path)?;

    // Step 2: Resolve the plan
    println!("\n{}", "2. Resolving update plan...".yellow());
    let request = UpdateRequest::new(image, tag);
    let plan = UpdatePlanner::new(&definitions).resolve(&request)?;

    if plan.up_to_date {
        println!(
            "{}",
            format!(
                "✓ '{}' is already at tag '{}' (omit the tag to force a rebuild)",
                image,
                request.tag.as_deref().unwrap_or_default()
            )
            .green()
        );
        return Ok(());
    }
    print_plan(&plan);

    if dry_run {
        println!("\n{}", "Dry run: nothing was built".yellow());
        return Ok(());
    }

    // Step 3: Build (build contexts are checked before the first command)
    println!(
        "\n{}",
        format!("3. Building {} image(s)...", plan.len()).yellow()
    );
    let executor = PlanExecutor::new(&definitions, Arc::new(SystemCommandRunner::new()))
        .with_docker(options.docker.as_str())
        .with_progress(options.show_progress);
    let mut editor = TableEditor::open(table_path)?;
    let report = executor.execute(&plan, &mut editor)?;

    // Step 4: Summary
    print_execution_report(&report, editor.path());

    println!(
        "\n{}",
        "✨ Update process completed successfully!".green().bold()
    );
    Ok(())
}

/// Execute the plan workflow (dry-run without side effects)
pub fn execute_plan<P: AsRef<Path>>(
    table_path: P,
    image: &str,
    tag: Option<String>,
    json: bool,
) -> Result<()> {
    let definitions = DefinitionLoader::new().load_file(table_path)?;
    let plan = UpdatePlanner::new(&definitions).resolve(&UpdateRequest::new(image, tag))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    if plan.up_to_date {
        println!("{}", "✨ Image is already at the requested tag".green().bold());
    } else {
        print_plan(&plan);
    }
    Ok(())
}

/// Execute the list workflow - display all image definitions
pub fn execute_list<P: AsRef<Path>>(table_path: P) -> Result<()> {
    let definitions = DefinitionLoader::new().load_file(table_path)?;

    println!("\n{}", "📦 Images:".cyan().bold());
    for definition in definitions.iter() {
        let tag = definition
            .tag
            .as_deref()
            .map(|t| t.green().to_string())
            .unwrap_or_else(|| "(no tag yet)".dimmed().to_string());
        println!("  {} {}", definition.name.white().bold(), tag);

        if definition.repositories != [definition.name.clone()] {
            println!(
                "    {} {}",
                "images:".dimmed(),
                definition.repositories.join(", ")
            );
        }
        if let Some(description) = &definition.description {
            println!("    {}", description.dimmed());
        }
        if let Some(template) = &definition.tag_template {
            println!("    {} {}", "tag_tmpl:".dimmed(), template.as_str());
        }
        if !definition.depends_on.is_empty() {
            let deps: Vec<String> = definition
                .depends_on
                .iter()
                .map(|(name, dependency)| format_dependency(name, dependency))
                .collect();
            println!("    {} {}", "depends on:".dimmed(), deps.join(", "));
        }
        if let Some(workdir) = &definition.workdir {
            println!("    {} {}", "workdir:".dimmed(), workdir.display());
        }
    }

    println!("\n{}", "Summary:".cyan().bold());
    println!("  {} images", definitions.len().to_string().yellow());
    Ok(())
}

/// Execute the check workflow - validate the whole table
pub fn execute_check<P: AsRef<Path>>(table_path: P) -> Result<()> {
    let table_path = table_path.as_ref();
    println!("{}", "Checking craftsbot file...".cyan().bold());

    println!("\n{}", "1. Loading image definitions...".yellow());
    let definitions = load_definitions(table_path)?;

    println!("\n{}", "2. Checking for dependency cycles...".yellow());
    UpdatePlanner::new(&definitions).check_acyclic()?;
    println!("{}", "✓ No dependency cycles".green());

    println!("\n{}", "✨ Craftsbot file is valid!".green().bold());
    Ok(())
}

fn load_definitions(table_path: &Path) -> Result<DefinitionSet> {
    let definitions = DefinitionLoader::new().load_file(table_path)?;
    println!(
        "{}",
        format!(
            "✓ Loaded {} image definition(s) from {}",
            definitions.len(),
            table_path.display()
        )
        .green()
    );
    Ok(definitions)
}

fn format_dependency(name: &str, dependency: &Dependency) -> String {
    match dependency {
        Dependency::Any => name.to_string(),
        Dependency::Pinned(tag) => format!("{}@{}", name, tag),
    }
}

fn print_plan(plan: &BuildPlan) {
    println!("\n{}", "Build plan:".cyan().bold());
    for (position, entry) in plan.entries.iter().enumerate() {
        let old = entry.previous_tag.as_deref().unwrap_or("-");
        let tags = if entry.tag_changes() {
            format!("{} → {}", old.red(), entry.new_tag.green().bold())
        } else {
            format!("{} {}", entry.new_tag.green(), "(rebuild)".dimmed())
        };
        let reason = match &entry.reason {
            InclusionReason::Requested => "requested".to_string(),
            InclusionReason::DependsOn { image, constraint } => {
                format!("depends on {}", format_dependency(image, constraint))
            }
        };
        println!(
            "  {}. {} {} {}",
            position + 1,
            entry.name.white().bold(),
            tags,
            format!("({})", reason).dimmed()
        );
    }
}

fn print_execution_report(report: &ExecutionReport, table_path: &Path) {
    println!("\n{}", "Update Summary:".cyan().bold());
    println!(
        "  started {} and took {:.1}s",
        report.started_at.strftime("%Y-%m-%d %H:%M:%S"),
        report.elapsed.as_secs_f64()
    );
    for outcome in &report.outcomes {
        let mut notes = Vec::new();
        if outcome.built {
            notes.push("built");
            if !outcome.dockerfile_updated {
                notes.push("Dockerfile left unchanged");
            }
        }
        if outcome.hook_ran {
            notes.push("notified");
        }
        if notes.is_empty() {
            notes.push("tag recorded");
        }
        println!(
            "  • {} {} ({})",
            outcome.name.white().bold(),
            outcome.tag.green(),
            notes.join(", ")
        );
    }
    println!(
        "{}",
        format!("✓ Tags saved to {}", table_path.display()).green()
    );
}
