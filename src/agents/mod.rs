pub mod command_runner;
pub mod definition_loader;
pub mod plan_executor;
pub mod table_editor;
pub mod update_planner;

pub use command_runner::SystemCommandRunner;
pub use definition_loader::{DefinitionLoader, DefinitionSet, Dependency};
pub use plan_executor::{ExecutionReport, PlanExecutor};
pub use table_editor::TableEditor;
pub use update_planner::{BuildPlan, InclusionReason, UpdatePlanner, UpdateRequest};
