use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "craftsbot",
    about = "Container image craftsbot - rebuild Docker images and everything depending on them",
    version,
    author
)]
pub struct Cli {
    /// Path to the craftsbot file
    #[arg(short, long, global = true, default_value = ".craftsbot.toml")]
    pub file: String,

    /// Logger level (overridden by CRAFTSBOT_LOG)
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Enable verbose output for debugging (same as --log-level debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Container build tool to invoke
    #[arg(long, global = true, env = "CRAFTSBOT_DOCKER", default_value = "docker")]
    pub docker: String,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// The progress bar shares stderr with logs and streamed build output,
    /// so it is only drawn when info logs are off.
    pub fn show_progress(&self) -> bool {
        !self.verbose && matches!(self.log_level, LogLevel::Error | LogLevel::Warn)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Update an image and rebuild everything depending on it
    Update {
        /// The alias of the image to update
        image: String,

        /// The new tag; omit it to force a rebuild with the current tag
        tag: Option<String>,

        /// Print the plan without building anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show which images an update would rebuild, in build order
    Plan {
        /// The alias of the image to update
        image: String,

        /// The new tag
        tag: Option<String>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List all image definitions
    List,

    /// Validate the craftsbot file, including a full dependency cycle check
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_with_optional_tag() {
        let cli = Cli::parse_from(["craftsbot", "update", "alpine", "3.14.2"]);
        assert_eq!(cli.file, ".craftsbot.toml");
        match cli.command {
            Commands::Update {
                image,
                tag,
                dry_run,
            } => {
                assert_eq!(image, "alpine");
                assert_eq!(tag.as_deref(), Some("3.14.2"));
                assert!(!dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::parse_from(["craftsbot", "-f", "images.toml", "update", "alpine"]);
        assert_eq!(cli.file, "images.toml");
        assert!(matches!(cli.command, Commands::Update { tag: None, .. }));
    }

    #[test]
    fn parses_log_level() {
        let cli = Cli::parse_from(["craftsbot", "--log-level", "debug", "list"]);
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert_eq!(cli.log_level.as_filter(), "debug");
    }

    #[test]
    fn progress_bar_only_when_info_logs_are_off() {
        assert!(!Cli::parse_from(["craftsbot", "list"]).show_progress());
        assert!(Cli::parse_from(["craftsbot", "--log-level", "warn", "list"]).show_progress());
        assert!(Cli::parse_from(["craftsbot", "--log-level", "error", "list"]).show_progress());
        assert!(!Cli::parse_from(["craftsbot", "--log-level", "warn", "-v", "list"]).show_progress());
    }

    #[test]
    fn rejects_unknown_log_level() {
        assert!(Cli::try_parse_from(["craftsbot", "--log-level", "loud", "list"]).is_err());
    }
}
