//! Command-line surface.

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "togomak",
    version,
    about = "A declarative CI/CD pipeline runner, powered by HCL",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Stages to run (the filter); the default command is `run`.
    pub stages: Vec<String>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Path to the pipeline file
    #[arg(short, long, global = true)]
    pub file: Option<std::path::PathBuf>,

    /// Path to the directory where the pipeline file is located
    #[arg(short = 'C', long, alias = "directory", global = true)]
    pub dir: Option<std::path::PathBuf>,

    /// Enable verbose logging (repeat for more detail)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Do not prompt for responses, or wait for user responses. Run in
    /// auto-pilot
    #[arg(
        long,
        visible_alias = "no-prompt",
        alias = "no-interactive",
        env = "TOGOMAK_UNATTENDED",
        global = true
    )]
    pub unattended: bool,

    /// Run in CI mode
    #[arg(long, env = "TOGOMAK_CI", global = true)]
    pub ci: bool,

    /// Don't actually run any stage; just print the commands
    #[arg(
        short = 'n',
        long,
        visible_alias = "just-print",
        alias = "recon",
        env = "TOGOMAK_DRY_RUN",
        global = true
    )]
    pub dry_run: bool,

    /// Emit logs as JSON
    #[arg(long, hide = true, global = true)]
    pub json_log: bool,

    /// Run the pipeline as a child process (advanced)
    #[arg(long, hide = true, global = true)]
    pub child: bool,

    /// The parent stage id (advanced)
    #[arg(long, hide = true, global = true)]
    pub parent: Option<String>,

    /// Parameter passed to a child togomak process, as name=value (advanced)
    #[arg(long = "parent-param", hide = true, global = true)]
    pub parent_params: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a pipeline
    Run {
        /// Stages to run (the filter)
        stages: Vec<String>,
    },
    /// Initialize a new pipeline
    #[command(visible_alias = "i")]
    Init,
    /// List all the stages
    #[command(visible_aliases = ["ls", "l"])]
    List,
    /// Format pipeline files
    Fmt {
        /// Check if files are formatted without rewriting them
        #[arg(short, long)]
        check: bool,
        /// Format every .hcl file under the current directory
        #[arg(short, long)]
        recursive: bool,
    },
    /// Manage the cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Clean the cache
    Clean {
        /// Clean the cache recursively
        #[arg(short, long)]
        recursive: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_takes_stages() {
        let cli = Cli::parse_from(["togomak", "build", "+deploy"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.stages, vec!["build", "+deploy"]);
    }

    #[test]
    fn test_run_subcommand() {
        let cli = Cli::parse_from(["togomak", "run", "build"]);
        match cli.command {
            Some(Command::Run { stages }) => assert_eq!(stages, vec!["build"]),
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["togomak", "-n", "-vv", "--ci", "-C", "/tmp"]);
        assert!(cli.global.dry_run);
        assert!(cli.global.ci);
        assert_eq!(cli.global.verbose, 2);
        assert_eq!(cli.global.dir.as_deref(), Some(std::path::Path::new("/tmp")));
    }

    #[test]
    fn test_fmt_flags() {
        let cli = Cli::parse_from(["togomak", "fmt", "--check", "--recursive"]);
        match cli.command {
            Some(Command::Fmt { check, recursive }) => {
                assert!(check);
                assert!(recursive);
            }
            other => panic!("expected fmt, got {:?}", other),
        }
    }

    #[test]
    fn test_hidden_child_flags() {
        let cli = Cli::parse_from([
            "togomak",
            "--child",
            "--parent",
            "deploy",
            "--parent-param",
            "env=prod",
        ]);
        assert!(cli.global.child);
        assert_eq!(cli.global.parent.as_deref(), Some("deploy"));
        assert_eq!(cli.global.parent_params, vec!["env=prod"]);
    }
}
