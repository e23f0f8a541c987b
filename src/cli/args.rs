//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Depot - caching proxy registry
///
/// Resolves artifacts through configured proxy and hosted repositories,
/// caching upstream payloads and metadata in a local store.
#[derive(Parser, Debug)]
#[command(name = "depot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "DEPOT_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve an artifact through a repository
    Fetch(FetchArgs),

    /// List browse tree children of a repository path
    Browse(BrowseArgs),

    /// Rebuild a repository's browse index from the store
    Rebuild(RebuildArgs),

    /// Expire every cached entry of a repository
    Invalidate(InvalidateArgs),

    /// Remove an artifact from a repository
    Delete(DeleteArgs),

    /// Delete payloads left behind by replaced or removed artifacts
    Gc(GcArgs),

    /// List configured repositories
    Repos(ReposArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Repository name
    pub repository: String,

    /// Repository-relative artifact path
    pub path: String,

    /// Write the payload to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct BrowseArgs {
    /// Repository name
    pub repository: String,

    /// Directory path to list (defaults to the repository root)
    pub path: Option<String>,

    /// Maximum number of children to show
    #[arg(short, long, default_value = "100")]
    pub limit: usize,

    /// Only show children whose name contains this text
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct RebuildArgs {
    /// Repository name
    pub repository: String,
}

#[derive(Parser, Debug)]
pub struct InvalidateArgs {
    /// Repository name
    pub repository: String,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Debug)]
pub struct DeleteArgs {
    /// Repository name
    pub repository: String,

    /// Repository-relative artifact path
    pub path: String,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Debug)]
pub struct GcArgs {
    /// Only collect this repository (defaults to all)
    pub repository: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ReposArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listings
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// One name per line
    Plain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_fetch() {
        let cli = Cli::parse_from(["depot", "fetch", "npmjs", "left-pad", "-o", "out.json"]);
        match cli.command {
            Commands::Fetch(args) => {
                assert_eq!(args.repository, "npmjs");
                assert_eq!(args.path, "left-pad");
                assert_eq!(args.output, Some(PathBuf::from("out.json")));
            }
            _ => panic!("expected Fetch command"),
        }
    }

    #[test]
    fn cli_parses_browse_defaults() {
        let cli = Cli::parse_from(["depot", "browse", "maven"]);
        match cli.command {
            Commands::Browse(args) => {
                assert_eq!(args.repository, "maven");
                assert!(args.path.is_none());
                assert_eq!(args.limit, 100);
                assert!(args.filter.is_none());
            }
            _ => panic!("expected Browse command"),
        }
    }

    #[test]
    fn cli_parses_browse_filter() {
        let cli = Cli::parse_from(["depot", "browse", "maven", "org/apache", "--filter", "commons", "-l", "5"]);
        match cli.command {
            Commands::Browse(args) => {
                assert_eq!(args.path.as_deref(), Some("org/apache"));
                assert_eq!(args.filter.as_deref(), Some("commons"));
                assert_eq!(args.limit, 5);
            }
            _ => panic!("expected Browse command"),
        }
    }

    #[test]
    fn cli_parses_delete_yes() {
        let cli = Cli::parse_from(["depot", "delete", "r1", "pkg/a", "--yes"]);
        match cli.command {
            Commands::Delete(args) => {
                assert_eq!(args.path, "pkg/a");
                assert!(args.yes);
            }
            _ => panic!("expected Delete command"),
        }
    }

    #[test]
    fn cli_parses_gc() {
        let cli = Cli::parse_from(["depot", "gc"]);
        assert!(matches!(cli.command, Commands::Gc(GcArgs { repository: None })));

        let cli = Cli::parse_from(["depot", "gc", "npmjs"]);
        match cli.command {
            Commands::Gc(args) => assert_eq!(args.repository.as_deref(), Some("npmjs")),
            _ => panic!("expected Gc command"),
        }
    }

    #[test]
    fn cli_parses_config_init_force() {
        let cli = Cli::parse_from(["depot", "config", "init", "--force"]);
        match cli.command {
            Commands::Config(ConfigArgs {
                action: Some(ConfigAction::Init { force }),
            }) => assert!(force),
            _ => panic!("expected Config init command"),
        }
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["depot", "repos"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["depot", "-vv", "repos"]);
        assert_eq!(cli.verbose, 2);
    }
}
