use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "runlet")]
#[clap(version, about = "Session-scoped sandboxed code execution")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "RUNLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a code file or inline snippet in a session's sandbox
    Run(RunArgs),

    /// Ask an AI provider and execute the code it replies with
    Ask(AskArgs),

    /// Show a resource snapshot of a session's container
    Stats(StatsArgs),

    /// Stop and remove session containers
    Release(ReleaseArgs),

    /// Initialize a new runlet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Session the sandbox container belongs to
    pub session: u64,

    /// Language of the code (python, javascript, bash)
    #[clap(short, long, default_value = "python")]
    pub lang: String,

    /// File containing the code to run
    pub file: Option<PathBuf>,

    /// Inline code to run instead of a file
    #[clap(short = 'e', long, conflicts_with = "file")]
    pub code: Option<String>,
}

#[derive(Args, Debug)]
pub struct AskArgs {
    /// The prompt describing what to build or compute
    pub prompt: String,

    /// Session the sandbox container belongs to
    #[clap(short, long, default_value = "1")]
    pub session: u64,

    /// AI provider to use
    #[clap(short, long, default_value = "anthropic")]
    pub provider: String,

    /// Model to use (provider-specific)
    #[clap(long)]
    pub model: Option<String>,

    /// Disable the auto-fix loop for this request
    #[clap(long)]
    pub no_autofix: bool,

    /// Override the configured maximum fix attempts
    #[clap(long)]
    pub max_attempts: Option<u32>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Session the sandbox container belongs to
    pub session: u64,
}

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Session to release
    pub session: Option<u64>,

    /// Release every runlet session container
    #[clap(long, conflicts_with = "session")]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
