use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "atom",
    version,
    about = "Autonomous iteration driver for conversational coding agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Init,
    Prompts,
    Config(ConfigArgs),
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Free-form task text; read from the prompt file in the conversation
    /// directory when omitted
    pub prompt: Vec<String>,
    #[arg(short = 't', long)]
    pub toolname: Option<String>,
    /// Conversation directory (defaults to the current directory)
    #[arg(short = 'd', long)]
    pub dir: Option<PathBuf>,
    #[arg(long)]
    pub max_iterations: Option<u32>,
    #[arg(long)]
    pub exit_signal: Option<String>,
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "quiet")]
    pub verbose: bool,
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "verbose")]
    pub quiet: bool,
    /// Remove the prompt file after a successful run
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub cleanup: bool,
    /// Run in a fresh temporary conversation directory, removed on exit
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "dir")]
    pub ephemeral: bool,
    /// Print the full run record as JSON instead of the final output text
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: Option<ConfigCommand>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Get(ConfigGetArgs),
    List,
}

#[derive(Args, Debug)]
pub struct ConfigGetArgs {
    pub key: String,
}
