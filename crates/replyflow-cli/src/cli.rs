use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Output format for CLI commands
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

#[derive(Parser)]
#[command(name = "replyflow")]
#[command(version, about = "ReplyFlow - Stream assistant replies to your terminal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to $REPLYFLOW_CONFIG or ./replyflow.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend base URL, overriding the config
    #[arg(long, global = true, env = "REPLYFLOW_BASE_URL")]
    pub base_url: Option<String>,

    /// Bearer token for the backend and the push channel
    #[arg(long, global = true, env = "REPLYFLOW_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Send a message and stream the reply
    Send(SendArgs),

    /// Follow an existing reply by polling
    Poll(PollArgs),
}

#[derive(Args)]
pub struct SendArgs {
    /// Message text
    pub message: String,

    /// Continue an existing conversation
    #[arg(short, long)]
    pub conversation: Option<String>,

    /// File to attach
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Skip the push channel and poll for the reply
    #[arg(long)]
    pub poll: bool,
}

#[derive(Args)]
pub struct PollArgs {
    /// Assistant message id
    pub message_id: String,

    /// Conversation the message belongs to
    #[arg(short, long)]
    pub conversation: String,
}
