use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "learnchat")]
#[command(version, about = "LearnChat - streaming study assistant from the terminal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Backend API URL; the socket origin is derived from it
    #[arg(long, global = true, env = "LEARNCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token of a logged-in user
    #[arg(long, global = true, env = "LEARNCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a message and stream the answer
    Send(SendArgs),

    /// List a feature's chat history
    History(HistoryArgs),

    /// Print the transcript of a chat
    Show {
        /// Chat id
        id: String,
    },

    /// Delete a chat
    Delete {
        /// Chat id
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Message text
    pub message: String,

    /// Feature the message belongs to
    #[arg(long, default_value = "study-tools")]
    pub feature: String,

    #[arg(long)]
    pub sub_feature: Option<String>,

    /// Continue an existing chat
    #[arg(long)]
    pub chat_id: Option<String>,

    #[arg(long)]
    pub provider: Option<String>,

    #[arg(long)]
    pub model: Option<String>,

    /// System context sent with the first message of a chat
    #[arg(long)]
    pub system_context: Option<String>,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long, default_value = "study-tools")]
    pub feature: String,

    #[arg(long)]
    pub sub_feature: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub page: u32,

    #[arg(long, default_value_t = 10)]
    pub limit: u32,
}
