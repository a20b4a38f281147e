//! LearnChat terminal client

mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands, HistoryArgs, SendArgs};
use learnchat_core::{
    ChatClient, ClientConfig, Conversation, ExchangeOutcome, MessageRole, StreamEvent,
    DEFAULT_MODEL, DEFAULT_PROVIDER,
};
use std::io::Write;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("LearnChat v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.api_url {
        Some(url) => ClientConfig::new(url.trim()),
        None => ClientConfig::from_env(),
    };
    config.validate().context("invalid configuration")?;

    let token = cli
        .token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .context("no token given; pass --token or set LEARNCHAT_TOKEN")?;

    let client = ChatClient::from_config(&config)?;
    let result = run(&client, &token, cli.command).await;
    client.disconnect();
    result
}

async fn run(client: &ChatClient, token: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Send(args) => send(client, token, args).await,
        Commands::History(args) => {
            client.api().set_token(token);
            history(client, args).await
        }
        Commands::Show { id } => {
            client.api().set_token(token);
            show(client, &id).await
        }
        Commands::Delete { id } => {
            client.api().set_token(token);
            client.api().delete_chat(&id).await?;
            println!("Deleted {}", id);
            Ok(())
        }
    }
}

async fn send(client: &ChatClient, token: &str, args: SendArgs) -> Result<()> {
    let handle = client.connect(token).await.context("login failed")?;
    if !handle.is_connected() {
        warn!("{}", client.state().status_message());
    }

    let mut conversation = Conversation::new(args.feature).with_provider(
        args.provider.unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
        args.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
    );
    if let Some(sub) = args.sub_feature {
        conversation = conversation.with_sub_feature(sub);
    }
    if let Some(id) = args.chat_id {
        conversation = conversation.with_conversation(id);
    }

    let message = conversation.begin_exchange(&args.message, args.system_context.as_deref());
    let (exchange, mut events) = client.send_stream(message)?;

    let mut stdout = std::io::stdout();
    let mut streamed = String::new();
    while let Some(event) = events.recv().await {
        conversation.apply(&event);
        match &event {
            StreamEvent::Chunk {
                incremental_text,
                cumulative_text,
            } => {
                write!(stdout, "{}", incremental_text)?;
                stdout.flush()?;
                streamed = cumulative_text.clone();
            }
            StreamEvent::Complete { final_message, .. } => {
                match final_message.content.strip_prefix(streamed.as_str()) {
                    Some(rest) => writeln!(stdout, "{}", rest)?,
                    None => writeln!(stdout, "\n{}", final_message.content)?,
                }
            }
            StreamEvent::Error { reason } => eprintln!("error: {}", reason),
            StreamEvent::Started | StreamEvent::Info { .. } => {}
        }
    }

    match exchange.outcome().await {
        Some(ExchangeOutcome::Completed(done)) => {
            if let Some(id) = done.conversation_id {
                eprintln!("chat: {} ({:?})", id, done.route);
            }
            Ok(())
        }
        Some(ExchangeOutcome::Failed(reason)) => bail!(reason),
        None => bail!("exchange was cancelled"),
    }
}

async fn history(client: &ChatClient, args: HistoryArgs) -> Result<()> {
    let page = client
        .api()
        .chat_history(&args.feature, args.sub_feature.as_deref(), args.page, args.limit)
        .await?;

    if page.chats.is_empty() {
        println!("No chats yet");
        return Ok(());
    }

    for chat in &page.chats {
        let updated = chat
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{}  {:16}  {} ({} messages)",
            chat.id,
            updated,
            chat.display_title(),
            chat.visible_message_count()
        );
    }
    println!("page {} of {}", page.page, page.total_pages.max(1));
    Ok(())
}

async fn show(client: &ChatClient, id: &str) -> Result<()> {
    let chat = client.api().get_chat(id).await?;
    let mut conversation = Conversation::new(chat.feature.clone().unwrap_or_default());
    conversation.load_history(&chat.messages);

    println!("# {}", chat.display_title());
    for entry in conversation.entries() {
        let who = match entry.role {
            MessageRole::User => "you",
            MessageRole::Assistant => "assistant",
            MessageRole::System => continue,
        };
        println!("\n[{}] {}", who, entry.content);
    }
    Ok(())
}
