use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use quadchat::{
    ChatSession, ConnectionHandle, QuadchatConfig, SessionIdentity, SessionState, StoreBackend,
};

/// Runs a two-user conversation against the configured store and prints the result.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory for application data
    #[clap(long, value_name = "PATH", default_value = "./dev/data")]
    data_dir: PathBuf,

    /// Directory for application logs
    #[clap(long, value_name = "PATH", default_value = "./dev/logs")]
    logs_dir: PathBuf,

    /// Store backend: memory or sqlite
    #[clap(long, default_value = "memory")]
    backend: String,

    #[clap(long, default_value = "alice")]
    sender: String,

    #[clap(long, default_value = "bob")]
    receiver: String,

    /// Clear the conversation once it has been printed
    #[clap(long)]
    clear: bool,
}

async fn wait_for_messages(session: &ChatSession, count: usize) -> Result<SessionState> {
    let mut rx = session.watch();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.messages.len() >= count),
    )
    .await
    .context("Timed out waiting for delivery")?
    .context("Session closed while waiting for delivery")?;
    Ok(state.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let backend: StoreBackend = args.backend.parse()?;

    let config = QuadchatConfig::new(&args.data_dir, &args.logs_dir).with_backend(backend);
    let connection = match ConnectionHandle::init(config).await {
        Ok(connection) => connection,
        Err(err) => {
            eprintln!("Failed to initialize quadchat: {}", err);
            std::process::exit(1);
        }
    };

    connection.identity().sign_in(args.sender.as_str());
    let receiver_identity = Arc::new(SessionIdentity::new());
    receiver_identity.sign_in(args.receiver.as_str());

    let sender_session = connection.open_session()?;
    let receiver_session = ChatSession::new(
        connection.store()?,
        receiver_identity,
        connection.config().send_failure_policy,
    );
    let inbox = connection.conversation_list().await?;

    sender_session.open(args.receiver.as_str()).await?;
    receiver_session.open(args.sender.as_str()).await?;
    let existing = sender_session.state().messages.len();

    sender_session.send("hi").await?;
    wait_for_messages(&receiver_session, existing + 1).await?;
    receiver_session.send("hello").await?;
    let state = wait_for_messages(&sender_session, existing + 2).await?;

    println!("Conversation {} <-> {}:", args.sender, args.receiver);
    for message in &state.messages {
        println!(
            "  [{}] {}: {}{}",
            message.timestamp.format("%H:%M:%S%.3f"),
            message.sender_id,
            message.content,
            if message.read { "" } else { " (unread)" }
        );
    }

    let mut inbox_rx = inbox.watch();
    tokio::time::timeout(
        Duration::from_secs(5),
        inbox_rx.wait_for(|s| {
            s.summaries
                .iter()
                .any(|summary| summary.last_message == "hello")
        }),
    )
    .await
    .context("Timed out waiting for inbox")?
    .context("Inbox closed")?;

    println!("Inbox for {}:", args.sender);
    println!("{}", serde_json::to_string_pretty(&inbox.visible())?);

    if args.clear {
        let removed = sender_session.clear().await?;
        println!("Cleared {} messages", removed);
    }

    sender_session.close().await;
    receiver_session.close().await;
    inbox.shutdown().await;
    connection.teardown().await;

    Ok(())
}
