use anyhow::Result;
use clap::Parser;
use client_core::{config, ChatClient};
use shared::domain::UserId;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the configured server url.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    username: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = config::normalize_server_url(&server_url);
    }

    let client = ChatClient::new(settings);
    let mut events = client.subscribe_events();
    client.connect(UserId(args.user_id), &args.username).await?;

    let roster = client.load_friends().await?;
    println!(
        "Connected as {} ({} friends, {} pending requests)",
        args.username,
        roster.friends.len(),
        roster.pending_received.len()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{event:?}"),
                Err(_) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}
