use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings_from, Backbone, ChatEvent, ChatService, ConnectionEvent, ContactService,
    LoginEvent, LoginFlow, SessionStore, WebSocketConnector,
};
use shared::domain::UserId;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; missing is fine.
    #[arg(long, default_value = client_core::settings::SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    account: Option<String>,
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    settings.apply_overrides(|key| std::env::var(key).ok())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let backbone = Backbone::new(settings.clone(), Arc::new(WebSocketConnector));
    let session = Arc::new(SessionStore::new());
    let chat = ChatService::new(backbone.link(), Arc::clone(&session), settings.pending_queue_limit);
    let contacts = ContactService::new(backbone.link());
    let login = LoginFlow::new(backbone.link(), Arc::clone(&session));
    chat.register_handlers(backbone.router())?;
    contacts.register_handlers(backbone.router())?;
    login.register_handlers(backbone.router())?;
    let flusher = chat.spawn_flush_on_connect();

    let mut connection_events = backbone.connection().subscribe();
    let mut chat_events = chat.subscribe();
    let mut login_events = login.subscribe();
    backbone.start();
    backbone.connect();
    info!(server_url = %settings.server_url, "desktop client started");

    let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(event) = connection_events.recv() => match event {
                ConnectionEvent::Connected => {
                    println!("* connected");
                    if let (Some(account), Some(password), false) =
                        (&args.account, &args.password, session.is_active())
                    {
                        if let Err(err) = login.login(account, password) {
                            warn!(%err, "login request failed");
                        }
                    }
                }
                ConnectionEvent::Disconnected => println!("* disconnected"),
                ConnectionEvent::Error(reason) => println!("! {reason}"),
                _ => {}
            },
            Ok(event) = login_events.recv() => match event {
                LoginEvent::LoggedIn(profile) => {
                    println!("* logged in as {} ({} friends)", profile.user_name, profile.friend_count);
                    if let Err(err) = contacts.request_contact_list() {
                        warn!(%err, "contact list request failed");
                    }
                }
                LoginEvent::LoginFailed(reason) => println!("! login failed: {reason}"),
                LoginEvent::FriendDetailsLoaded(details) => {
                    for friend in details {
                        println!("  friend {} {} <{}>", friend.id.0, friend.name, friend.email);
                    }
                }
                LoginEvent::LoggedOut => println!("* logged out"),
            },
            Ok(event) = chat_events.recv() => match event {
                ChatEvent::MessageReceived(message) => {
                    println!("[{}] {}: {}", message.timestamp.format("%H:%M:%S"), message.sender_name, message.content);
                }
                ChatEvent::MessageQueued(id) => println!("* queued {id}"),
                ChatEvent::PendingFlushed(ids) => println!("* flushed {} queued messages", ids.len()),
                ChatEvent::Error(reason) => println!("! {reason}"),
                _ => {}
            },
            line = next_input(&mut stdin) => {
                let line = line?;
                let Some((receiver, text)) = line.trim().split_once(' ') else {
                    println!("usage: <receiver> <text>");
                    continue;
                };
                if let Err(err) = chat.send_text(&UserId::from(receiver), text.trim()) {
                    println!("! {err}");
                }
            }
        }
    }

    login.logout();
    backbone.shutdown();
    flusher.abort();
    Ok(())
}

/// Next input line. Once the input hits EOF this never resolves, so the client
/// keeps running until Ctrl-C.
async fn next_input<R>(input: &mut Option<Lines<R>>) -> std::io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    if let Some(lines) = input {
        match lines.next_line().await? {
            Some(line) => return Ok(line),
            None => {
                info!("stdin closed, running until Ctrl-C");
                *input = None;
            }
        }
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn input_eof_parks_instead_of_ending() {
        let mut input = Some(BufReader::new(&b"u2 hello\n"[..]).lines());

        assert_eq!(next_input(&mut input).await.unwrap(), "u2 hello");
        let parked = tokio::time::timeout(Duration::from_secs(3600), next_input(&mut input)).await;
        assert!(parked.is_err());
        assert!(input.is_none());
    }
}
