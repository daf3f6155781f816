use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, AnonymousAuth, AuthProvider, SessionSynchronizer, StaticTokenAuth, SyncEvent,
};
use shared::{
    domain::{Message, MessageId, MessageRole, Session, SessionId},
    protocol::{PageQuery, SessionParams},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// TOML settings file; `RESEARCH_SYNC__*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session from a research question and follow the answer.
    Ask {
        query: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        jurisdiction: Option<String>,
        /// Exit right after creating instead of following the stream.
        #[arg(long)]
        no_follow: bool,
    },
    Show {
        session_id: String,
    },
    Send {
        session_id: String,
        content: String,
        #[arg(long)]
        no_follow: bool,
    },
    /// Follow a session's stream until interrupted.
    Tail {
        session_id: String,
    },
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let cli = Cli::parse();

    let settings = load_settings(cli.config.as_deref());
    let auth: Arc<dyn AuthProvider> = match cli.token {
        Some(token) => Arc::new(StaticTokenAuth::new(token)),
        None => Arc::new(AnonymousAuth),
    };
    let sync = SessionSynchronizer::from_settings(&settings, auth)
        .await
        .context("failed to start the sync engine")?;

    match cli.command {
        Command::Ask {
            query,
            title,
            tags,
            jurisdiction,
            no_follow,
        } => {
            let params = SessionParams {
                title,
                tags: tags.into_iter().collect(),
                jurisdiction,
            };
            let session = sync.create_session(&query, params).await?;
            println!("created session {}", session.id);
            if !no_follow {
                follow(&sync, &session).await;
            }
        }
        Command::Show { session_id } => {
            let session = sync.load_session(SessionId::new(session_id)).await?;
            sync.disconnect_stream();
            print_header(&session);
            for message in &session.messages {
                print_message(message);
            }
        }
        Command::Send {
            session_id,
            content,
            no_follow,
        } => {
            sync.load_session(SessionId::new(session_id)).await?;
            let session = sync
                .send_message(&content)
                .await
                .context("message was not accepted")?;
            if let Some(sent) = session.messages.last() {
                print_message(sent);
            }
            if !no_follow {
                follow(&sync, &session).await;
            }
        }
        Command::Tail { session_id } => {
            let session = sync.load_session(SessionId::new(session_id)).await?;
            print_header(&session);
            for message in &session.messages {
                print_message(message);
            }
            follow(&sync, &session).await;
        }
        Command::List { page, limit } => {
            let listing = sync.list_sessions(PageQuery { page, limit }).await?;
            for summary in &listing.sessions {
                println!(
                    "{}  {:<20}  {:>3} msgs  {}",
                    summary.id,
                    format!("{:?}", summary.status),
                    summary.message_count,
                    summary.title
                );
            }
            println!(
                "page {} of {} sessions{}",
                listing.page,
                listing.total,
                if listing.has_more { ", more available" } else { "" }
            );
        }
    }

    sync.teardown();
    Ok(())
}

/// Prints finished messages as they arrive until ctrl-c or the stream gives up.
async fn follow(sync: &Arc<SessionSynchronizer>, initial: &Session) {
    let mut printed: HashSet<MessageId> = initial
        .messages
        .iter()
        .map(|message| message.id.clone())
        .collect();
    let mut events = sync.subscribe();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => return,
        };
        match event {
            Ok(SyncEvent::SessionUpdated(Some(session))) => {
                for message in &session.messages {
                    let finished = !message.streaming && !message.id.is_temporary();
                    if finished && printed.insert(message.id.clone()) {
                        print_message(message);
                    }
                }
            }
            Ok(SyncEvent::SessionUpdated(None)) => return,
            Ok(SyncEvent::ConnectionStateChanged(state)) => {
                eprintln!("[connection: {state:?}]");
            }
            Ok(SyncEvent::Error(err)) => {
                eprintln!("[error: {err}]");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "research_cli: event receiver lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn print_header(session: &Session) {
    println!("# {} ({:?})", session.title, session.status);
    println!("  {}", session.query);
}

fn print_message(message: &Message) {
    let role = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    };
    println!("[{}] {role}: {}", message.sequence, message.text());
    for citation in &message.content.citations {
        println!("      - {} <{}>", citation.text, citation.url);
    }
}
