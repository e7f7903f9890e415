use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use parley::config::APP_ID;
use parley::models::Role;
use parley::providers::WebhookResponder;
use parley::services::directory::group_by_day;
use parley::services::{ChangeNotifier, ConversationDirectory, ConversationStore, Database};
use parley::{AppConfig, SendOutcome, Snapshot, SyncError, SyncStatus, Synchronizer};

enum Command {
    Send(String),
    Rename(String),
    Delete,
    List,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Command {
        match line.trim() {
            "/quit" => Command::Quit,
            "/delete" => Command::Delete,
            "/list" => Command::List,
            "/rename" => Command::Rename(String::new()),
            other => match other.strip_prefix("/rename ") {
                Some(title) => Command::Rename(title.to_string()),
                None => Command::Send(line.to_string()),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::from_env()?;
    let db = Database::open(&config.database_path)
        .await
        .context("Failed to open conversation database")?;
    tracing::info!(
        app = APP_ID,
        database = %config.database_path.display(),
        responder = %config.responder_url,
        "Starting"
    );

    let store: Arc<dyn ConversationStore> = Arc::new(db.clone());
    let changes: Arc<dyn ChangeNotifier> = Arc::new(db.changes());
    let directory = ConversationDirectory::new(store.clone(), changes.clone());
    let sync = Synchronizer::new(
        store,
        changes,
        Arc::new(WebhookResponder::new(config.responder_url.clone())),
    );

    let conversation_id = match std::env::args().nth(1) {
        Some(id) => id,
        None => directory.new_conversation(&config.user_id).await?.id,
    };
    sync.open(&conversation_id, &config.user_id).await?;

    let printer = tokio::spawn(print_snapshots(sync.watch()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Quit => break,
            Command::Send(text) => {
                let sync = sync.clone();
                tokio::spawn(async move {
                    match sync.send_message(&text).await {
                        Ok(SendOutcome::Degraded(e)) => eprintln!("! responder unavailable: {}", e),
                        Ok(_) => {}
                        Err(SyncError::Busy) => eprintln!("! still waiting for the last reply"),
                        Err(e) => eprintln!("! {}", e),
                    }
                });
            }
            Command::Rename(title) => {
                if let Err(e) = sync.rename_conversation(&title).await {
                    eprintln!("! {}", e);
                }
            }
            Command::Delete => match sync.delete_conversation().await {
                Ok(()) => break,
                Err(e) => eprintln!("! {}", e),
            },
            Command::List => print_directory(&directory, &config.user_id).await,
        }
    }

    sync.close();
    printer.abort();
    Ok(())
}

async fn print_snapshots(mut rx: watch::Receiver<Snapshot>) {
    loop {
        let snapshot = rx.borrow_and_update().clone();
        print_snapshot(&snapshot);
        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    match &snapshot.status {
        SyncStatus::Closed => return,
        SyncStatus::Loading => {
            println!("Loading…");
            return;
        }
        SyncStatus::Deleted => {
            println!("This conversation was deleted.");
            return;
        }
        SyncStatus::Failed(reason) => {
            println!("Could not load conversation: {}", reason);
            return;
        }
        SyncStatus::Ready => {}
    }

    println!();
    println!("== {} ==", snapshot.title().unwrap_or_default());
    for group in snapshot.groups() {
        let speaker = match group.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
        };
        for (leader, message) in group.iter() {
            if leader {
                let time = message.created_at.with_timezone(&Local).format("%H:%M");
                println!("{} [{}]", speaker, time);
            }
            for line in message.content.lines() {
                println!("    {}", line);
            }
        }
    }
    if snapshot.sending {
        println!("    …");
    }
}

async fn print_directory(directory: &ConversationDirectory, user_id: &str) {
    let conversations = match directory.list(user_id).await {
        Ok(conversations) => conversations,
        Err(e) => {
            eprintln!("! {}", e);
            return;
        }
    };
    for (day, conversations) in group_by_day(conversations) {
        println!("{}", day.format("%A, %B %-d"));
        for conversation in conversations {
            let pin = if conversation.pinned { "*" } else { " " };
            println!(" {} {}  {}", pin, conversation.title, conversation.id);
        }
    }
}
