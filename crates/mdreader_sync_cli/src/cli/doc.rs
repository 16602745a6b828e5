//! Document commands.

use std::io::{self, Read, Write};
use std::time::Duration;

use mdreader_sync::SyncSession;

use crate::cli::args::DocCommands;

/// Handle all doc subcommands
pub async fn handle_doc_command(session: &SyncSession, command: DocCommands) -> bool {
    match command {
        DocCommands::Show { id, info } => handle_show(session, &id, info).await,
        DocCommands::Append { id, text, linger } => {
            handle_append(session, &id, text, linger).await
        }
    }
}

async fn handle_show(session: &SyncSession, id: &str, info: bool) -> bool {
    let handle = match session.documents().get_document(id).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("✗ Error opening '{}': {}", id, e);
            return false;
        }
    };

    if info {
        let status = handle.status();
        println!("Id: {}", handle.id());
        println!("Storage key: {}", handle.storage_key());
        println!("Title: {}", handle.title().unwrap_or_default());
        println!(
            "Replication: {}",
            match handle.replication_target() {
                Some(target) => format!(
                    "{} room {} (connected: {}, synced: {})",
                    target.endpoint, target.room, status.connected, status.synced
                ),
                None => "off".to_string(),
            }
        );
        println!();
    }

    print!("{}", handle.content());
    let _ = io::stdout().flush();
    true
}

async fn handle_append(session: &SyncSession, id: &str, text: Option<String>, linger: u64) -> bool {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            if let Err(e) = io::stdin().read_to_string(&mut buffer) {
                eprintln!("✗ Failed to read from stdin: {}", e);
                return false;
            }
            buffer
        }
    };

    let handle = match session.documents().get_document(id).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("✗ Error opening '{}': {}", id, e);
            return false;
        }
    };

    if let Err(e) = handle.insert_text(handle.content_len(), &text) {
        eprintln!("✗ Error editing '{}': {}", id, e);
        return false;
    }
    if let Err(e) = handle.flush().await {
        eprintln!("✗ Error saving '{}': {}", id, e);
        return false;
    }

    if linger > 0 && handle.is_replicating() {
        let mut status = handle.watch_status();
        let synced = matches!(
            tokio::time::timeout(Duration::from_secs(linger), status.wait_for(|s| s.synced)).await,
            Ok(Ok(_))
        );
        if !synced {
            println!("Replication did not finish; the edit is saved locally.");
        } else {
            // Give the update frame time to leave the socket
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    println!("✓ Appended {} characters to {}", text.chars().count(), id);
    true
}
