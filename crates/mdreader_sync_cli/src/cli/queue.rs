//! Offline queue commands.

use mdreader_sync::SyncSession;
use mdreader_sync::queue::{DeadLetter, PendingChange};

use crate::cli::args::QueueCommands;

/// Handle all queue subcommands
pub async fn handle_queue_command(session: &SyncSession, command: QueueCommands) -> bool {
    match command {
        QueueCommands::List { json } => handle_list(session, json).await,
        QueueCommands::Flush => handle_flush(session).await,
        QueueCommands::DeadLetters { retry, discard } => {
            handle_dead_letters(session, retry, discard).await
        }
    }
}

fn describe(change: &PendingChange) -> String {
    let mut line = format!(
        "#{:<4} {:<6} {:<9} {} (workspace {}, {:?})",
        change.seq,
        change.request.operation.to_string(),
        change.request.entity_type.to_string(),
        change.request.entity_id,
        change.request.workspace_id,
        change.request.priority,
    );
    if change.attempt_count > 0 {
        line.push_str(&format!(", {} attempts", change.attempt_count));
    }
    if let Some(error) = &change.last_error {
        line.push_str(&format!(", last error: {}", error));
    }
    line
}

async fn handle_list(session: &SyncSession, json: bool) -> bool {
    let pending = session.queue().pending().await;

    if json {
        return match serde_json::to_string_pretty(&pending) {
            Ok(text) => {
                println!("{}", text);
                true
            }
            Err(e) => {
                eprintln!("✗ {}", e);
                false
            }
        };
    }

    if pending.is_empty() {
        println!("No pending changes.");
        return true;
    }
    for change in &pending {
        println!("{}", describe(change));
    }
    println!();
    println!("{} pending", pending.len());
    true
}

async fn handle_flush(session: &SyncSession) -> bool {
    if !session.queue().is_connected() {
        println!("Offline or signed out: changes stay queued.");
        return true;
    }

    match session.queue().flush().await {
        Ok(report) => {
            println!("✓ Replayed {} changes", report.replayed);
            if report.reconciled > 0 {
                println!("  {} temporary ids replaced", report.reconciled);
            }
            if report.dead_lettered > 0 {
                println!(
                    "  {} rejected (see `mdreader-sync queue dead-letters`)",
                    report.dead_lettered
                );
            }
            if report.remaining > 0 {
                println!("  {} still pending", report.remaining);
            }
            true
        }
        Err(e) => {
            eprintln!("✗ Replay failed: {}", e);
            false
        }
    }
}

fn describe_dead(letter: &DeadLetter) -> String {
    let status = letter
        .status
        .map(|s| format!("HTTP {}", s))
        .unwrap_or_else(|| "gave up".to_string());
    format!(
        "{}\n       {} at {}: {}",
        describe(&letter.change),
        status,
        letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
        letter.reason
    )
}

async fn handle_dead_letters(
    session: &SyncSession,
    retry: Option<u64>,
    discard: Option<u64>,
) -> bool {
    let queue = session.queue();

    if let Some(seq) = retry {
        return match queue.retry_dead_letter(seq).await {
            Ok(new_seq) => {
                println!("✓ Re-queued #{} as #{}", seq, new_seq);
                true
            }
            Err(e) => {
                eprintln!("✗ {}", e);
                false
            }
        };
    }

    if let Some(seq) = discard {
        return match queue.discard_dead_letter(seq).await {
            Ok(true) => {
                println!("✓ Discarded #{}", seq);
                true
            }
            Ok(false) => {
                eprintln!("✗ No dead-lettered change #{}", seq);
                false
            }
            Err(e) => {
                eprintln!("✗ {}", e);
                false
            }
        };
    }

    let letters = queue.dead_letters().await;
    if letters.is_empty() {
        println!("No dead-lettered changes.");
    }
    for letter in &letters {
        println!("{}", describe_dead(letter));
    }
    true
}
