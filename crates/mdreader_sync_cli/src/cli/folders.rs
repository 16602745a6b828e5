//! Folder commands.

use mdreader_sync::SyncSession;
use mdreader_sync::folders::{CachedFolder, FolderUpdate, FolderWrite, NewFolder, WriteOutcome};
use mdreader_sync::queue::Enqueued;

use crate::cli::args::FolderCommands;

/// Handle all folder subcommands
pub async fn handle_folder_command(session: &SyncSession, command: FolderCommands) -> bool {
    let folders = session.folders();

    let result = match command {
        FolderCommands::List { workspace } => return handle_list(session, &workspace).await,

        FolderCommands::Create {
            workspace,
            name,
            parent,
            icon,
            color,
        } => {
            let mut new = NewFolder::named(name);
            new.parent_id = parent;
            new.icon = icon;
            new.color = color;
            folders.create_folder(&workspace, new).await.map(report_write)
        }

        FolderCommands::Rename {
            workspace,
            id,
            name,
        } => folders
            .update_folder(&workspace, &id, FolderUpdate::rename(name))
            .await
            .map(report_write),

        FolderCommands::Move {
            workspace,
            id,
            parent,
            position,
        } => folders
            .move_folder(&workspace, &id, parent.as_deref(), position)
            .await
            .map(report_write),

        FolderCommands::Delete { workspace, id } => {
            folders.delete_folder(&workspace, &id).await.map(|outcome| {
                println!("✓ Deleted {}{}", id, outcome_suffix(&outcome));
            })
        }

        FolderCommands::Refresh { workspace } => {
            if !session.queue().is_connected() {
                println!("Offline or signed out: showing the local cache.");
            }
            folders.refresh(&workspace).await.map(|all| {
                println!("✓ {} folders in {}", all.len(), workspace);
            })
        }
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            eprintln!("✗ {}", e);
            false
        }
    }
}

fn outcome_suffix(outcome: &WriteOutcome) -> String {
    match outcome {
        WriteOutcome::Synced => String::new(),
        WriteOutcome::Queued(Enqueued::Queued(seq)) => format!(" (queued as #{})", seq),
        WriteOutcome::Queued(Enqueued::Cancelled { removed }) => {
            format!(" (never synced, dropped {} queued changes)", removed)
        }
    }
}

fn report_write(write: FolderWrite) {
    println!(
        "✓ {} {}{}",
        write.folder.id,
        write.folder.name,
        outcome_suffix(&write.outcome)
    );
}

async fn handle_list(session: &SyncSession, workspace: &str) -> bool {
    let all = match session.folders().all_folders(workspace).await {
        Ok(all) => all,
        Err(e) => {
            eprintln!("✗ {}", e);
            return false;
        }
    };
    if all.is_empty() {
        println!("No folders in {}.", workspace);
        return true;
    }
    print_tree(&all, None, 0);
    true
}

fn print_tree(all: &[CachedFolder], parent: Option<&str>, depth: usize) {
    let mut children: Vec<&CachedFolder> = all
        .iter()
        .filter(|f| f.parent_id.as_deref() == parent)
        .collect();
    children.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));

    for folder in children {
        println!(
            "{}{} {}  [{}]{}",
            "  ".repeat(depth),
            folder.icon.as_deref().unwrap_or(" "),
            folder.name,
            folder.id,
            if folder.pending_changes { " *" } else { "" }
        );
        print_tree(all, Some(&folder.id), depth + 1);
    }
}
