//! The `env` command.

use mdreader_sync::SyncSession;

/// Print the environment snapshot, storage usage and what the policy allows.
pub async fn handle_env(session: &SyncSession) -> bool {
    let env = session.current_environment();
    let config = session.documents().config();

    println!("Environment");
    println!("===========");
    println!();
    println!("Platform: {:?}", env.platform);
    println!("Network: {:?}", env.network);
    match &env.user_id {
        Some(user) => println!("Auth: {:?} ({})", env.auth, user),
        None => println!("Auth: {:?}", env.auth),
    }
    println!("Device: {}", env.device_id);
    println!();

    println!(
        "Sync server: {}",
        config.sync_server_url.as_deref().unwrap_or("(not configured)")
    );
    println!(
        "API: {}",
        config.api_base_url.as_deref().unwrap_or("(not configured)")
    );

    match session.documents().storage() {
        Ok(storage) => match storage.get_info().await {
            Ok(info) => println!(
                "Storage: {} ({} of {} bytes used)",
                info.backend, info.used, info.total
            ),
            Err(e) => println!("Storage: {} (usage unavailable: {})", storage.backend(), e),
        },
        Err(e) => {
            eprintln!("✗ {}", e);
            return false;
        }
    }
    println!();

    let replicate = env.should_use_cloud_sync() && config.enable_cloud_sync;
    println!(
        "Document replication: {}",
        if replicate { "on" } else { "off" }
    );
    if !config.enable_cloud_sync {
        println!("  (disabled in config)");
    }
    println!(
        "Queue replay: {}",
        if session.queue().is_connected() {
            "on"
        } else {
            "off"
        }
    );
    true
}
