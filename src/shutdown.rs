//! Ctrl+C handling for CLI commands.

use std::sync::Arc;

use crawl_frontier::Frontier;

/// First Ctrl+C terminates the frontier and writes a checkpoint, then exits.
/// A second Ctrl+C exits immediately.
pub fn setup_shutdown_handler(frontier: Arc<Frontier>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nReceived Ctrl+C, checkpointing before exit...");
        eprintln!("Press Ctrl+C again to force quit");

        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nForce quit requested, exiting immediately...");
                std::process::exit(1);
            }
        });

        frontier.terminate();
        let result = tokio::task::spawn_blocking(move || {
            let checkpoint = frontier.checkpoint();
            if let Err(e) = frontier.close() {
                tracing::error!("Failed to close frontier: {}", e);
            }
            checkpoint
        })
        .await;

        match result {
            Ok(Ok(path)) => {
                eprintln!("Checkpoint saved to {}", path.display());
                std::process::exit(0);
            }
            Ok(Err(e)) => eprintln!("Failed to checkpoint: {}", e),
            Err(e) => eprintln!("Checkpoint task failed: {}", e),
        }
        std::process::exit(3);
    });
}
