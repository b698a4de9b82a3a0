use tracing::{error, info};
use work_queue_cli::run_cli;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        if tracing::dispatcher::has_been_set() {
            error!("CLI error: {}", e);
            if let Some(delay) = e.retry_after() {
                info!(retry_after_ms = delay.as_millis() as u64, "Transient failure, retry later");
            }
        } else {
            eprintln!("CLI error: {}", e);
        }

        std::process::exit(e.exit_code());
    }
}
