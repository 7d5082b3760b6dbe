use std::path::PathBuf;

use netshare::{NodeConfig, NodeService};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("netshare.json"));
    let data_dir = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let _logging = match netshare::infrastructure::logging::init_logging(&data_dir) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("logging init failed: {error}");
            std::process::exit(1);
        }
    };

    let config = match NodeConfig::load(&config_path) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(
                event = "config_load_failed",
                path = config_path.display().to_string(),
                code = error.code,
                message = error.message
            );
            std::process::exit(1);
        }
    };

    let node = match NodeService::new(config) {
        Ok(node) => node,
        Err(error) => {
            tracing::error!(event = "node_init_failed", code = error.code, message = error.message);
            std::process::exit(1);
        }
    };

    if let Err(error) = node.start().await {
        tracing::error!(
            event = "node_start_failed",
            code = error.code,
            message = error.message,
            detail = error.detail.unwrap_or_default()
        );
        std::process::exit(1);
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(event = "signal_wait_failed", error = error.to_string());
    }
    node.stop();
}
