//! Shows client configuration and whether the server is reachable.

use std::path::PathBuf;

use clap::Args;
use docsync::config::ClientConfig;
use docsync_core::check_server;

#[derive(Debug, Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn run(&self, config: &ClientConfig, config_path: Option<PathBuf>) {
        let path = config_path.unwrap_or_else(ClientConfig::default_config_path);

        println!("Docsync Configuration");
        println!("=====================");
        println!();
        if path.exists() {
            println!("Config file: {}", path.display());
        } else {
            println!("Config file: {} (not found)", path.display());
        }
        println!("Data directory: {}", config.data_dir.display());
        println!("Server URL: {}", config.server_url);
        println!(
            "API key: {}",
            if config.api_key.is_some() { "configured" } else { "not set" }
        );
        if let Some(name) = &config.client_name {
            println!("Display name: {}", name);
        }
        println!("Autosave: every {}s", config.autosave_secs);
        println!();

        if check_server(&config.server_url).await {
            println!("Server status: ✓ reachable");
        } else {
            println!("Server status: ✗ unreachable (edits will stay local)");
            println!();
            println!("To point at a server, add to your config file:");
            println!();
            println!("  server_url: \"http://localhost:8080\"");
            println!("  api_key: \"your-api-key\"");
            println!();
            println!("Or set DOCSYNC_SERVER_URL and DOCSYNC_API_KEY.");
        }
    }
}
