//! `warden serve`: Start the HTTP gateway.

use warden_config::AppConfig;

pub async fn run(mut config: AppConfig, port_override: Option<u16>) -> anyhow::Result<bool> {
    if let Some(port) = port_override {
        config.server.port = port;
    }

    println!("🛡️  Warden Gateway");
    println!("   Listening:  {}:{}", config.server.host, config.server.port);
    println!("   Audit log:  {}", config.audit.resolved_path().display());
    println!("   Vault:      {}", config.vault.resolved_path().display());
    println!(
        "   Auth:       {}",
        if config.server.bearer_tokens().is_empty() {
            "disabled (no tokens)"
        } else {
            "bearer token"
        }
    );

    warden_gateway::start(config).await?;
    Ok(true)
}
