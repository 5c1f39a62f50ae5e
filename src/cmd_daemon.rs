use crate::args::Commands;
use anyhow::{Context, Result};
use fwdkeeper::clienv;
use fwdkeeper::daemon::protocol::DaemonStatus;
use fwdkeeper::daemon::server::ServerConfig;
use fwdkeeper::daemon::{DaemonClient, DaemonServer};
use fwdkeeper::Config;
use std::path::{Path, PathBuf};

pub async fn cmd_daemon(command: Commands, config: Option<PathBuf>) -> Result<()> {
    let config_path = config
        .map(|p| std::path::absolute(&p).unwrap_or(p))
        .unwrap_or_else(clienv::config_path);

    // Every command addresses the instance of this project's configuration.
    let (config, suffix) = clienv::load_instance(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let client = DaemonClient::for_instance(&suffix);

    match command {
        Commands::Run => cmd_daemon_run(config_path, config, &suffix).await,
        Commands::Start { profile } => {
            cmd_daemon_start(&client, &config_path, &suffix, profile).await
        }
        Commands::Stop { profile } => cmd_daemon_stop(&client, profile).await,
        Commands::Status => cmd_daemon_status(&client).await,
        Commands::Reload => cmd_daemon_reload(&client).await,
        Commands::Logs { lines } => cmd_daemon_logs(&client, lines).await,
        Commands::Ping => cmd_daemon_ping(&client).await,
    }
}

async fn cmd_daemon_run(config_path: PathBuf, config: Config, suffix: &str) -> Result<()> {
    let paths = ServerConfig::from_env(config_path, suffix);

    println!("Running daemon in foreground (Ctrl+C to stop)");
    println!("  Config: {}", paths.config_path.display());
    println!("  Domain: {}", suffix);
    println!("  Socket: {}", paths.socket_path.display());
    println!("  PID:    {}", paths.pid_path.display());
    println!();

    DaemonServer::new(paths, config).run().await?;
    Ok(())
}

async fn cmd_daemon_start(
    client: &DaemonClient,
    config_path: &Path,
    suffix: &str,
    profile: Option<String>,
) -> Result<()> {
    if client.is_running().await {
        client.start(profile.clone()).await?;
        match profile {
            Some(name) => println!("Profile '{}' enabled", name),
            None => println!("All profiles enabled"),
        }
        return Ok(());
    }

    println!("Starting daemon for {}...", suffix);
    client.ensure_running(config_path, &clienv::log_path(suffix)).await?;
    if let Some(name) = profile {
        client.start(Some(name)).await?;
    }

    let (_uptime, version) = client.ping().await?;
    println!(
        "Daemon started (v{}, PID written to {})",
        version,
        clienv::pid_path(suffix).display()
    );
    Ok(())
}

async fn cmd_daemon_stop(client: &DaemonClient, profile: Option<String>) -> Result<()> {
    if !client.is_running().await {
        println!("Daemon is not running");
        return Ok(());
    }

    if let Some(name) = profile {
        client.stop(Some(name.clone())).await?;
        println!("Profile '{}' disabled", name);
        return Ok(());
    }

    println!("Stopping daemon gracefully...");
    client.stop(None).await?;

    // Wait for daemon to actually stop
    for _ in 0..200 {
        if !client.socket_exists() {
            println!("Daemon stopped");
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    println!("Daemon may still be stopping (check with `fwdkeeper status`)");
    Ok(())
}

async fn cmd_daemon_status(client: &DaemonClient) -> Result<()> {
    if !client.socket_exists() {
        println!("Status: not running");
        println!("Run `fwdkeeper start` to start the daemon");
        return Ok(());
    }

    match client.status().await {
        Ok(status) => print!("{}", render_status(&status)),
        Err(e) => {
            println!("Status: unhealthy (socket exists but not responding)");
            println!("Error: {}", e);
        }
    }
    Ok(())
}

async fn cmd_daemon_reload(client: &DaemonClient) -> Result<()> {
    client.reload().await.context("Reload rejected")?;
    println!("Configuration reloaded");
    Ok(())
}

async fn cmd_daemon_logs(client: &DaemonClient, lines: u32) -> Result<()> {
    for line in client.logs(lines).await? {
        println!("{}", line);
    }
    Ok(())
}

async fn cmd_daemon_ping(client: &DaemonClient) -> Result<()> {
    let (uptime, version) = client.ping().await?;
    println!("pong (v{}, uptime: {})", version, format_duration(uptime));
    Ok(())
}

fn render_status(status: &DaemonStatus) -> String {
    use std::fmt::Write;

    let engine = &status.engine;
    let mut out = String::new();
    let _ = writeln!(out, "Daemon   v{}, uptime {}", status.version, format_duration(status.uptime_secs));
    let _ = writeln!(out, "Domain   {} ({})", status.domain_suffix, status.domain_source);
    let _ = writeln!(
        out,
        "Engine   {}  pid {}  uptime {}  restarts {}",
        format_state(&engine.state),
        engine.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        engine.uptime_secs.map(format_duration).unwrap_or_else(|| "-".to_string()),
        engine.restarts,
    );
    let _ = writeln!(out, "API      {}", engine.endpoint);
    if let Some(err) = &engine.last_error {
        let _ = writeln!(out, "Error    {}", err);
    }

    for profile in &status.profiles {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} [{}]",
            profile.name,
            if profile.enabled { "enabled" } else { "disabled" }
        );
        for ns in &profile.namespaces {
            let _ = writeln!(out, "  {:<24} {}", ns.namespace, format_state(&ns.status));
            if let Some(err) = &ns.last_error {
                let _ = writeln!(out, "    ! {}", err);
            }
            for svc in &ns.services {
                let _ = writeln!(
                    out,
                    "    {:<22} {:<13} {:>8}  reconnects {}",
                    svc.name,
                    format_state(&svc.status),
                    svc.uptime_secs.map(format_duration).unwrap_or_else(|| "-".to_string()),
                    svc.reconnects,
                );
                if let Some(err) = &svc.last_error {
                    let _ = writeln!(out, "      ! {}", err);
                }
            }
        }
    }
    out
}

fn format_state(state: &str) -> String {
    match state {
        "failed" | "crashed" => state.to_uppercase(),
        other => other.to_string(),
    }
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwdkeeper::daemon::protocol::{EngineInfo, NamespaceInfo, ProfileInfo, ServiceInfo};

    #[test]
    fn durations() {
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(7260), "2h 1m");
        assert_eq!(format_duration(90000), "1d 1h");
    }

    #[test]
    fn status_lists_services_under_namespaces() {
        let status = DaemonStatus {
            version: "0.3.0".into(),
            uptime_secs: 5,
            domain_suffix: "fk-0badc0de".into(),
            domain_source: "auto".into(),
            engine: EngineInfo {
                state: "running".into(),
                pid: Some(4242),
                uptime_secs: Some(3),
                endpoint: "http://127.0.0.1:18765".into(),
                restarts: 1,
                last_error: None,
            },
            profiles: vec![ProfileInfo {
                name: "shop".into(),
                enabled: true,
                namespaces: vec![NamespaceInfo {
                    namespace: "web".into(),
                    status: "added".into(),
                    last_error: None,
                    services: vec![ServiceInfo {
                        name: "api".into(),
                        status: "failed".into(),
                        uptime_secs: None,
                        reconnects: 4,
                        last_error: Some("retries exhausted".into()),
                    }],
                }],
            }],
        };
        let out = render_status(&status);
        assert!(out.contains("fk-0badc0de (auto)"));
        assert!(out.contains("pid 4242"));
        assert!(out.contains("shop [enabled]"));
        assert!(out.contains("FAILED"));
        assert!(out.contains("! retries exhausted"));
    }
}
