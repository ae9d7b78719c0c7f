//! Hostlink Shell - manual end-to-end driver for the hostlink control plane.
//!
//! `hostlink-shell host` creates host channels, spawns this binary once per
//! channel as a client and supervises the children until Ctrl-C.
//! `hostlink-shell client --channel <token>` joins a channel, creates a profile,
//! pushes configuration to it and exits.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hostlink_core::{
    ClientPeer, ControlLoop, HostConfig, HostContext, HostHandle, ProfileFlags, ProfileProxy,
    ProxyConfig, ProxyType, SpellCheckConfig, ThreadMode,
};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Switch carrying the profile data directory to clients.
const DATA_DIR_SWITCH: &str = "user-data-dir";
/// Switch carrying a `host:port` HTTP proxy to clients.
const PROXY_SWITCH: &str = "proxy-server";
/// Switch carrying the spell-check language to clients.
const LANG_SWITCH: &str = "lang";

#[derive(Parser, Debug)]
#[command(name = "hostlink-shell")]
#[command(about = "Runs a hostlink host and spawns itself as its client")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Create channels and supervise spawned clients
    Host {
        /// Threading arrangement (original, renderer-main)
        #[arg(long, default_value = "original", value_parser = parse_thread_mode)]
        thread_mode: ThreadMode,

        /// Seconds a spawned client has to connect
        #[arg(long, default_value = "30")]
        connect_timeout: u64,

        /// Number of clients to spawn
        #[arg(long, default_value = "1")]
        clients: usize,

        /// Profile data directory handed to clients (incognito when absent)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Extra switch handed to clients, as key=value
        #[arg(long = "switch", value_parser = parse_switch)]
        switches: Vec<(String, String)>,

        /// Exit once every client is gone (renderer-main only)
        #[arg(long)]
        exit_when_idle: bool,
    },

    /// Join a channel and configure a profile
    Client {
        /// Channel token produced by the host
        #[arg(long)]
        channel: String,
    },
}

fn parse_thread_mode(s: &str) -> std::result::Result<ThreadMode, String> {
    ThreadMode::from_str(s).ok_or_else(|| format!("unknown thread mode: {}", s))
}

fn parse_switch(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", s)),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Mode::Host {
            thread_mode,
            connect_timeout,
            clients,
            data_dir,
            switches,
            exit_when_idle,
        } => {
            let mut config = HostConfig::default()
                .with_thread_mode(thread_mode)
                .with_connect_timeout(Duration::from_secs(connect_timeout));
            if let Some(dir) = data_dir {
                config = config.with_switch(DATA_DIR_SWITCH, dir.to_string_lossy());
            }
            for (key, value) in switches {
                config = config.with_switch(key, value);
            }
            run_host(config, clients, args.debug, exit_when_idle).await
        }
        Mode::Client { channel } => run_client(&channel).await,
    }
}

async fn run_host(config: HostConfig, clients: usize, debug: bool, exit_when_idle: bool) -> Result<()> {
    info!("Starting hostlink host ({})", config.thread_mode);
    let timeout = config.connect_timeout;
    let mut children = Vec::with_capacity(clients);

    match config.thread_mode.control_loop() {
        ControlLoop::CallerThread => {
            let mut host = HostContext::new(config)?;
            for _ in 0..clients {
                let created = host.create_host_channel(timeout)?;
                children.push(spawn_client(&created.channel_info, debug)?);
            }

            if exit_when_idle {
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        running = host.process_next() => {
                            if !running || host.peer_count() == 0 {
                                break;
                            }
                        }
                    }
                }
            } else {
                host.run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
            }
            host.shutdown();
        }
        ControlLoop::DedicatedThread => {
            if exit_when_idle {
                warn!("--exit-when-idle is ignored with a dedicated control thread");
            }
            let handle = HostHandle::spawn(config)?;
            for _ in 0..clients {
                let created = handle.create_host_channel(timeout).await?;
                children.push(spawn_client(&created.channel_info, debug)?);
            }

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            tokio::task::spawn_blocking(move || handle.shutdown()).await?;
        }
    }

    for mut child in children {
        match child.try_wait() {
            Ok(Some(status)) => info!("Client {} exited with {}", child.id(), status),
            Ok(None) => {
                warn!("Client {} still running, killing it", child.id());
                let _ = child.kill();
                let _ = child.wait();
            }
            Err(e) if already_reaped(&e) => debug!("Client {} already exited", child.id()),
            Err(e) => error!("Failed to query client {}: {}", child.id(), e),
        }
    }
    Ok(())
}

/// The host's watchdog reaps exited clients itself, after which waiting on
/// them fails with `ECHILD`.
fn already_reaped(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::errno::Errno::ECHILD as i32)
    }

    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

fn spawn_client(channel_info: &str, debug: bool) -> Result<Child> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut command = Command::new(exe);
    command.arg("client").arg("--channel").arg(channel_info);
    if debug {
        command.arg("--debug");
    }
    let child = command.spawn().context("failed to spawn client")?;
    info!("Spawned client process {}", child.id());
    Ok(child)
}

async fn run_client(channel: &str) -> Result<()> {
    let mut client = ClientPeer::connect(channel).await?;
    client.set_error_handler(Box::new(|reason| {
        error!("Channel to host failed (reason {}), exiting", reason);
        std::process::exit(1);
    }));

    let host_pid = client.wait_connected().await?;
    info!("Connected to host process {}", host_pid);

    let token = client.token().clone();
    let data_dir = token.switch(DATA_DIR_SWITCH).unwrap_or("");
    let persistent = !data_dir.is_empty();
    let profile = ProfileProxy::create(
        &mut client,
        data_dir,
        ProfileFlags {
            disk_cache_enabled: persistent,
            cookie_persistence_enabled: persistent,
        },
    )?;

    match token.switch(PROXY_SWITCH) {
        Some(server) => {
            let (host, port) = parse_proxy_server(server)?;
            profile.set_proxy_config(ProxyConfig::default().with_http_proxy(ProxyType::Http, host, port))?;
        }
        None => profile.use_system_proxy_config()?,
    }
    if let Some(lang) = token.switch(LANG_SWITCH) {
        profile.set_spellcheck_config(SpellCheckConfig::enabled([lang.to_string()]))?;
    }

    client.sync(false).await?;
    info!("Profile configured at routing id {}", profile.routing_id());

    profile.destroy()?;
    client.sync(true).await?;
    Ok(())
}

fn parse_proxy_server(server: &str) -> Result<(&str, u16)> {
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("proxy server must be host:port, got {:?}", server))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid proxy port in {:?}", server))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_switch() {
        assert_eq!(
            parse_switch("lang=en").unwrap(),
            ("lang".to_string(), "en".to_string())
        );
        assert_eq!(
            parse_switch("empty=").unwrap(),
            ("empty".to_string(), String::new())
        );
        assert!(parse_switch("novalue").is_err());
        assert!(parse_switch("=x").is_err());
    }

    #[test]
    fn test_parse_proxy_server() {
        assert_eq!(parse_proxy_server("proxy.local:3128").unwrap(), ("proxy.local", 3128));
        assert!(parse_proxy_server("proxy.local").is_err());
        assert!(parse_proxy_server("proxy.local:http").is_err());
    }

    #[test]
    fn test_args_parse_host() {
        let args = Args::try_parse_from([
            "hostlink-shell",
            "--debug",
            "host",
            "--thread-mode",
            "renderer-main",
            "--switch",
            "lang=en",
            "--clients",
            "2",
        ])
        .unwrap();
        assert!(args.debug);
        match args.command {
            Mode::Host {
                thread_mode,
                clients,
                switches,
                ..
            } => {
                assert_eq!(thread_mode, ThreadMode::RendererMain);
                assert_eq!(clients, 2);
                assert_eq!(switches, vec![("lang".to_string(), "en".to_string())]);
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_reaped_child_is_not_an_error() {
        let echild = std::io::Error::from_raw_os_error(nix::errno::Errno::ECHILD as i32);
        assert!(already_reaped(&echild));
        let other = std::io::Error::from_raw_os_error(nix::errno::Errno::EPERM as i32);
        assert!(!already_reaped(&other));
    }

    #[cfg(unix)]
    #[test]
    fn test_try_wait_after_foreign_reap_reports_echild() {
        use nix::sys::wait::waitpid;
        use nix::unistd::Pid;

        let mut child = Command::new("true").spawn().unwrap();
        waitpid(Pid::from_raw(child.id() as i32), None).unwrap();

        let err = child.try_wait().unwrap_err();
        assert!(already_reaped(&err));
    }

    #[test]
    fn test_args_reject_unknown_thread_mode() {
        assert!(Args::try_parse_from(["hostlink-shell", "host", "--thread-mode", "bogus"]).is_err());
    }
}
