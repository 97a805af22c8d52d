use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tokio::net::UdpSocket;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use osc_relay::client::ClientStatus;
use osc_relay::config::DEFAULT_LOCAL_OSC_PORT;
use osc_relay::forward::OscForwarder;
use osc_relay::hub::ReceiverSummary;
use osc_relay::osc::OscMessage;
use osc_relay::{server, ClientConfig, Destination, EventValue, HubConfig, RelayClient};

#[derive(Parser)]
#[command(name = "osc-relay")]
#[command(about = "Relay OSC control events from a hub to named remote receivers", version)]
#[command(after_help = "Typical setup:
- Run `osc-relay serve` next to the control surface
- Run `osc-relay client --server ws://HUB:7401 --local-ip 127.0.0.1 --local-port 57120` on every machine that should receive events
- Watch and manage receivers with `osc-relay receivers` and `osc-relay disconnect <id>`")]
struct Cli {
    /// Log filter, e.g. `info` or `osc_relay=debug`. RUST_LOG wins if set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write daily-rotated log files to this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay hub
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Accepted API key (repeatable)
        #[arg(long = "api-key", value_name = "KEY")]
        api_keys: Vec<String>,
    },

    /// Run a receiver that registers with a hub
    Client {
        /// Hub address, e.g. ws://hub.local:7401/ws
        #[arg(short, long, env = "RELAY_SERVER")]
        server: Option<String>,

        /// Display name (defaults to this machine's host name)
        #[arg(short, long, env = "RELAY_NAME")]
        name: Option<String>,

        #[arg(long, env = "RELAY_API_KEY")]
        api_key: Option<String>,

        /// Forward received events to this local OSC host
        #[arg(long, env = "LOCAL_OSC_IP", requires = "local_port")]
        local_ip: Option<String>,

        /// Forward received events to this local OSC port
        #[arg(long, env = "LOCAL_OSC_PORT", requires = "local_ip")]
        local_port: Option<u16>,

        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Publish one value through a running hub
    Send {
        /// OSC address, e.g. /mass/tile1
        address: String,

        #[arg(default_value_t = 1.0)]
        value: f64,

        #[command(flatten)]
        hub: HubArgs,
    },

    /// List receivers registered with a running hub
    Receivers {
        #[command(flatten)]
        hub: HubArgs,
    },

    /// Disconnect a receiver from a running hub
    Disconnect {
        receiver_id: String,

        #[command(flatten)]
        hub: HubArgs,
    },

    /// Print OSC packets arriving on a local UDP port
    Listen {
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,

        #[arg(short, long, default_value_t = DEFAULT_LOCAL_OSC_PORT)]
        port: u16,
    },

    /// Send `/test 1` to a local OSC endpoint
    TestForward {
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,

        #[arg(long, default_value_t = DEFAULT_LOCAL_OSC_PORT)]
        port: u16,
    },
}

#[derive(clap::Args)]
struct HubArgs {
    /// Hub HTTP address
    #[arg(long = "hub", env = "RELAY_HTTP", default_value = "http://localhost:7401")]
    url: String,

    #[arg(long, env = "RELAY_API_KEY")]
    api_key: Option<String>,
}

impl HubArgs {
    fn request(&self, client: &reqwest::Client, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.url.trim_end_matches('/'), path);
        let builder = client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header(server::api::API_KEY_HEADER, key),
            None => builder,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_logging(&cli.log_level, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            config,
            api_keys,
        } => {
            let mut config = HubConfig::load(config.as_deref())?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if !api_keys.is_empty() {
                config.api_keys = api_keys;
            }
            config.validate()?;

            println!("{}", "🛰  Starting OSC relay hub...".cyan().bold());
            server::start(config).await?;
        }

        Commands::Client {
            server,
            name,
            api_key,
            local_ip,
            local_port,
            config,
        } => {
            let mut config = ClientConfig::load(config.as_deref())?;
            if let Some(server) = server {
                config.server = server;
            }
            if let Some(name) = name {
                config.name = name;
            }
            if api_key.is_some() {
                config.api_key = api_key;
            }
            config.set_local_forward(local_ip, local_port)?;
            run_client(config).await?;
        }

        Commands::Send { address, value, hub } => {
            let client = reqwest::Client::new();
            let response = hub
                .request(&client, reqwest::Method::POST, "/api/send")
                .json(&serde_json::json!({ "address": address, "value": value }))
                .send()
                .await
                .context("failed to reach hub")?;
            let status = response.status();
            let body: serde_json::Value = response.json().await.context("invalid hub response")?;
            if !status.is_success() {
                bail!("hub refused: {}", body["message"].as_str().unwrap_or("unknown error"));
            }
            println!(
                "{} Sent {} {} to {} receiver(s)",
                "✓".green(),
                address.bright_white(),
                value,
                body["delivered"]
            );
        }

        Commands::Receivers { hub } => {
            let client = reqwest::Client::new();
            let response = hub
                .request(&client, reqwest::Method::GET, "/api/receivers")
                .send()
                .await
                .context("failed to reach hub")?
                .error_for_status()?;
            let receivers: Vec<ReceiverSummary> = response.json().await?;
            print_receivers(&receivers);
        }

        Commands::Disconnect { receiver_id, hub } => {
            let client = reqwest::Client::new();
            let path = format!("/api/receivers/{receiver_id}/disconnect");
            let response = hub
                .request(&client, reqwest::Method::POST, &path)
                .send()
                .await
                .context("failed to reach hub")?;
            let ok = response.status().is_success();
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            if ok {
                println!("{} Disconnected {}", "✓".green(), receiver_id.bright_yellow());
            } else {
                bail!(
                    "disconnect failed: {}",
                    body["message"].as_str().unwrap_or("unknown error")
                );
            }
        }

        Commands::Listen { bind, port } => {
            listen(&bind, port).await?;
        }

        Commands::TestForward { ip, port } => {
            let dest = Destination::new(ip, port);
            let forwarder = OscForwarder::bind(std::slice::from_ref(&dest)).await?;
            forwarder.forward("/test", &EventValue::Int(1)).await?;
            println!("{} Sent /test 1 to {}", "✓".green(), dest.to_string().bright_blue());
        }
    }

    Ok(())
}

fn init_logging(level: &str, log_dir: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "osc-relay.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}

async fn run_client(config: ClientConfig) -> Result<()> {
    println!(
        "{} Connecting to {} as {}",
        "→".bright_blue(),
        config.server.bright_white(),
        config.name.bright_yellow()
    );
    if let Some(dest) = &config.local_forward {
        println!("  {} forwarding to {}", "→".bright_black(), dest.to_string().bright_white());
    }

    let client = RelayClient::connect(config).await?;
    let mut status = client.watch_status();
    let mut events = client.events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n{}", "Stopping client...".yellow());
                client.stop().await;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match &current {
                    ClientStatus::Registered { .. } => println!("{} {}", "✓".green(), current),
                    ClientStatus::Reconnecting { .. } => println!("{} {}", "↻".yellow(), current),
                    ClientStatus::ManuallyDisconnected => {
                        println!("{} {}", "✗".red(), current);
                        client.join().await;
                        break;
                    }
                    ClientStatus::Stopped => break,
                    ClientStatus::Connecting => {}
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    println!("  {} = {}", event.address.bright_white(), event.value);
                }
            }
        }
    }

    Ok(())
}

fn print_receivers(receivers: &[ReceiverSummary]) {
    if receivers.is_empty() {
        println!("{}", "No receivers registered".bright_black());
        return;
    }

    let active = receivers.iter().filter(|r| r.active).count();
    println!(
        "{} receiver(s), {} active",
        receivers.len(),
        active.to_string().green()
    );
    for r in receivers {
        let state = if r.active {
            "active ".green()
        } else {
            "offline".bright_black()
        };
        println!(
            "  {} {} {} (since {})",
            state,
            r.id.to_string().bright_yellow(),
            r.name.bright_white(),
            r.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

async fn listen(bind: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("{} Listening for OSC on {}", "👂".cyan(), addr.to_string().bright_blue());

    let mut buf = vec![0u8; 65_536];
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                match OscMessage::decode(&buf[..len]) {
                    Ok(msg) => println!(
                        "{} {} {:?}  {}",
                        "•".green(),
                        msg.address.bright_white(),
                        msg.args,
                        from.to_string().bright_black()
                    ),
                    Err(e) => println!("{} {} bytes from {}: {}", "✗".red(), len, from, e),
                }
            }
        }
    }

    Ok(())
}
