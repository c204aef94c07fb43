//! `droverd` — the Drover daemon and client tools.
//!
//! # Usage
//!
//! ```text
//! droverd agent                          # run a node agent
//! droverd agent -c drover.toml -p 7818   # explicit config and port
//! droverd ping                           # round-trip to the controller
//! droverd echo "payload"                 # echo via the controller
//! droverd echo --node node-7 "payload"   # echo via one node agent
//! ```

mod config;
mod handler;
mod telemetry;

use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drover_proto::payload::{Echo, NodeRegistration, Ping};
use drover_proto::{ForwardInfo, Message, PayloadValue};
use drover_types::MsgType;
use drover_types::config::{config as proto_config, set_config};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use config::CliConfig;
use handler::{AgentHandler, RpcHandler};

#[derive(Parser)]
#[command(name = "droverd", version, about = "Drover workload-manager transport daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node agent.
    Agent {
        /// Override the listen port (0 = ephemeral).
        #[arg(short, long)]
        port: Option<u16>,

        /// Node name announced to the controller.
        #[arg(long, env = "DROVER_NODE_NAME")]
        node_name: Option<String>,
    },

    /// Round-trip a probe through the controller.
    Ping {
        /// Number of probes to send.
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },

    /// Echo bytes off the controller or a single node agent.
    Echo {
        /// Target node (`name` or `host:port`); controller when omitted.
        #[arg(long)]
        node: Option<String>,

        /// Text to echo.
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file_config = CliConfig::load(cli.config.as_deref()).context("loading configuration")?;
    telemetry::init(&file_config.log.level);
    set_config(file_config.to_proto_config());

    match cli.command {
        Commands::Agent { port, node_name } => run_agent(&file_config, port, node_name).await,
        Commands::Ping { count } => run_ping(count).await,
        Commands::Echo { node, data } => run_echo(node, data.into_bytes()).await,
    }
}

// ---------------------------------------------------------------------------
// Agent role
// ---------------------------------------------------------------------------

async fn run_agent(
    file_config: &CliConfig,
    port: Option<u16>,
    node_name: Option<String>,
) -> Result<()> {
    let port = port.unwrap_or(file_config.agent.port);
    let listener = drover_net::conn::listen(port).await?;
    let local = listener.local_addr()?;
    let node_name = node_name
        .or_else(|| file_config.agent.node_name.clone())
        .unwrap_or_else(|| local.to_string());
    info!(%local, node = %node_name, "agent listening");

    register_with_controller(&node_name, local).await;

    let rpc: Arc<dyn RpcHandler> = Arc::new(AgentHandler {
        node_name: node_name.clone(),
    });
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "accepted connection");
        let rpc = rpc.clone();
        tokio::spawn(handle_conn(stream, rpc));
    }
}

/// Serve one connection: receive (relaying any fan-out), dispatch, reply.
async fn handle_conn(mut stream: TcpStream, rpc: Arc<dyn RpcHandler>) {
    let mut msg = match drover_net::recv_and_forward(&mut stream, 0).await {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "dropping undecodable connection");
            return;
        }
    };

    let (msg_type, payload) = rpc.handle(&msg).await;
    let mut reply = Message::new(msg_type, payload);
    reply.forward = ForwardInfo::reset();
    // The reply picks up every child's result (or failure marker) from the
    // relay launched during the receive.
    reply.pending = msg.pending.take();
    if let Err(e) = drover_net::send_msg(&mut stream, &mut reply).await {
        warn!(error = %e, msg_type = %msg.msg_type, "reply failed");
    }
}

/// Best-effort address announcement; agents run fine without a controller.
async fn register_with_controller(node_name: &str, local: SocketAddr) {
    let addrs: Vec<SocketAddrV4> = match local {
        SocketAddr::V4(v4) => vec![v4],
        SocketAddr::V6(_) => Vec::new(),
    };
    let mut msg = Message::new(
        MsgType::REGISTER_NODE,
        PayloadValue::Registration(NodeRegistration {
            node_name: node_name.to_string(),
            addrs,
        }),
    );
    match drover_net::send_only_controller_msg(&mut msg, None).await {
        Ok(()) => info!(node = node_name, "registered with controller"),
        Err(e) => debug!(error = %e, "controller registration skipped"),
    }
}

// ---------------------------------------------------------------------------
// Client tools
// ---------------------------------------------------------------------------

async fn run_ping(count: u32) -> Result<()> {
    for i in 0..count {
        let mut req = Message::new(
            MsgType::PING,
            PayloadValue::Ping(Ping {
                timestamp_ms: now_ms(),
            }),
        );
        let resp = drover_net::send_recv_controller_msg(&mut req, None).await?;
        match resp.payload {
            PayloadValue::Pong(pong) => {
                println!(
                    "pong {}/{count}: rtt {} ms",
                    i + 1,
                    now_ms().saturating_sub(pong.timestamp_ms)
                );
            }
            other => println!("unexpected reply {}: {other:?}", resp.msg_type),
        }
    }
    Ok(())
}

async fn run_echo(node: Option<String>, data: Vec<u8>) -> Result<()> {
    let mut req = Message::new(MsgType::ECHO, PayloadValue::Echo(Echo { data }));
    let resp = match node {
        Some(node) => {
            let addr =
                drover_net::resolver::resolve_host(&node, proto_config().agent_port).await?;
            drover_net::send_recv_msg(addr, &mut req, 0).await?
        }
        None => drover_net::send_recv_controller_msg(&mut req, None).await?,
    };
    match resp.payload {
        PayloadValue::EchoReply(reply) => {
            println!("{}", String::from_utf8_lossy(&reply.data));
        }
        other => println!("unexpected reply {}: {other:?}", resp.msg_type),
    }
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
