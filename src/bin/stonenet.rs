use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tokio::runtime;
use tokio::time;
use tracing::{info, warn};

use stonenet::{
    setup_local_tracing, AppResult, Client, ClientOptions, Connection, Request, Route, Server,
    ServerOptions, ServiceBuilder, StoneNetConfig,
};

const PING_MSG_ID: u32 = 1;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// echo every message with id 1 back to its sender
    Server,
    /// send a ping with id 1 every second
    Client,
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    setup_local_tracing(commandline.verbose)?;

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let config = StoneNetConfig::set_up_config(config_path)?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    match commandline.command {
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
        Command::Server => rt.block_on(run_server(config)),
        Command::Client => rt.block_on(run_client(config)),
    }
}

async fn run_server(config: StoneNetConfig) -> AppResult<()> {
    let service = ServiceBuilder::new(config.service)
        .add_router(
            PING_MSG_ID,
            Route::new().handle(|request: Request| async move {
                let data = request.data().clone();
                let conn = request.connection();
                if let Err(err) = conn.send_msg(request.msg_id(), &data).await {
                    warn!("echo to connection {} failed: {}", conn.conn_id(), err);
                }
            }),
        )
        .on_conn_start(|conn| {
            info!(
                "connection {} from {} is online",
                conn.conn_id(),
                conn.remote_addr()
            )
        })
        .on_conn_stop(|conn| info!("connection {} is offline", conn.conn_id()))
        .build();

    let server = Arc::new(Server::new(service, ServerOptions::from(config.server)));
    server.serve().await
}

async fn run_client(config: StoneNetConfig) -> AppResult<()> {
    let service = ServiceBuilder::new(config.service)
        .add_router(
            PING_MSG_ID,
            Route::new().handle(|request: Request| async move {
                info!("pong: {}", String::from_utf8_lossy(request.data()));
            }),
        )
        .on_conn_start(|conn| {
            tokio::spawn(ping(conn.clone()));
        })
        .build();

    let client = Arc::new(Client::new(service, ClientOptions::from(config.client)));
    tokio::select! {
        res = client.serve() => res,
        res = tokio::signal::ctrl_c() => {
            info!("get shutdown signal");
            client.stop();
            Ok(res?)
        }
    }
}

async fn ping(conn: Connection) {
    let cancel = conn.cancellation_token();
    let mut interval = time::interval(Duration::from_secs(1));
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        seq += 1;
        let data = format!("ping {}", seq);
        if let Err(err) = conn.send_buff_msg(PING_MSG_ID, data.as_bytes()).await {
            warn!("ping on connection {} failed: {}", conn.conn_id(), err);
            if err.is_fatal_to_connection() {
                break;
            }
        }
    }
}
