use clap::{App, Arg};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{debug, error, info, warn, Level};
use trackerdcs::config::{file_loader, DcsConfig};
use trackerdcs::error::DcsResult;
use trackerdcs::sim::{SimulatedBus, SimulatedChiller, SimulatedCrate};
use trackerdcs::telemetry::StatusSink;
use trackerdcs::{Backends, Supervisor};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const STATUS_BROADCAST_BUFFER_SIZE: usize = 256;

/// Fans status lines out to every connected bus client.
struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

impl StatusSink for BroadcastSink {
    fn emit(&self, topic: &str, payload: &Value) -> DcsResult<()> {
        let line = format!("{} {}", topic, payload);
        debug!(%line, "status");
        // No subscribers is not an error
        let _ = self.tx.send(line);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("trackerdcs")
        .version("0.1.0")
        .author("Tracker DCS Team")
        .about("Supervisor daemon for the tracker power, cooling and chiller systems")
        .arg(
            Arg::with_name("config")
                .help("Path to the YAML configuration")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Address the message bus listens on")
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port the message bus listens on")
                .default_value(DEFAULT_PORT)
                .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|_| "Port must be a number".to_string())),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let path = matches.value_of("config").unwrap_or_default().to_string();
    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;

    // The crate simulator needs the point prefix before the supervisor loads
    let initial = DcsConfig::from_file(&path)?;
    let (sim, notifications) = SimulatedCrate::new(initial.point_prefix.clone());
    let sim = Arc::new(sim);
    let backends = Backends::new(sim.clone())
        .with_field_bus(Box::new(SimulatedBus::new()))
        .with_chiller_link(Box::new(SimulatedChiller::new()));

    let (status_tx, _) = broadcast::channel(STATUS_BROADCAST_BUFFER_SIZE);
    let sink = Arc::new(BroadcastSink { tx: status_tx.clone() });

    let supervisor = Supervisor::start(file_loader(path), backends, sink)?;
    let tick_interval = supervisor.tick_interval();
    info!(subscriptions = ?supervisor.subscriptions(), "supervisor started");

    let router = supervisor.router().clone();
    let notify_task = tokio::spawn(router.run(notifications));

    let supervisor = Arc::new(Mutex::new(supervisor));

    let listener = TcpListener::bind((host, port)).await?;
    info!("message bus listening on {}:{}", host, port);
    let bus_supervisor = Arc::clone(&supervisor);
    let bus_tx = status_tx.clone();
    let bus_task = tokio::spawn(async move {
        if let Err(e) = serve_bus(listener, bus_supervisor, bus_tx).await {
            error!("message bus error: {}", e);
        }
    });

    let mut interval = time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                sim.advance();
                let emitted = supervisor.lock().await.tick();
                debug!(emitted, "tick");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    bus_task.abort();
    notify_task.abort();
    let stats = supervisor.lock().await.stats();
    info!(?stats, "supervisor stopped");
    Ok(())
}

async fn serve_bus(
    listener: TcpListener,
    supervisor: Arc<Mutex<Supervisor>>,
    status_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("client connected: {}", addr);
                let client_supervisor = Arc::clone(&supervisor);
                let status_rx = status_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_supervisor, status_rx).await {
                        warn!("client {} error: {}", addr, e);
                    }
                    info!("client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

/// One line per message in each direction: `<topic> <payload>` in, `<topic> <json>` out.
async fn handle_client(
    stream: TcpStream,
    supervisor: Arc<Mutex<Supervisor>>,
    mut status_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let status_writer = Arc::clone(&writer);
    let status_task = tokio::spawn(async move {
        loop {
            let line = match status_rx.recv().await {
                Ok(line) => line,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "slow client dropped status lines");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let mut guard = status_writer.lock().await;
            if guard.write_all(line.as_bytes()).await.is_err() || guard.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    // A new subscriber gets the full picture
    supervisor.lock().await.publish_all(true);

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            continue;
        }
        let (topic, payload) = trimmed.split_once(' ').unwrap_or((trimmed, ""));

        let result = supervisor.lock().await.handle_command(topic, payload.as_bytes());
        let reply = match result {
            Ok(()) => format!("ok {}\n", topic),
            Err(e) => format!("err {} {}\n", topic, e),
        };
        writer.lock().await.write_all(reply.as_bytes()).await?;
    }

    status_task.abort();
    Ok(())
}
