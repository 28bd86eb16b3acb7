use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_FLEET: &str = "dcs";
const DEFAULT_COOLING: &str = "marta";
const DEFAULT_CHILLER: &str = "julabo";
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

const COOLING_VERBS: &[&str] = &[
    "start_chiller",
    "stop_chiller",
    "start_co2",
    "stop_co2",
    "clear_alarms",
    "reconnect",
    "refresh",
    "set_flow_active",
    "set_temperature_setpoint",
    "set_speed_setpoint",
    "set_flow_setpoint",
];

const CHILLER_VERBS: &[&str] = &[
    "start",
    "stop",
    "reconnect",
    "refresh",
    "set_working_temp",
    "use_setpoint",
    "set_pressure_stage",
    "use_internal",
    "use_external",
];

/// What the daemon sent back for one command line.
struct Reply {
    ok: bool,
    message: String,
    status_lines: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("dcsctl")
        .version("0.1.0")
        .author("Tracker DCS Team")
        .about("Command-line client for the tracker DCS supervisor")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Supervisor host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Supervisor port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a valid number".into()),
                }),
        )
        .arg(
            Arg::with_name("fleet")
                .long("fleet")
                .value_name("NAME")
                .help("Fleet name used as the command topic root")
                .takes_value(true)
                .default_value(DEFAULT_FLEET)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Also print the status lines received while waiting for the reply")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("Send one raw command message")
                .arg(Arg::with_name("topic").help("Command topic, e.g. dcs/cmd/refresh").required(true).index(1))
                .arg(Arg::with_name("payload").help("Message payload").index(2)),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Stream status messages until interrupted")
                .arg(Arg::with_name("filter").help("Only show topics starting with this prefix").index(1)),
        )
        .subcommand(
            SubCommand::with_name("switch")
                .about("Switch a stage of every active channel")
                .arg(
                    Arg::with_name("stage")
                        .help("Supply stage")
                        .required(true)
                        .possible_values(&["lv", "hv"])
                        .index(1),
                )
                .arg(
                    Arg::with_name("state")
                        .help("Target state")
                        .required(true)
                        .possible_values(&["on", "off"])
                        .index(2),
                ),
        )
        .subcommand(
            SubCommand::with_name("setv")
                .about("Set the voltage setpoint of one channel")
                .arg(
                    Arg::with_name("stage")
                        .help("Supply stage")
                        .required(true)
                        .possible_values(&["lv", "hv"])
                        .index(1),
                )
                .arg(Arg::with_name("channel").help("Channel id").required(true).index(2))
                .arg(
                    Arg::with_name("volts")
                        .help("Setpoint in volts")
                        .required(true)
                        .index(3)
                        .validator(|v| match v.parse::<f64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Voltage must be a number".into()),
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("clear").about("Clear alarms on every channel in error"))
        .subcommand(SubCommand::with_name("refresh").about("Force a full status publish"))
        .subcommand(SubCommand::with_name("reload").about("Reload the configuration and rebuild the fleet"))
        .subcommand(SubCommand::with_name("reconnect").about("Reconnect disconnected channels"))
        .subcommand(
            SubCommand::with_name("cooling")
                .about("Command the CO2 cooling unit")
                .arg(
                    Arg::with_name("name")
                        .long("name")
                        .value_name("NAME")
                        .takes_value(true)
                        .default_value(DEFAULT_COOLING),
                )
                .arg(
                    Arg::with_name("verb")
                        .required(true)
                        .possible_values(COOLING_VERBS)
                        .index(1),
                )
                .arg(Arg::with_name("value").help("Parameter value").index(2)),
        )
        .subcommand(
            SubCommand::with_name("chiller")
                .about("Command the recirculating chiller")
                .arg(
                    Arg::with_name("name")
                        .long("name")
                        .value_name("NAME")
                        .takes_value(true)
                        .default_value(DEFAULT_CHILLER),
                )
                .arg(
                    Arg::with_name("verb")
                        .required(true)
                        .possible_values(CHILLER_VERBS)
                        .index(1),
                )
                .arg(Arg::with_name("payload").help(r#"JSON payload, e.g. {"setpoint": 1, "temp": -20}"#).index(2)),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let fleet = matches.value_of("fleet").unwrap_or(DEFAULT_FLEET);
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    let (topic, payload) = match matches.subcommand() {
        ("watch", Some(sub_matches)) => {
            return watch(host, port, sub_matches.value_of("filter").unwrap_or(""), format).await;
        }
        ("send", Some(sub_matches)) => (
            sub_matches.value_of("topic").unwrap_or_default().to_string(),
            sub_matches.value_of("payload").unwrap_or_default().to_string(),
        ),
        ("switch", Some(sub_matches)) => (
            format!("{}/cmd/switch/{}", fleet, sub_matches.value_of("stage").unwrap_or_default()),
            sub_matches.value_of("state").unwrap_or_default().to_string(),
        ),
        ("setv", Some(sub_matches)) => (
            format!(
                "{}/cmd/setv/{}/{}",
                fleet,
                sub_matches.value_of("stage").unwrap_or_default(),
                sub_matches.value_of("channel").unwrap_or_default()
            ),
            sub_matches.value_of("volts").unwrap_or_default().to_string(),
        ),
        (verb @ ("clear" | "refresh" | "reload" | "reconnect"), _) => (format!("{}/cmd/{}", fleet, verb), String::new()),
        ("cooling", Some(sub_matches)) => entity_command(sub_matches, "value"),
        ("chiller", Some(sub_matches)) => entity_command(sub_matches, "payload"),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Stream status messages", "dcsctl watch".bright_cyan());
            println!("  {} Power the low-voltage stage", "dcsctl switch lv on".bright_cyan());
            return Ok(());
        }
    };

    let reply = send_command(host, port, &topic, &payload).await?;
    if verbose {
        for line in &reply.status_lines {
            print_status_line(line, format);
        }
    }
    print_reply(&topic, &reply, format);
    if !reply.ok {
        std::process::exit(1);
    }
    Ok(())
}

fn entity_command(matches: &ArgMatches<'_>, payload_arg: &str) -> (String, String) {
    let name = matches.value_of("name").unwrap_or_default();
    let verb = matches.value_of("verb").unwrap_or_default();
    (
        format!("{}/cmd/{}", name, verb),
        matches.value_of(payload_arg).unwrap_or_default().to_string(),
    )
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to the supervisor at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Supervisor is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "trackerdcs <config.yaml>".bright_cyan());
            }
            Err(e.into())
        }
    }
}

/// Send `<topic> <payload>` and wait for the matching `ok`/`err` line.
async fn send_command(host: &str, port: u16, topic: &str, payload: &str) -> Result<Reply, Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let exchange = async {
        writer.write_all(format!("{} {}\n", topic, payload).as_bytes()).await?;

        let ok_prefix = format!("ok {}", topic);
        let err_prefix = format!("err {} ", topic);
        let mut status_lines = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line == ok_prefix {
                return Ok(Reply { ok: true, message: String::new(), status_lines });
            }
            if let Some(message) = line.strip_prefix(&err_prefix) {
                return Ok(Reply { ok: false, message: message.to_string(), status_lines });
            }
            status_lines.push(line);
        }
        Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "Supervisor closed connection"))
    };

    match tokio::time::timeout(REPLY_TIMEOUT, exchange).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} No reply after {} seconds", "⏰".yellow(), REPLY_TIMEOUT.as_secs());
            Err("Command timeout".into())
        }
    }
}

async fn watch(host: &str, port: u16, filter: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();
    if format == "table" {
        println!("{}", "📡 Watching supervisor status (Press Ctrl+C to stop)...".bright_blue().bold());
    }
    while let Some(line) = lines.next_line().await? {
        if line.starts_with(filter) {
            print_status_line(&line, format);
        }
    }
    Ok(())
}

fn print_reply(topic: &str, reply: &Reply, format: &str) {
    match format {
        "json" => {
            let json = serde_json::json!({ "topic": topic, "ok": reply.ok, "error": reply.message });
            println!("{}", json);
        }
        "compact" => {
            if reply.ok {
                println!("{}", "OK".bright_green());
            } else {
                println!("{} {}", "ERR".bright_red(), reply.message);
            }
        }
        _ => {
            if reply.ok {
                println!("{} {} accepted", "✅".green(), topic.bright_white());
            } else {
                println!("{} {} failed: {}", "❌".red(), topic.bright_white(), reply.message.bright_red());
                if reply.message.contains("rejected") {
                    println!("{} Check the current state with: {}", "💡".yellow(), "dcsctl watch".bright_cyan());
                }
            }
        }
    }
}

fn print_status_line(line: &str, format: &str) {
    let (topic, body) = line.split_once(' ').unwrap_or((line, ""));
    if format == "json" {
        println!("{}", line);
        return;
    }
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(body) else {
        println!("{} {}", topic.bright_blue(), body);
        return;
    };

    let entries: Vec<&serde_json::Value> = match &payload {
        serde_json::Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for entry in entries {
        match entry {
            serde_json::Value::Object(fields) => {
                let state = fields.get("state").and_then(|s| s.as_str()).unwrap_or("-");
                let label = fields.get("id").and_then(|id| id.as_str()).map(|id| format!("[{}]", id)).unwrap_or_default();
                if format == "compact" {
                    println!("{}{} {}", topic, label, colorize_state(state));
                    continue;
                }
                let details: Vec<String> = fields
                    .iter()
                    .filter(|(key, _)| key.as_str() != "state" && key.as_str() != "id")
                    .map(|(key, value)| format!("{}={}", key.dimmed(), value))
                    .collect();
                println!("{}{} {} {}", topic.bright_blue(), label.bright_white(), colorize_state(state), details.join(" "));
            }
            serde_json::Value::String(text) if text.is_empty() => {
                if format != "compact" {
                    println!("{} {}", topic.bright_blue(), "no alarms".green());
                }
            }
            serde_json::Value::String(text) => {
                println!("{} {}", topic.bright_blue(), text.trim_end().replace('\n', "; ").bright_red());
            }
            other => println!("{} {}", topic.bright_blue(), other),
        }
    }
}

fn colorize_state(state: &str) -> ColoredString {
    match state {
        "ERROR" | "ALARM" | "DISCONNECTED" => state.bright_red().bold(),
        "HV_RAMP" | "HV_MIX" | "INIT" => state.yellow(),
        "HV_ON" | "ON" | "CO2_RUNNING" | "CHILLER_RUNNING" => state.bright_green(),
        _ => state.bright_white(),
    }
}
