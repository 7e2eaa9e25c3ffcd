use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use dispenser_link::identity::{TopicSet, DISCOVERY_TOPIC, TOPIC_ROOT};
use dispenser_link::protocol::{CONNECT_COMMAND, DISCOVER_ACTION, RESULT_RECEIVED};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{self, Instant};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "1883";
const DEFAULT_TIMEOUT_SECS: &str = "5";
const CONNECT_TIMEOUT_SECS: u64 = 5;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let timeout_arg = || {
        Arg::with_name("timeout")
            .short("t")
            .long("timeout")
            .value_name("SECONDS")
            .help("How long to wait for answers")
            .takes_value(true)
            .default_value(DEFAULT_TIMEOUT_SECS)
            .validator(|v| match v.parse::<u64>() {
                Ok(_) => Ok(()),
                Err(_) => Err("Timeout must be a whole number of seconds".into()),
            })
    };

    let matches = App::new("dispenser-ctl")
        .version("0.1.0")
        .author("FIDO Devices Team")
        .about("Operator console for smart dispensers on an MQTT broker")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Broker host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Broker port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
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
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("discover")
                .about("Find dispensers announcing themselves on the broker")
                .arg(timeout_arg()),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("Send a command to a dispenser and wait for its answer")
                .arg(
                    Arg::with_name("device")
                        .help("Device id, e.g. FIDO_0123456789AB")
                        .required(true),
                )
                .arg(
                    Arg::with_name("action")
                        .short("a")
                        .long("action")
                        .value_name("NAME")
                        .help("Command name sent in the `action` field")
                        .takes_value(true)
                        .conflicts_with("command")
                        .required_unless("command"),
                )
                .arg(
                    Arg::with_name("command")
                        .short("c")
                        .long("command")
                        .value_name("NAME")
                        .help("Command name sent in the `command` field")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("data")
                        .short("d")
                        .long("data")
                        .value_name("JSON")
                        .help("Command payload, sent in the `data` field")
                        .takes_value(true)
                        .validator(|v| match serde_json::from_str::<Value>(&v) {
                            Ok(_) => Ok(()),
                            Err(e) => Err(format!("Payload is not valid JSON: {}", e)),
                        }),
                )
                .arg(timeout_arg()),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream status, telemetry and responses")
                .arg(
                    Arg::with_name("device")
                        .help("Device id to watch; all devices when omitted"),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "dispenser-ctl".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    let (client, mut event_loop) = connect(host, port).await?;

    match matches.subcommand() {
        ("discover", Some(sub_matches)) => {
            handle_discover(sub_matches, &client, &mut event_loop, format).await?;
        }
        ("send", Some(sub_matches)) => {
            handle_send(sub_matches, &client, &mut event_loop, format, verbose).await?;
        }
        ("monitor", Some(sub_matches)) => {
            handle_monitor(sub_matches, &client, &mut event_loop, format).await?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
        }
    }

    client.disconnect().await.ok();
    Ok(())
}

async fn connect(host: &str, port: u16) -> CliResult<(AsyncClient, EventLoop)> {
    let client_id = format!("dispenser-ctl-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(15));

    let (client, mut event_loop) = AsyncClient::new(options, 16);
    let deadline = Instant::now() + Duration::from_secs(CONNECT_TIMEOUT_SECS);

    loop {
        match time::timeout_at(deadline, event_loop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => return Ok((client, event_loop)),
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => {
                eprintln!("{} Failed to connect to broker at {}:{}", "❌".red(), host, port);
                return Err(e.into());
            }
            Err(_) => {
                eprintln!("{} Broker at {}:{} did not answer", "❌".red(), host, port);
                return Err("connection timed out".into());
            }
        }
    }
}

/// Next inbound publish, or `None` once `deadline` passes.
async fn next_publish(
    event_loop: &mut EventLoop,
    deadline: Option<Instant>,
) -> CliResult<Option<Publish>> {
    loop {
        let polled = match deadline {
            Some(deadline) => match time::timeout_at(deadline, event_loop.poll()).await {
                Ok(polled) => polled,
                Err(_) => return Ok(None),
            },
            None => event_loop.poll().await,
        };

        match polled? {
            Event::Incoming(Packet::Publish(publish)) => return Ok(Some(publish)),
            _ => continue,
        }
    }
}

fn decode(publish: &Publish) -> Option<Value> {
    serde_json::from_slice(&publish.payload).ok()
}

fn timeout_of(matches: &ArgMatches<'_>) -> Duration {
    let secs = matches
        .value_of("timeout")
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    Duration::from_secs(secs)
}

async fn handle_discover(
    matches: &ArgMatches<'_>,
    client: &AsyncClient,
    event_loop: &mut EventLoop,
    format: &str,
) -> CliResult<()> {
    client.subscribe(DISCOVERY_TOPIC, QoS::AtMostOnce).await?;
    client
        .publish(
            DISCOVERY_TOPIC,
            QoS::AtMostOnce,
            false,
            json!({ "action": DISCOVER_ACTION }).to_string(),
        )
        .await?;

    let deadline = Instant::now() + timeout_of(matches);
    let mut devices: BTreeMap<String, Value> = BTreeMap::new();

    while let Some(publish) = next_publish(event_loop, Some(deadline)).await? {
        let Some(announcement) = decode(&publish) else {
            continue;
        };
        if let Some(device_id) = announcement["deviceId"].as_str() {
            devices.insert(device_id.to_string(), announcement.clone());
        }
    }

    match format {
        "json" => {
            let list: Vec<&Value> = devices.values().collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        "compact" => {
            for (device_id, info) in &devices {
                println!("{} {}", device_id, info["ip"].as_str().unwrap_or("-"));
            }
        }
        _ => {
            if devices.is_empty() {
                println!("{} {}", "⚠️".yellow(), "No dispensers answered".yellow());
                return Ok(());
            }
            println!(
                "{}",
                format!(
                    "{:<20} {:<18} {:<16} {:<8} {:>7}",
                    "DEVICE", "NAME", "IP", "VERSION", "BATTERY"
                )
                .bright_white()
                .bold()
            );
            for (device_id, info) in &devices {
                let available = info["isAvailable"].as_bool().unwrap_or(false);
                let id = if available { device_id.bright_green() } else { device_id.dimmed() };
                println!(
                    "{:<20} {:<18} {:<16} {:<8} {:>6}%",
                    id,
                    info["name"].as_str().unwrap_or("-"),
                    info["ip"].as_str().unwrap_or("-"),
                    info["version"].as_str().unwrap_or("-"),
                    info["batteryLevel"].as_u64().unwrap_or(0)
                );
            }
            println!("{} {} dispenser(s) found", "✅".green(), devices.len());
        }
    }

    Ok(())
}

async fn handle_send(
    matches: &ArgMatches<'_>,
    client: &AsyncClient,
    event_loop: &mut EventLoop,
    format: &str,
    verbose: bool,
) -> CliResult<()> {
    let device_id = matches.value_of("device").unwrap_or_default();
    let topics = TopicSet::for_device(device_id);

    let mut envelope = Map::new();
    let name = if let Some(action) = matches.value_of("action") {
        envelope.insert("action".to_string(), Value::from(action));
        action
    } else {
        let command = matches.value_of("command").unwrap_or_default();
        envelope.insert("command".to_string(), Value::from(command));
        command
    };
    if let Some(data) = matches.value_of("data") {
        envelope.insert("data".to_string(), serde_json::from_str(data)?);
    }
    let envelope = Value::Object(envelope);

    client.subscribe(topics.response(), QoS::AtMostOnce).await?;
    client
        .publish(topics.commands(), QoS::AtMostOnce, false, envelope.to_string())
        .await?;
    if verbose {
        println!("{} {} {}", "→".dimmed(), topics.commands().dimmed(), envelope);
    }

    let deadline = Instant::now() + timeout_of(matches);
    let mut answered = false;

    while let Some(publish) = next_publish(event_loop, Some(deadline)).await? {
        if publish.topic != topics.response() {
            continue;
        }
        let Some(response) = decode(&publish) else {
            continue;
        };
        if response["command"].as_str() != Some(name) {
            continue;
        }

        answered = true;
        print_response(&response, format);
        // `connect` is never acknowledged; its reply is the answer.
        if name == CONNECT_COMMAND || response["result"] == RESULT_RECEIVED {
            break;
        }
    }

    if !answered {
        match format {
            "json" => println!("null"),
            _ => println!(
                "{} No answer from {} within the timeout",
                "⏰".yellow(),
                device_id.bright_white()
            ),
        }
    }

    Ok(())
}

fn print_response(response: &Value, format: &str) {
    match format {
        "json" => println!("{}", response),
        "compact" => println!(
            "{} {}",
            response["command"].as_str().unwrap_or("-"),
            response["result"].as_str().unwrap_or("-")
        ),
        _ => {
            let command = response["command"].as_str().unwrap_or("-");
            let result = response["result"].as_str().unwrap_or("unknown");
            let message = response["message"].as_str().unwrap_or("");
            let command = command.bright_white();
            match result {
                "received" => println!("{} {} acknowledged", "✅".green(), command),
                "success" => println!("{} {} {}", "✅".green(), command, message.bright_green()),
                "error" => println!("{} {} failed: {}", "❌".red(), command, message.bright_red()),
                other => {
                    println!("{} {} {}: {}", "❓".blue(), command, other.bright_blue(), message)
                }
            }
        }
    }
}

async fn handle_monitor(
    matches: &ArgMatches<'_>,
    client: &AsyncClient,
    event_loop: &mut EventLoop,
    format: &str,
) -> CliResult<()> {
    let device = matches.value_of("device").unwrap_or("+");
    for channel in ["status", "data", "response"] {
        let filter = format!("{}/{}/{}", TOPIC_ROOT, device, channel);
        client.subscribe(filter, QoS::AtMostOnce).await?;
    }

    if format == "table" {
        println!(
            "{}",
            format!("{:>10} {:<20} {:<9} {}", "TIME(s)", "DEVICE", "CHANNEL", "DETAILS")
                .bright_white()
                .bold()
        );
    }

    while let Some(publish) = next_publish(event_loop, None).await? {
        let channel = publish.topic.rsplit('/').next().unwrap_or("");
        let Some(message) = decode(&publish) else {
            continue;
        };
        print_monitored(channel, &message, format);
    }

    Ok(())
}

fn print_monitored(channel: &str, message: &Value, format: &str) {
    let device_id = message["deviceId"].as_str().unwrap_or("-");
    let timestamp = message["timestamp"].as_u64().unwrap_or(0);

    match format {
        "json" => println!("{}", json!({ "channel": channel, "message": message })),
        "compact" => println!("[{}] {} {} {}", timestamp / 1000, device_id, channel, message),
        _ => {
            let details = match channel {
                "status" => {
                    let status = message["status"].as_str().unwrap_or("-");
                    let description = message["description"].as_str().unwrap_or("");
                    let text = format!("{} ({})", status, description);
                    if status == "online" {
                        text.green()
                    } else {
                        text.red()
                    }
                }
                "data" => {
                    let level = message["containerLevel"].as_u64().unwrap_or(0);
                    let text = format!(
                        "{:<11} weight {:>6.1}  level {:>3}%  dispensed {:>5.1}",
                        message["dispenserState"].as_str().unwrap_or("-"),
                        message["weight"].as_f64().unwrap_or(0.0),
                        level,
                        message["dispensedAmount"].as_f64().unwrap_or(0.0)
                    );
                    if level < 20 { text.yellow() } else { text.normal() }
                }
                "response" => format!(
                    "{} -> {}",
                    message["command"].as_str().unwrap_or("-"),
                    message["result"].as_str().unwrap_or("-")
                )
                .cyan(),
                _ => message.to_string().normal(),
            };
            println!("{:>10} {:<20} {:<9} {}", timestamp / 1000, device_id, channel, details);
        }
    }
}
