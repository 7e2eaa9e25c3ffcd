use clap::{App, Arg};
use dispenser_link::config::DispenserConfig;
use dispenser_link::identity::{parse_hardware_id, HardwareIdSource};
use dispenser_link::{
    BrokerSession, CommandHandler, CommandReply, DispenserAgent, HostLink, MonotonicClock,
    MqttTransport, NetworkLink, Publisher, SensorSnapshot, SensorSource,
};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn, Level};

const DEFAULT_TICK_MS: &str = "100";
const PAIRING_PASSWORD: &str = "FIDO2025";
const DEFAULT_PORTION_GRAMS: f64 = 50.0;
// Reservoir drop per gram dispensed, in sensor distance units.
const DISTANCE_PER_GRAM: f32 = 0.004;
const SHUTDOWN_GRACE_MS: u64 = 250;

/// Hardware id for hosts without a MAC to hand: an FNV-1a hash of the host
/// name, so the id is stable across restarts on the same machine.
struct HostHardwareId {
    hostname: String,
}

impl HostHardwareId {
    fn detect() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self { hostname }
    }
}

impl HardwareIdSource for HostHardwareId {
    fn read_hardware_id(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in self.hostname.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }
}

#[derive(Debug)]
struct DispenserModel {
    state: &'static str,
    bowl_weight: f32,
    reservoir_distance: f32,
    last_portion: f32,
    paired: bool,
    schedules: usize,
    pending_reply: Option<CommandReply>,
}

impl Default for DispenserModel {
    fn default() -> Self {
        Self {
            state: "idle",
            bowl_weight: 0.0,
            reservoir_distance: 8.5,
            last_portion: 0.0,
            paired: false,
            schedules: 0,
            pending_reply: None,
        }
    }
}

/// Simulated dispensing mechanism answering app commands.
struct SimulatedDispenser {
    model: Rc<RefCell<DispenserModel>>,
}

impl CommandHandler for SimulatedDispenser {
    fn handle(&mut self, command: &str, payload: &Value) {
        let mut model = self.model.borrow_mut();

        match command {
            "connect" => {
                let password = payload.get("password").and_then(Value::as_str);
                let reply = if password == Some(PAIRING_PASSWORD) {
                    model.paired = true;
                    info!("App paired");
                    CommandReply::new("success", "Dispenser paired")
                } else {
                    warn!("Pairing rejected, wrong password");
                    CommandReply::new("error", "Invalid password")
                };
                model.pending_reply = Some(reply);
            }
            "dispense" => {
                let amount = payload
                    .get("amount")
                    .and_then(Value::as_f64)
                    .unwrap_or(DEFAULT_PORTION_GRAMS) as f32;
                model.state = "dispensing";
                model.last_portion = amount;
                model.bowl_weight += amount;
                model.reservoir_distance += amount * DISTANCE_PER_GRAM;
                info!(amount, paired = model.paired, "Dispensing portion");
            }
            "sync_schedules" => {
                model.schedules = payload
                    .get("schedules")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                info!(schedules = model.schedules, "Schedules synchronized");
            }
            "disconnect" => {
                model.paired = false;
                info!("App unpaired");
            }
            other => warn!(command = other, "Unknown command"),
        }
    }

    fn reply(&mut self, _command: &str) -> Option<CommandReply> {
        self.model.borrow_mut().pending_reply.take()
    }
}

struct SimulatedSensors {
    model: Rc<RefCell<DispenserModel>>,
}

impl SensorSource for SimulatedSensors {
    fn snapshot(&mut self) -> SensorSnapshot {
        let mut model = self.model.borrow_mut();
        let snapshot = SensorSnapshot::new(model.bowl_weight, model.reservoir_distance, model.state)
            .with_dispensed_amount(model.last_portion);

        // The pet eats between samples and the mechanism settles.
        model.bowl_weight *= 0.8;
        model.state = "idle";
        model.last_portion = 0.0;
        snapshot
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("dispenser")
        .version("0.1.0")
        .author("FIDO Devices Team")
        .about("Smart dispenser node: keeps a simulated dispenser online over MQTT")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Broker host (overrides the configuration)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Broker port (overrides the configuration)")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(port) if port > 0 => Ok(()),
                    _ => Err("Port must be a number between 1 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("hardware-id")
                .long("hardware-id")
                .value_name("HEX")
                .help("48-bit hardware id, e.g. 01:23:45:67:89:AB")
                .takes_value(true)
                .validator(|v| match parse_hardware_id(&v) {
                    Some(_) => Ok(()),
                    None => Err("Hardware id must be at most 12 hex digits".into()),
                }),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Maintenance tick period")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Tick period must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match matches.value_of("config") {
        Some(path) => DispenserConfig::load(path)?,
        None => DispenserConfig::default(),
    };
    if let Some(host) = matches.value_of("host") {
        config.broker.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.broker.port = port.parse()?;
    }
    if let Some(hardware_id) = matches.value_of("hardware-id") {
        config.device.hardware_id = Some(hardware_id.to_string());
    }
    config.validate()?;
    let tick_ms: u64 = matches.value_of("tick-ms").unwrap_or(DEFAULT_TICK_MS).parse()?;

    let identity = config.identity(&HostHardwareId::detect());
    info!(
        device_id = %identity.id(),
        broker = %config.broker.host,
        port = config.broker.port,
        "Dispenser node configured"
    );

    let link = NetworkLink::new(
        HostLink::new(&config.broker.host, config.broker.port),
        config.link_credentials(),
    )
    .with_attempts(config.link.attempt_interval_ms, config.link.max_attempts);
    let transport = MqttTransport::new(
        config.broker.host.clone(),
        config.broker.port,
        config.broker.keep_alive_secs,
    );
    let publisher = Publisher::new(identity, config.profile(), config.calibration);

    let model = Rc::new(RefCell::new(DispenserModel::default()));
    let session = BrokerSession::new(transport, publisher, config.session_settings())
        .with_command_handler(Box::new(SimulatedDispenser {
            model: Rc::clone(&model),
        }));
    let mut agent = DispenserAgent::new(
        link,
        session,
        SimulatedSensors { model },
        config.agent_settings(),
    );

    let clock = MonotonicClock::new();
    if let Err(e) = agent.start(clock.now_ms()) {
        error!(error = %e, "Network link could not be started, will retry");
    }

    let mut interval = time::interval(Duration::from_millis(tick_ms));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut last_info = String::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = agent.update(clock.now_ms()) {
                    error!(error = %e, "Agent error");
                    break;
                }

                let info = agent.connection_info();
                if info != last_info {
                    info!("{}", info);
                    last_info = info;
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    agent.stop(clock.now_ms());
    // Let the event loop flush the offline status and the disconnect.
    time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;
    info!(stats = ?agent.stats(), "Dispenser node stopped");

    Ok(())
}
