//! boneIO CLI: the long-running controller service plus one-shot Modbus
//! helpers.

use anyhow::{Context, Result};
use boneio::config::{AppConfig, TimePeriod, UartConfig};
use boneio::manager::{CommandRouter, Manager};
use boneio::modbus::transport::ModbusTransport;
use boneio::modbus::{RegisterType, ValueType};
use boneio::net::local::LocalMessageBus;
use boneio::net::mqtt::MqttMessageBus;
use boneio::net::{MessageBus, MessageCallback};
use boneio::runtime::{signal, EventBus};
use boneio::state::StateManager;
use clap::{Args, Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "boneio", version, about = "boneIO controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller service.
    Run {
        /// Path to the YAML config file.
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
        /// Increase verbosity (-d debug, -dd trace).
        #[arg(short, action = clap::ArgAction::Count)]
        debug: u8,
        /// Override the MQTT username from the config.
        #[arg(long)]
        mqttusername: Option<String>,
        /// Override the MQTT password from the config.
        #[arg(long)]
        mqttpassword: Option<String>,
        /// Run without touching hardware (in-memory pins).
        #[arg(long)]
        dry: bool,
    },
    /// One-shot Modbus helpers.
    Modbus {
        #[command(subcommand)]
        command: ModbusCommands,
    },
}

#[derive(Args)]
struct ModbusConnection {
    /// UART name (uart1..uart5) or device path.
    #[arg(long, default_value = "uart4")]
    uart: String,
    #[arg(long, default_value_t = 9600)]
    baudrate: u32,
    /// Modbus unit (slave) address.
    #[arg(long, default_value_t = 1)]
    unit: u8,
}

impl ModbusConnection {
    fn uart_config(&self) -> UartConfig {
        UartConfig {
            uart: self.uart.clone(),
            baudrate: self.baudrate,
            parity: "N".to_string(),
            stopbits: 1,
            bytesize: 8,
            timeout: TimePeriod::from_secs(3),
        }
    }
}

#[derive(Subcommand)]
enum ModbusCommands {
    /// Read and decode one register.
    Get {
        #[command(flatten)]
        connection: ModbusConnection,
        #[arg(long)]
        register: u16,
        #[arg(long, default_value = "input")]
        register_type: String,
        #[arg(long, default_value = "U_WORD")]
        value_type: String,
    },
    /// Write one holding register.
    Set {
        #[command(flatten)]
        connection: ModbusConnection,
        #[arg(long)]
        register: u16,
        #[arg(long)]
        value: u16,
    },
    /// Probe unit addresses for a responding device.
    Search {
        #[command(flatten)]
        connection: ModbusConnection,
        #[arg(long, default_value_t = 0)]
        register: u16,
        #[arg(long, default_value = "input")]
        register_type: String,
    },
}

fn init_logging(debug: u8) {
    let level = match debug {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn parse_register_type(text: &str) -> Result<RegisterType> {
    serde_yaml::from_str(text).with_context(|| format!("bad register type {text:?}"))
}

fn parse_value_type(text: &str) -> Result<ValueType> {
    serde_yaml::from_str(text).with_context(|| format!("bad value type {text:?}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            debug,
            mqttusername,
            mqttpassword,
            dry,
        } => {
            init_logging(debug);
            let local = tokio::task::LocalSet::new();
            local
                .run_until(run(config, mqttusername, mqttpassword, dry))
                .await
        }
        Commands::Modbus { command } => {
            init_logging(0);
            run_modbus_command(command).await
        }
    }
}

async fn run(
    config_path: PathBuf,
    mqttusername: Option<String>,
    mqttpassword: Option<String>,
    dry: bool,
) -> Result<()> {
    info!("boneIO {} starting.", boneio::VERSION);
    let mut config = AppConfig::load(&config_path).context("configuration error")?;
    if let Some(mqtt) = config.mqtt.as_mut() {
        if mqttusername.is_some() {
            mqtt.username = mqttusername;
        }
        if mqttpassword.is_some() {
            mqtt.password = mqttpassword;
        }
    }

    let event_bus = EventBus::new();
    let state_path = config_path
        .parent()
        .map(|dir| dir.join("state.json"))
        .unwrap_or_else(|| PathBuf::from("state.json"));
    let state_manager = StateManager::load(&state_path);

    let router = CommandRouter::new();
    let receive: MessageCallback = {
        let router = router.clone();
        Arc::new(move |topic, payload| {
            let router = router.clone();
            Box::pin(async move { router.dispatch(topic, payload).await })
        })
    };

    let mqtt_bus = config
        .mqtt
        .as_ref()
        .map(|mqtt| MqttMessageBus::new(mqtt, event_bus.clone(), receive.clone()));
    let message_bus: Arc<dyn MessageBus> = match &mqtt_bus {
        Some(bus) => Arc::new(bus.clone()),
        None => Arc::new(LocalMessageBus::new(&config.topic_prefix())),
    };

    let manager = Manager::create(
        config,
        config_path,
        message_bus,
        event_bus.clone(),
        state_manager,
        &router,
        dry,
    )
    .await;

    signal::wait_for_shutdown().await;
    info!("Shutting down gracefully.");
    manager.shutdown().await;
    if let Some(bus) = &mqtt_bus {
        bus.announce_offline().await;
    }
    event_bus.close();
    Ok(())
}

async fn run_modbus_command(command: ModbusCommands) -> Result<()> {
    match command {
        ModbusCommands::Get {
            connection,
            register,
            register_type,
            value_type,
        } => {
            let transport = ModbusTransport::open(&connection.uart_config())?;
            let value = transport
                .read_and_decode(
                    connection.unit,
                    register,
                    parse_value_type(&value_type)?,
                    parse_register_type(&register_type)?,
                )
                .await?;
            println!("{value}");
        }
        ModbusCommands::Set {
            connection,
            register,
            value,
        } => {
            let transport = ModbusTransport::open(&connection.uart_config())?;
            transport
                .write_register(connection.unit, register, value)
                .await?;
            println!("ok");
        }
        ModbusCommands::Search {
            connection,
            register,
            register_type,
        } => {
            let transport = ModbusTransport::open(&connection.uart_config())?;
            let register_type = parse_register_type(&register_type)?;
            let mut found = Vec::new();
            for unit in 1..=247u8 {
                match transport
                    .read_registers(unit, register, 1, register_type)
                    .await
                {
                    Ok(_) => {
                        info!("Device found at address {unit}.");
                        found.push(unit);
                    }
                    Err(err) => log::debug!("No answer from {unit}: {err}"),
                }
            }
            if found.is_empty() {
                error!("No devices found.");
            } else {
                println!("{found:?}");
            }
        }
    }
    Ok(())
}
