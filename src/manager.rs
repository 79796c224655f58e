//! Composition root: wires drivers, engines and the message bus, owns the
//! entity registries, dispatches input actions and handles incoming MQTT
//! commands.

use crate::config::{
    ActionConfig, AppConfig, CoverAction, CoverPlatform, OutputAction, OutputKind, OutputType,
};
use crate::cover::previous::PreviousCover;
use crate::cover::time_based::TimeBasedCover;
use crate::cover::venetian::VenetianCover;
use crate::cover::{Cover, CoverArgs, CoverPersist};
use crate::error::{ConfigError, HardwareError};
use crate::hardware::dry::DryPinState;
use crate::hardware::expander::{
    open_shared_i2c, Mcp23017Expander, Pca9685Expander, Pcf8575Expander, SharedI2c,
};
use crate::hardware::{gpio, DriverPin};
use crate::input::{Click, DetectionKind, Input, PressHandler};
use crate::modbus::coordinator::{CoordinatorArgs, ModbusCoordinator};
use crate::modbus::descriptor::DeviceDescriptor;
use crate::modbus::transport::ModbusTransport;
use crate::net::{discovery, AutodiscoveryMessage, MessageBus, Payload};
use crate::relay::group::OutputGroup;
use crate::relay::interlock::InterlockManager;
use crate::relay::{Relay, RelayArgs};
use crate::runtime::scheduler::spawn_updater;
use crate::runtime::{EventBus, EventType};
use crate::sensor::dallas::DallasSensor;
use crate::sensor::ina219::Ina219Sensor;
use crate::sensor::temp::{Lm75Sensor, Mcp9808Sensor};
use crate::sensor::{AdcReader, AdcSensor, SensorReporter};
use crate::state::StateManager;
use crate::util;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Bridges the message bus (created before the manager) to the manager's
/// command handler.
#[derive(Default)]
pub struct CommandRouter {
    manager: OnceLock<Weak<Manager>>,
}

impl CommandRouter {
    pub fn new() -> Arc<CommandRouter> {
        Arc::new(CommandRouter::default())
    }

    pub fn attach(&self, manager: &Arc<Manager>) {
        let _ = self.manager.set(Arc::downgrade(manager));
    }

    pub async fn dispatch(&self, topic: String, payload: String) {
        let Some(manager) = self.manager.get().and_then(Weak::upgrade) else {
            return;
        };
        manager.receive_message(&topic, &payload).await;
    }
}

pub struct Manager {
    config: AppConfig,
    config_path: PathBuf,
    topic_prefix: String,
    ha_prefix: String,
    discovery_enabled: bool,
    device_name: String,
    dry: bool,
    message_bus: Arc<dyn MessageBus>,
    event_bus: EventBus,
    state_manager: Arc<StateManager>,
    interlocks: Arc<InterlockManager>,
    outputs: Mutex<HashMap<String, Arc<Relay>>>,
    output_groups: Mutex<HashMap<String, Arc<OutputGroup>>>,
    covers: Mutex<HashMap<String, Arc<dyn Cover>>>,
    inputs: Mutex<HashMap<String, Arc<Input>>>,
    modbus_coordinators: Mutex<HashMap<String, Arc<ModbusCoordinator>>>,
    dry_pins: DryPinState,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub async fn create(
        config: AppConfig,
        config_path: PathBuf,
        message_bus: Arc<dyn MessageBus>,
        event_bus: EventBus,
        state_manager: Arc<StateManager>,
        router: &Arc<CommandRouter>,
        dry: bool,
    ) -> Arc<Manager> {
        info!("Initializing manager module.");
        let ha = config.ha_discovery();
        let manager = Arc::new(Manager {
            topic_prefix: config.topic_prefix(),
            ha_prefix: ha.topic_prefix,
            discovery_enabled: ha.enabled,
            device_name: config.topic_prefix(),
            config,
            config_path,
            dry,
            message_bus,
            event_bus,
            state_manager,
            interlocks: InterlockManager::new(),
            outputs: Mutex::new(HashMap::new()),
            output_groups: Mutex::new(HashMap::new()),
            covers: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
            modbus_coordinators: Mutex::new(HashMap::new()),
            dry_pins: DryPinState::new(),
            tasks: Mutex::new(Vec::new()),
        });
        router.attach(&manager);

        let i2c = manager.open_i2c();
        manager.configure_outputs(i2c).await;
        manager.configure_output_groups();
        manager.configure_covers();
        manager.configure_inputs(false);
        manager.configure_sensors(i2c);
        manager.configure_modbus();
        manager.prepare_ha_buttons();
        info!("BoneIO manager is ready.");
        manager
    }

    /// Dry-pin registry, exposed for the dry-run report and tests.
    pub fn dry_pins(&self) -> &DryPinState {
        &self.dry_pins
    }

    pub fn input_by_pin(&self, pin: &str) -> Option<Arc<Input>> {
        self.inputs.lock().unwrap().get(pin).cloned()
    }

    pub fn output_by_id(&self, id: &str) -> Option<Arc<Relay>> {
        self.outputs.lock().unwrap().get(id).cloned()
    }

    pub fn cover_by_id(&self, id: &str) -> Option<Arc<dyn Cover>> {
        self.covers.lock().unwrap().get(id).cloned()
    }

    fn open_i2c(&self) -> Option<&'static SharedI2c> {
        let wanted = !self.config.mcp23017.is_empty()
            || !self.config.pcf8575.is_empty()
            || !self.config.pca9685.is_empty()
            || !self.config.lm75.is_empty()
            || !self.config.mcp9808.is_empty()
            || !self.config.ina219.is_empty();
        if !wanted || self.dry {
            return None;
        }
        match open_shared_i2c(&self.config.i2c_device) {
            Ok(bus) => Some(bus),
            Err(err) => {
                error!("Cannot open I2C bus {}: {err}", self.config.i2c_device);
                None
            }
        }
    }

    fn device_ctx(&self) -> discovery::DeviceCtx<'_> {
        discovery::DeviceCtx {
            topic: &self.topic_prefix,
            model: "boneIO Relay Board",
            device_name: Some(&self.device_name),
            web_url: None,
        }
    }

    fn send_ha_autodiscovery<T: serde::Serialize>(&self, ha_type: &str, id: &str, payload: &T) {
        if !self.discovery_enabled {
            return;
        }
        let Ok(payload) = serde_json::to_value(payload) else {
            return;
        };
        debug!("Sending HA discovery for {ha_type} entity, {id}.");
        self.message_bus.add_autodiscovery_message(AutodiscoveryMessage {
            ha_type: ha_type.to_string(),
            topic: format!(
                "{}/{ha_type}/{}/{id}/config",
                self.ha_prefix, self.topic_prefix
            ),
            payload,
        });
    }

    // -----------------------------------------------------------------------
    // Outputs

    fn build_driver(
        &self,
        kind: OutputKind,
        expander_id: Option<&str>,
        pin: &str,
        i2c: Option<&'static SharedI2c>,
        mcp: &HashMap<String, Mcp23017Expander>,
        pcf: &HashMap<String, Pcf8575Expander>,
        pca: &HashMap<String, Pca9685Expander>,
    ) -> Result<DriverPin, HardwareError> {
        if self.dry {
            let key = format!("{}:{pin}", expander_id.unwrap_or("gpio"));
            return Ok(match kind {
                OutputKind::Pca => DriverPin::Pwm(Box::new(self.dry_pins.pin(&key))),
                _ => DriverPin::Switch(Box::new(self.dry_pins.pin(&key))),
            });
        }
        let _ = i2c;
        let index = || {
            pin.parse::<u8>().map_err(|_| {
                HardwareError::I2c(format!("expander pin {pin:?} is not a number"))
            })
        };
        let missing = |kind: &str| HardwareError::I2c(format!("unknown {kind} expander"));
        match kind {
            OutputKind::Gpio => Ok(DriverPin::Switch(Box::new(gpio::request_output(pin)?))),
            OutputKind::Mcp => {
                let expander = expander_id
                    .and_then(|id| mcp.get(id))
                    .ok_or_else(|| missing("mcp23017"))?;
                Ok(DriverPin::Switch(Box::new(expander.output_pin(index()?)?)))
            }
            OutputKind::Pcf => {
                let expander = expander_id
                    .and_then(|id| pcf.get(id))
                    .ok_or_else(|| missing("pcf8575"))?;
                Ok(DriverPin::Switch(Box::new(expander.output_pin(index()?)?)))
            }
            OutputKind::Pca => {
                let expander = expander_id
                    .and_then(|id| pca.get(id))
                    .ok_or_else(|| missing("pca9685"))?;
                Ok(DriverPin::Pwm(Box::new(expander.output_pin(index()?)?)))
            }
        }
    }

    async fn configure_outputs(self: &Arc<Self>, i2c: Option<&'static SharedI2c>) {
        let mut mcp = HashMap::new();
        let mut pcf = HashMap::new();
        let mut pca = HashMap::new();
        if let Some(bus) = i2c {
            for expander in &self.config.mcp23017 {
                match Mcp23017Expander::new(&expander.id, bus, expander.address) {
                    Ok(dev) => {
                        mcp.insert(expander.id.clone(), dev);
                    }
                    Err(err) => error!("Can't connect to {}. {err}", expander.id),
                }
                if let Some(sleep) = expander.init_sleep {
                    tokio::time::sleep(sleep.as_duration()).await;
                }
            }
            for expander in &self.config.pcf8575 {
                match Pcf8575Expander::new(&expander.id, bus, expander.address) {
                    Ok(dev) => {
                        pcf.insert(expander.id.clone(), dev);
                    }
                    Err(err) => error!("Can't connect to {}. {err}", expander.id),
                }
            }
            for expander in &self.config.pca9685 {
                match Pca9685Expander::new(&expander.id, bus, expander.address) {
                    Ok(dev) => {
                        pca.insert(expander.id.clone(), dev);
                    }
                    Err(err) => error!("Can't connect to {}. {err}", expander.id),
                }
            }
        }

        for output in &self.config.output {
            let driver = match self.build_driver(
                output.kind,
                output.expander_id.as_deref(),
                &output.pin,
                i2c,
                &mcp,
                &pcf,
                &pca,
            ) {
                Ok(driver) => driver,
                Err(err) => {
                    error!("Can't configure output {}. {err}", output.id);
                    continue;
                }
            };
            let relay = Relay::new(RelayArgs {
                id: output.id.clone(),
                name: output.id.clone(),
                output_type: output.output_type,
                expander_id: output.expander_id.clone().unwrap_or_default(),
                pin_id: output.pin.clone(),
                restore_state: output.restore_state,
                driver,
                momentary_turn_on: output.momentary_turn_on.map(|t| t.as_duration()),
                momentary_turn_off: output.momentary_turn_off.map(|t| t.as_duration()),
                virtual_power_usage: output.virtual_power_usage,
                virtual_volume_flow_rate: output.virtual_volume_flow_rate,
                topic_prefix: self.topic_prefix.clone(),
                topic_type: "relay",
                message_bus: self.message_bus.clone(),
                event_bus: self.event_bus.clone(),
            });
            if !output.interlock_group.is_empty() {
                self.interlocks.register(&relay, &output.interlock_group);
                relay.set_interlock(self.interlocks.clone(), output.interlock_group.clone());
            }
            if let Some(energy) = relay.energy_sensor() {
                energy.subscribe_restore().await;
                self.send_energy_discovery(&relay);
            }
            if output.restore_state {
                let state_manager = self.state_manager.clone();
                let relay_id = relay.id.clone();
                self.event_bus.add_event_listener(
                    EventType::Output,
                    &relay.id,
                    "state-manager",
                    Arc::new(move |event| {
                        if let crate::runtime::Event::Output(state) = event {
                            state_manager.set_relay(&relay_id, state.state.is_on());
                        }
                    }),
                );
            }
            self.send_output_discovery(&relay);
            self.outputs.lock().unwrap().insert(relay.id.clone(), relay);
        }

        // Restore after every output exists so interlock gating sees the
        // whole group.
        let outputs: Vec<Arc<Relay>> = self.outputs.lock().unwrap().values().cloned().collect();
        for relay in outputs {
            if relay.output_type == OutputType::Cover {
                continue;
            }
            if relay.restore_state {
                let desired = self.state_manager.relay_state(&relay.id).unwrap_or(false);
                if !relay.restore(desired).await {
                    self.state_manager.remove_relay(&relay.id);
                }
            } else {
                relay.send_state();
            }
        }
    }

    fn send_output_discovery(&self, relay: &Arc<Relay>) {
        let ctx = self.device_ctx();
        match relay.output_type {
            OutputType::Light => self.send_ha_autodiscovery(
                "light",
                &relay.id,
                &discovery::ha_light_message(&ctx, &relay.id, &relay.name),
            ),
            OutputType::Led => self.send_ha_autodiscovery(
                "light",
                &relay.id,
                &discovery::ha_led_message(&ctx, &relay.id, &relay.name),
            ),
            OutputType::Valve => self.send_ha_autodiscovery(
                "valve",
                &relay.id,
                &discovery::ha_valve_message(&ctx, &relay.id, &relay.name),
            ),
            OutputType::Switch => self.send_ha_autodiscovery(
                "switch",
                &relay.id,
                &discovery::ha_switch_message(&ctx, &relay.id, &relay.name, "relay"),
            ),
            OutputType::Cover | OutputType::None => {}
        }
    }

    fn send_energy_discovery(&self, relay: &Arc<Relay>) {
        let Some(energy) = relay.energy_sensor() else {
            return;
        };
        let ctx = self.device_ctx();
        let mut fields: Vec<(&str, &str, &str, &str)> = Vec::new();
        if energy.power_w().is_some() {
            fields.push(("power", "W", "power", "measurement"));
            fields.push(("energy", "Wh", "energy", "total_increasing"));
        }
        if energy.flow_l_per_h().is_some() {
            fields.push(("volume_flow_rate", "L/h", "volume_flow_rate", "measurement"));
            fields.push(("water", "L", "water", "total_increasing"));
        }
        for (field, unit, device_class, state_class) in fields {
            let name = format!("{} {field}", relay.name);
            self.send_ha_autodiscovery(
                "sensor",
                &format!("{}{field}", relay.id),
                &discovery::ha_virtual_energy_sensor_message(
                    &ctx,
                    &relay.id,
                    &name,
                    field,
                    unit,
                    device_class,
                    state_class,
                ),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Groups and covers

    fn configure_output_groups(self: &Arc<Self>) {
        for group in &self.config.output_group {
            let members: Vec<Arc<Relay>> = {
                let outputs = self.outputs.lock().unwrap();
                group
                    .outputs
                    .iter()
                    .filter_map(|id| {
                        let output = outputs.get(&util::strip_accents(id));
                        if output.is_none() {
                            warn!("Group {}: output {id} doesn't exist.", group.id);
                        }
                        output.cloned()
                    })
                    .filter(|output| {
                        if output.output_type == OutputType::Cover {
                            warn!("You can't add cover output to group.");
                            false
                        } else {
                            true
                        }
                    })
                    .collect()
            };
            if members.is_empty() {
                warn!(
                    "This group {} doesn't have any valid members. Not adding it.",
                    group.id
                );
                continue;
            }
            debug!(
                "Configuring output group {} with members: {:?}",
                group.id,
                members.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
            );
            let output_group = OutputGroup::new(
                &group.id,
                &group.id,
                members,
                &self.topic_prefix,
                self.message_bus.clone(),
                self.event_bus.clone(),
            );
            self.send_ha_autodiscovery(
                "switch",
                &output_group.id,
                &discovery::ha_switch_message(
                    &self.device_ctx(),
                    &output_group.id,
                    &output_group.name,
                    "group",
                ),
            );
            self.output_groups
                .lock()
                .unwrap()
                .insert(output_group.id.clone(), output_group);
        }
    }

    fn configure_covers(self: &Arc<Self>) {
        for cover_config in &self.config.cover {
            let cover = match self.build_cover(cover_config) {
                Ok(cover) => cover,
                Err(err) => {
                    error!("{err}");
                    continue;
                }
            };
            // Motion must halt on process exit, without the final publish.
            let sigterm_cover = cover.clone();
            self.event_bus.add_sigterm_listener(Arc::new(move || {
                let cover = sigterm_cover.clone();
                Box::pin(async move {
                    cover.stop_with(true).await;
                })
            }));
            if cover_config.show_in_ha.unwrap_or(true) {
                self.send_ha_autodiscovery(
                    "cover",
                    &cover.core().id,
                    &discovery::ha_cover_message(
                        &self.device_ctx(),
                        &cover.core().id,
                        &cover.core().name,
                        &cover.core().device_class,
                        cover.has_tilt(),
                    ),
                );
            }
            self.covers
                .lock()
                .unwrap()
                .insert(cover.core().id.clone(), cover);
        }
    }

    fn build_cover(
        self: &Arc<Self>,
        config: &crate::config::CoverConfig,
    ) -> Result<Arc<dyn Cover>, ConfigError> {
        let outputs = self.outputs.lock().unwrap();
        let find_relay = |id: &str| {
            outputs
                .get(&util::strip_accents(id))
                .cloned()
                .ok_or_else(|| ConfigError::Cover {
                    id: config.id.clone(),
                    message: format!("relay {id:?} doesn't exist"),
                })
        };
        let open_relay = find_relay(&config.open_relay)?;
        let close_relay = find_relay(&config.close_relay)?;
        drop(outputs);
        let id = util::strip_accents(&config.id);
        let snapshot = self.state_manager.cover_state(&id);
        let state_manager = self.state_manager.clone();
        let persist: CoverPersist = Arc::new(move |cover_id, position, tilt| {
            state_manager.set_cover(cover_id, position, tilt);
        });
        let args = CoverArgs {
            id: config.id.clone(),
            name: config.id.clone(),
            device_class: config.device_class.clone(),
            open_relay,
            close_relay,
            open_time: config.open_time.as_duration(),
            close_time: config.close_time.as_duration(),
            restore_state: config.restore_state,
            initial_position: snapshot.as_ref().map(|s| s.position as f64).unwrap_or(0.0),
            initial_tilt: snapshot
                .as_ref()
                .and_then(|s| s.tilt)
                .map(|t| t as f64)
                .unwrap_or(0.0),
            topic_prefix: self.topic_prefix.clone(),
            message_bus: self.message_bus.clone(),
            event_bus: self.event_bus.clone(),
            persist,
        };
        Ok(match config.platform {
            CoverPlatform::Previous => PreviousCover::new(args) as Arc<dyn Cover>,
            CoverPlatform::TimeBased => TimeBasedCover::new(args) as Arc<dyn Cover>,
            CoverPlatform::Venetian => {
                let tilt_duration =
                    config
                        .tilt_duration
                        .ok_or_else(|| ConfigError::Cover {
                            id: config.id.clone(),
                            message: "venetian cover needs tilt_duration".to_string(),
                        })?;
                let actuator = config.actuator_activation_duration.ok_or_else(|| {
                    ConfigError::Cover {
                        id: config.id.clone(),
                        message: "venetian cover needs actuator_activation_duration".to_string(),
                    }
                })?;
                VenetianCover::new(
                    args,
                    tilt_duration.as_duration(),
                    actuator.as_duration(),
                ) as Arc<dyn Cover>
            }
        })
    }

    // -----------------------------------------------------------------------
    // Inputs

    fn press_handler(self: &Arc<Self>) -> PressHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |input, click| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(manager) = weak.upgrade() {
                    manager.handle_click(input, click).await;
                }
            })
        })
    }

    pub fn configure_inputs(self: &Arc<Self>, reload: bool) {
        let config = if reload {
            match AppConfig::load(&self.config_path) {
                Ok(config) => config,
                Err(err) => {
                    error!("Cannot reload config: {err}");
                    return;
                }
            }
        } else {
            self.config.clone()
        };
        for (configs, kind) in [
            (&config.event, DetectionKind::Event),
            (&config.binary_sensor, DetectionKind::Binary),
        ] {
            for input_config in configs {
                let existing = {
                    let inputs = self.inputs.lock().unwrap();
                    inputs.get(&input_config.pin).cloned()
                };
                if let Some(input) = existing {
                    input.set_actions(input_config.actions.clone(), kind);
                    continue;
                }
                let input = Input::new(
                    input_config,
                    kind,
                    self.event_bus.clone(),
                    self.press_handler(),
                );
                if !self.dry {
                    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                    if let Err(err) =
                        gpio::spawn_edge_monitor(&input_config.pin, &input_config.gpio_mode, tx)
                    {
                        error!("Can't configure input {}. {err}", input_config.pin);
                        continue;
                    }
                    input.attach_edges(rx);
                }
                match kind {
                    DetectionKind::Event => {
                        if input.show_in_ha {
                            self.send_ha_autodiscovery(
                                "event",
                                &input.pin,
                                &discovery::ha_event_message(
                                    &self.device_ctx(),
                                    &input.pin,
                                    &input.name,
                                ),
                            );
                        }
                    }
                    DetectionKind::Binary => {
                        if input.show_in_ha {
                            self.send_ha_autodiscovery(
                                "binary_sensor",
                                &input.pin,
                                &discovery::ha_binary_sensor_message(
                                    &self.device_ctx(),
                                    &input.pin,
                                    &input.name,
                                    input.device_class.as_deref(),
                                ),
                            );
                        }
                    }
                }
                self.inputs
                    .lock()
                    .unwrap()
                    .insert(input.pin.clone(), input);
            }
        }
    }

    /// Action dispatch for one classified click, serialized per pin by the
    /// input engine.
    async fn handle_click(&self, input: Arc<Input>, click: Click) {
        for action in input.actions_for(click.click_type) {
            match action {
                ActionConfig::Mqtt {
                    topic,
                    action_mqtt_msg,
                } => {
                    self.message_bus
                        .send_message(&topic, Payload::Text(action_mqtt_msg), false);
                }
                ActionConfig::Output { pin, action_output } => {
                    self.run_output_action(&pin, action_output).await;
                }
                ActionConfig::Cover { pin, action_cover } => {
                    self.run_cover_action(&pin, action_cover).await;
                }
                ActionConfig::OutputOverMqtt {
                    boneio_id,
                    pin,
                    action_output,
                } => {
                    self.message_bus.send_message(
                        &format!("{boneio_id}/cmd/relay/{pin}/set"),
                        Payload::Text(action_output.to_string().to_uppercase()),
                        false,
                    );
                }
                ActionConfig::CoverOverMqtt {
                    boneio_id,
                    pin,
                    action_cover,
                } => {
                    self.message_bus.send_message(
                        &format!("{boneio_id}/cmd/cover/{pin}/set"),
                        Payload::Text(action_cover.to_string()),
                        false,
                    );
                }
            }
        }

        let topic = format!("{}/{}/{}", self.topic_prefix, input.input_type(), input.pin);
        let payload = match input.kind {
            DetectionKind::Event => {
                let mut body = serde_json::json!({ "event_type": click.click_type.to_string() });
                if let Some(duration) = click.duration {
                    body["duration"] = serde_json::json!(duration);
                }
                Payload::Json(body)
            }
            DetectionKind::Binary => Payload::Text(click.click_type.to_string()),
        };
        debug!("Sending message {payload:?} for input {topic}");
        self.message_bus.send_message(&topic, payload, false);
        if input.clear_message {
            // Z2M-style one-shot: clear the click with an empty retained
            // message shortly after.
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.message_bus.send_message(&topic, Payload::Empty, true);
        }
    }

    async fn run_output_action(&self, target: &str, action: OutputAction) {
        let id = util::strip_accents(target);
        let output = self.outputs.lock().unwrap().get(&id).cloned();
        if let Some(output) = output {
            debug!("Executing action {action} for output {}.", output.name);
            match action {
                OutputAction::Toggle => output.toggle().await,
                OutputAction::On => output.turn_on().await,
                OutputAction::Off => output.turn_off().await,
            }
            return;
        }
        let group = self.output_groups.lock().unwrap().get(&id).cloned();
        if let Some(group) = group {
            match action {
                OutputAction::Toggle => group.toggle().await,
                OutputAction::On => group.turn_on().await,
                OutputAction::Off => group.turn_off().await,
            }
            return;
        }
        warn!("This output {target} doesn't exist!");
    }

    async fn run_cover_action(&self, target: &str, action: CoverAction) {
        let id = util::strip_accents(target);
        let cover = self.covers.lock().unwrap().get(&id).cloned();
        let Some(cover) = cover else {
            warn!("This cover {target} doesn't exist!");
            return;
        };
        debug!("Executing action {action} for cover {}.", cover.core().name);
        match action {
            CoverAction::Open => cover.open().await,
            CoverAction::Close => cover.close().await,
            CoverAction::Stop => cover.stop().await,
            CoverAction::Toggle => cover.toggle().await,
            CoverAction::ToggleOpen => cover.toggle_open().await,
            CoverAction::ToggleClose => cover.toggle_close().await,
            CoverAction::TiltOpen | CoverAction::TiltClose => {
                if !cover.has_tilt() {
                    warn!("Tilt actions are only for venetian covers!");
                    return;
                }
                if action == CoverAction::TiltOpen {
                    cover.tilt_open().await;
                } else {
                    cover.tilt_close().await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sensors and Modbus

    fn reporter(
        &self,
        id: &str,
        name: &str,
        unit: Option<String>,
        filters: Vec<crate::modbus::filter::FilterOp>,
    ) -> SensorReporter {
        SensorReporter::new(
            id,
            name,
            unit,
            filters,
            &self.topic_prefix,
            self.message_bus.clone(),
            self.event_bus.clone(),
        )
    }

    fn spawn_sensor(
        &self,
        sensor: Arc<dyn crate::runtime::scheduler::PeriodicUpdate>,
        interval: Duration,
    ) {
        self.tasks
            .lock()
            .unwrap()
            .push(spawn_updater(sensor, interval));
    }

    fn configure_sensors(self: &Arc<Self>, i2c: Option<&'static SharedI2c>) {
        let ctx = self.device_ctx();
        if let Some(bus) = i2c {
            for sensor in &self.config.lm75 {
                let unit = sensor
                    .unit_of_measurement
                    .clone()
                    .or_else(|| Some("°C".to_string()));
                let reporter =
                    self.reporter(&sensor.id, &sensor.id, unit.clone(), sensor.filters.clone());
                match Lm75Sensor::new(reporter, bus, sensor.address) {
                    Ok(device) => {
                        self.send_ha_autodiscovery(
                            "sensor",
                            &util::normalize_id(&sensor.id),
                            &discovery::ha_sensor_message(
                                &ctx,
                                &util::normalize_id(&sensor.id),
                                &sensor.id,
                                unit.as_deref(),
                                Some("temperature"),
                                Some("measurement"),
                                None,
                            ),
                        );
                        self.spawn_sensor(Arc::new(device), sensor.update_interval.as_duration());
                    }
                    Err(err) => error!("Can't configure Temp sensor. {err}"),
                }
            }
            for sensor in &self.config.mcp9808 {
                let unit = sensor
                    .unit_of_measurement
                    .clone()
                    .or_else(|| Some("°C".to_string()));
                let reporter =
                    self.reporter(&sensor.id, &sensor.id, unit.clone(), sensor.filters.clone());
                match Mcp9808Sensor::new(reporter, bus, sensor.address) {
                    Ok(device) => {
                        self.send_ha_autodiscovery(
                            "sensor",
                            &util::normalize_id(&sensor.id),
                            &discovery::ha_sensor_message(
                                &ctx,
                                &util::normalize_id(&sensor.id),
                                &sensor.id,
                                unit.as_deref(),
                                Some("temperature"),
                                Some("measurement"),
                                None,
                            ),
                        );
                        self.spawn_sensor(Arc::new(device), sensor.update_interval.as_duration());
                    }
                    Err(err) => error!("Can't configure Temp sensor. {err}"),
                }
            }
            for sensor in &self.config.ina219 {
                let id = util::normalize_id(&sensor.id);
                let make = |suffix: &str, unit: &str| {
                    self.reporter(
                        &format!("{id}{suffix}"),
                        &format!("{} {suffix}", sensor.id),
                        Some(unit.to_string()),
                        Vec::new(),
                    )
                };
                match Ina219Sensor::new(
                    &id,
                    make("voltage", "V"),
                    make("current", "A"),
                    make("power", "W"),
                    bus,
                    sensor.address,
                ) {
                    Ok(device) => {
                        for (suffix, unit, device_class) in [
                            ("voltage", "V", "voltage"),
                            ("current", "A", "current"),
                            ("power", "W", "power"),
                        ] {
                            self.send_ha_autodiscovery(
                                "sensor",
                                &format!("{id}{suffix}"),
                                &discovery::ha_sensor_message(
                                    &ctx,
                                    &format!("{id}{suffix}"),
                                    &format!("{} {suffix}", sensor.id),
                                    Some(unit),
                                    Some(device_class),
                                    Some("measurement"),
                                    None,
                                ),
                            );
                        }
                        self.spawn_sensor(Arc::new(device), sensor.update_interval.as_duration());
                    }
                    Err(err) => error!("Can't configure INA219 sensor. {err}"),
                }
            }
        }
        for sensor in &self.config.dallas {
            let reporter = self.reporter(
                &sensor.id,
                &sensor.id,
                Some("°C".to_string()),
                sensor.filters.clone(),
            );
            let device = DallasSensor::new(reporter, &sensor.address);
            self.send_ha_autodiscovery(
                "sensor",
                &util::normalize_id(&sensor.id),
                &discovery::ha_sensor_message(
                    &ctx,
                    &util::normalize_id(&sensor.id),
                    &sensor.id,
                    Some("°C"),
                    Some("temperature"),
                    Some("measurement"),
                    None,
                ),
            );
            self.spawn_sensor(Arc::new(device), sensor.update_interval.as_duration());
        }
        if !self.dry {
            let reader = Arc::new(AdcReader::new());
            for sensor in &self.config.adc {
                let id = sensor.identifier();
                let reporter = self.reporter(&id, &id, Some("V".to_string()), sensor.filters.clone());
                let device = AdcSensor::new(reporter, reader.clone(), &sensor.pin);
                self.send_ha_autodiscovery(
                    "sensor",
                    &util::normalize_id(&id),
                    &discovery::ha_sensor_message(
                        &ctx,
                        &util::normalize_id(&id),
                        &id,
                        Some("V"),
                        Some("voltage"),
                        Some("measurement"),
                        None,
                    ),
                );
                self.spawn_sensor(Arc::new(device), sensor.update_interval.as_duration());
            }
        }
    }

    fn configure_modbus(self: &Arc<Self>) {
        if self.config.modbus_devices.is_empty() {
            return;
        }
        let Some(uart) = &self.config.modbus else {
            error!("Modbus devices configured without a modbus uart section.");
            return;
        };
        if self.dry {
            info!("Dry run: skipping modbus transport.");
            return;
        }
        let transport = match ModbusTransport::open(uart) {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                error!("Can't open modbus uart: {err}");
                return;
            }
        };
        for device in &self.config.modbus_devices {
            let descriptor =
                match DeviceDescriptor::load(&self.config.modbus_devices_dir, &device.model) {
                    Ok(descriptor) => descriptor,
                    Err(err) => {
                        error!("Can't configure modbus device {}: {err}", device.id);
                        continue;
                    }
                };
            let coordinator = ModbusCoordinator::new(CoordinatorArgs {
                id: device.id.clone(),
                name: device.id.clone(),
                address: device.address,
                update_interval: device.update_interval.as_duration(),
                descriptor,
                sensors_filters: device.sensors_filters.clone(),
                data: device.data.clone(),
                topic_prefix: self.topic_prefix.clone(),
                ha_prefix: self.ha_prefix.clone(),
                transport: transport.clone(),
                message_bus: self.message_bus.clone(),
                event_bus: self.event_bus.clone(),
            });
            let interval = coordinator.default_interval();
            self.tasks
                .lock()
                .unwrap()
                .push(spawn_updater(coordinator.clone(), interval));
            self.modbus_coordinators
                .lock()
                .unwrap()
                .insert(coordinator.id.clone(), coordinator);
        }
    }

    fn prepare_ha_buttons(&self) {
        let ctx = self.device_ctx();
        for (id, name, payload_press) in [
            ("logger", "Logger reload", "reload"),
            ("restart", "Restart", "restart"),
            ("inputs_reload", "Reload inputs", "inputs_reload"),
            ("cover_reload", "Reload covers", "cover_reload"),
        ] {
            self.send_ha_autodiscovery(
                "button",
                id,
                &discovery::ha_button_message(&ctx, id, name, payload_press),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Incoming commands

    pub async fn receive_message(self: &Arc<Self>, topic: &str, message: &str) {
        debug!("Processing topic {topic} with message {message}.");
        let prefix = format!("{}/cmd/", self.topic_prefix);
        let Some(rest) = topic.strip_prefix(&prefix) else {
            error!("Wrong topic {topic}!");
            return;
        };
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < 3 {
            error!("Wrong topic {topic}!");
            return;
        }
        let (kind, device_id, command) = (
            parts[parts.len() - 3],
            parts[parts.len() - 2],
            parts[parts.len() - 1],
        );
        match (kind, command) {
            ("relay", "set") => self.handle_relay_set(device_id, message).await,
            ("relay", "set_brightness") => {
                self.handle_relay_brightness(device_id, message).await
            }
            ("cover", "set") => {
                let Some(action) = parse_cover_action(message) else {
                    warn!("Wrong cover command {message}!");
                    return;
                };
                self.run_cover_action(device_id, action).await;
            }
            ("cover", "pos") => {
                let cover = self.covers.lock().unwrap().get(device_id).cloned();
                match (cover, message.parse::<f64>()) {
                    (Some(cover), Ok(position)) => cover.set_cover_position(position).await,
                    (None, _) => warn!("This cover {device_id} doesn't exist. Ignoring message."),
                    (_, Err(_)) => warn!("Bad cover position {message}!"),
                }
            }
            ("cover", "tilt") => {
                let cover = self.covers.lock().unwrap().get(device_id).cloned();
                let Some(cover) = cover else {
                    warn!("This cover {device_id} doesn't exist. Ignoring message.");
                    return;
                };
                if message == "stop" {
                    cover.stop().await;
                } else if let Ok(tilt) = message.parse::<f64>() {
                    cover.set_tilt(tilt).await;
                } else {
                    warn!("Bad tilt command {message}!");
                }
            }
            ("group", "set") => self.handle_group_set(device_id, message).await,
            ("button", "set") => self.handle_button(device_id, message).await,
            ("modbus", "set") => self.handle_modbus_set(device_id, message).await,
            _ => warn!("Unknown command {kind}/{command}."),
        }
    }

    async fn handle_relay_set(&self, device_id: &str, message: &str) {
        let output = self.outputs.lock().unwrap().get(device_id).cloned();
        let Some(output) = output else {
            warn!("This relay {device_id} doesn't exist.");
            return;
        };
        // Cover drivers and hidden outputs are never MQTT-addressable.
        if matches!(output.output_type, OutputType::None | OutputType::Cover) {
            warn!("This relay {device_id} doesn't exist.");
            return;
        }
        match message {
            "ON" => output.turn_on().await,
            "OFF" => output.turn_off().await,
            "TOGGLE" => output.toggle().await,
            other => warn!("Wrong relay command {other}!"),
        }
    }

    async fn handle_relay_brightness(&self, device_id: &str, message: &str) {
        let output = self.outputs.lock().unwrap().get(device_id).cloned();
        let Some(output) = output else {
            warn!("This relay {device_id} doesn't exist or is not PWM.");
            return;
        };
        if !output.is_pwm() || output.output_type == OutputType::None {
            warn!("This relay {device_id} doesn't exist or is not PWM.");
            return;
        }
        match message.parse::<u32>() {
            Ok(value) if value <= u16::MAX as u32 => {
                output.set_brightness(value as u16).await;
            }
            _ => warn!("Wrong brightness value {message}!"),
        }
    }

    async fn handle_group_set(&self, device_id: &str, message: &str) {
        let group = self.output_groups.lock().unwrap().get(device_id).cloned();
        let Some(group) = group else {
            debug!("Target device not found {device_id}.");
            return;
        };
        match message {
            "ON" => group.turn_on().await,
            "OFF" => group.turn_off().await,
            "TOGGLE" => group.toggle().await,
            other => warn!("Wrong group command {other}!"),
        }
    }

    async fn handle_button(self: &Arc<Self>, device_id: &str, message: &str) {
        match (device_id, message) {
            ("logger", "reload") => {
                info!("Reloading logger configuration.");
                log::set_max_level(log::LevelFilter::Debug);
            }
            ("restart", "restart") => self.restart_request(),
            ("inputs_reload", "inputs_reload") => {
                info!("Reloading events and binary sensors actions");
                self.configure_inputs(true);
            }
            ("cover_reload", "cover_reload") => {
                info!("Reloading covers requires new timings; taking effect after restart.");
            }
            _ => warn!("Wrong button command {device_id}/{message}!"),
        }
    }

    async fn handle_modbus_set(&self, device_id: &str, message: &str) {
        let coordinator = self
            .modbus_coordinators
            .lock()
            .unwrap()
            .get(device_id)
            .cloned();
        let Some(coordinator) = coordinator else {
            warn!("Unknown modbus device {device_id}.");
            return;
        };
        #[derive(serde::Deserialize)]
        struct WriteRequest {
            device: String,
            value: serde_json::Value,
        }
        match serde_json::from_str::<WriteRequest>(message) {
            Ok(request) => {
                if let Err(err) = coordinator
                    .write_entity(&request.device, &request.value)
                    .await
                {
                    error!("Modbus write failed: {err}");
                }
            }
            Err(err) => warn!("Bad modbus command {message}: {err}"),
        }
    }

    fn restart_request(&self) {
        info!("Restarting process. Systemd should restart it soon.");
        std::process::exit(0);
    }

    /// Shutdown chain: stop covers (sigterm listeners), cancel refresh
    /// tasks. The caller publishes the offline state afterwards.
    pub async fn shutdown(&self) {
        self.event_bus.run_sigterm_listeners().await;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

fn parse_cover_action(message: &str) -> Option<CoverAction> {
    Some(match message {
        "open" => CoverAction::Open,
        "close" => CoverAction::Close,
        "stop" => CoverAction::Stop,
        "toggle" => CoverAction::Toggle,
        "toggle_open" => CoverAction::ToggleOpen,
        "toggle_close" => CoverAction::ToggleClose,
        "tilt_open" => CoverAction::TiltOpen,
        "tilt_close" => CoverAction::TiltClose,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::local::LocalMessageBus;
    use crate::runtime::EventBus;

    async fn dry_manager(yaml: &str) -> (Arc<Manager>, LocalMessageBus, EventBus) {
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        let bus = LocalMessageBus::new("boneio");
        let event_bus = EventBus::new();
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::load(&dir.path().join("state.json"));
        let router = CommandRouter::new();
        let manager = Manager::create(
            config,
            dir.path().join("config.yaml"),
            Arc::new(bus.clone()),
            event_bus.clone(),
            state,
            &router,
            true,
        )
        .await;
        (manager, bus, event_bus)
    }

    const YAML: &str = r#"
output:
  - id: r1
    kind: mcp
    expander_id: mcp1
    pin: "0"
    output_type: switch
  - id: r2
    kind: mcp
    expander_id: mcp1
    pin: "1"
    output_type: switch
cover:
  - id: salon
    platform: time_based
    open_relay: r1
    close_relay: r2
    open_time: 10s
    close_time: 10s
"#;

    #[tokio::test(start_paused = true)]
    async fn relay_commands_drive_dry_pins() {
        let (manager, bus, event_bus) = dry_manager(YAML).await;
        manager
            .receive_message("boneio/cmd/relay/r1/set", "ON")
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.dry_pins().level("mcp1:0"));
        assert_eq!(
            bus.retained("boneio/relay/r1").as_deref(),
            Some("{\"state\":\"ON\"}")
        );
        manager
            .receive_message("boneio/cmd/relay/r1/set", "TOGGLE")
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!manager.dry_pins().level("mcp1:0"));
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn cover_relays_reject_direct_mqtt_set() {
        let yaml = r#"
output:
  - id: r1
    kind: mcp
    expander_id: mcp1
    pin: "0"
    output_type: cover
"#;
        let (manager, bus, event_bus) = dry_manager(yaml).await;
        manager
            .receive_message("boneio/cmd/relay/r1/set", "ON")
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!manager.dry_pins().level("mcp1:0"));
        assert_eq!(bus.retained("boneio/relay/r1"), None);
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn cover_position_command_moves_cover() {
        let (manager, _bus, event_bus) = dry_manager(YAML).await;
        manager
            .receive_message("boneio/cmd/cover/salon/pos", "50")
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.dry_pins().level("mcp1:0"));
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(!manager.dry_pins().level("mcp1:0"));
        let cover = manager.covers.lock().unwrap().get("salon").cloned().unwrap();
        let position = cover.core().position();
        assert!((49.0..=51.0).contains(&position), "position {position}");
        event_bus.close();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_topics_are_rejected() {
        let (manager, _bus, event_bus) = dry_manager(YAML).await;
        manager.receive_message("boneio/relay/r1", "ON").await;
        manager.receive_message("boneio/cmd/relay/r1", "ON").await;
        manager
            .receive_message("boneio/cmd/nothing/x/set", "ON")
            .await;
        event_bus.close();
    }
}
