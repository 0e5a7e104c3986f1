use std::{
    f64::consts::PI,
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use socket_common::{
    command::handle_message,
    supervisor::{self, TaskSpec, CURRENT_TASK, PAIRING_TASK, RESET_TASK},
    ActuatorState, AnalogInput, ButtonInput, CommandOutcome, CommandSubscription,
    ConnectivitySignal, DeviceError, FactoryReset, MeasurementConfig, PairingLifecycle,
    PairingRadio, RadioGuard, RelayDriver, SocketConfig, StdPacer, Switch, TelemetrySink,
    TOPIC_RELAY_COMMAND,
};

const SIM_OFFSET_RAW: f64 = 2_048.0;
const SIM_SAMPLES_PER_CYCLE: f64 = 400.0;
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(2);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = HostStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        SocketConfig::default()
    });
    apply_env_overrides(&mut config);
    config.sanitize();

    info!(
        "config loaded: mqtt=`{}:{}`, pairing timeout={}ms",
        config.network.mqtt_host, config.network.mqtt_port, config.pairing.network_timeout_ms
    );

    let switch = Arc::new(Switch::new(SimRelay).context("failed to drive relay low")?);
    let connectivity = ConnectivitySignal::new();
    let radio = Arc::new(RadioGuard::new(SimPairingRadio::start(&config)));

    let mut mqtt_options = MqttOptions::new(
        config.network.client_id.clone(),
        config.network.mqtt_host.clone(),
        config.network.mqtt_port,
    );
    if !config.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            config.network.mqtt_user.clone(),
            config.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);

    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel::<DeviceError>();

    {
        let button = config.button.clone();
        let mut input = SimButton::new(store.button_path());
        let mut reset = HostReset {
            store: store.clone(),
        };
        let fault_tx = fault_tx.clone();
        spawn_task(RESET_TASK, move || {
            if let Err(err) =
                supervisor::run_button_loop(&button, &mut input, &mut reset, &mut StdPacer)
            {
                let _ = fault_tx.send(err);
            }
        })?;
    }

    {
        let measurement = config.measurement.clone();
        let actuator = switch.state();
        let connectivity = connectivity.clone();
        let mut input = SimCurrentInput::new(actuator.clone(), &measurement);
        let mut sink = MqttSink(mqtt.clone());
        let fault_tx = fault_tx.clone();
        spawn_task(CURRENT_TASK, move || {
            match supervisor::run_measurement_loop(
                measurement,
                &mut input,
                &mut StdPacer,
                &actuator,
                &connectivity,
                &mut sink,
                || {},
            ) {
                Ok(never) => match never {},
                Err(err) => {
                    let _ = fault_tx.send(err);
                }
            }
        })?;
    }

    {
        let lifecycle = PairingLifecycle::new(config.pairing.clone());
        let connectivity = connectivity.clone();
        let radio = Arc::clone(&radio);
        spawn_task(PAIRING_TASK, move || {
            lifecycle.run(&connectivity, &mut StdPacer, &radio);
        })?;
    }

    spawn_mqtt_loop(mqtt, eventloop, Arc::clone(&switch), connectivity, fault_tx);

    tokio::select! {
        Some(err) = fault_rx.recv() => {
            error!("fatal device fault: {err}");
            Err(anyhow!(err).context("control loop stopped"))
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutting down");
            Ok(())
        }
    }
}

fn apply_env_overrides(config: &mut SocketConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        config.network.mqtt_pass = pass;
    }
}

fn spawn_task<F>(spec: TaskSpec, body: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    // Host threads format through tracing and need more than the target budget.
    thread::Builder::new()
        .name(spec.name.into())
        .stack_size(spec.stack_size.max(64 * 1024))
        .spawn(body)
        .with_context(|| format!("failed to spawn {}", spec.name))?;
    Ok(())
}

fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    switch: Arc<Switch<SimRelay>>,
    connectivity: ConnectivitySignal,
    fault_tx: mpsc::UnboundedSender<DeviceError>,
) {
    tokio::spawn(async move {
        let mut subscription = CommandSubscription::new();

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    connectivity.set_reachable(true);
                    subscription.on_connected();
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    match handle_message(&switch, &message.topic, &message.payload) {
                        Ok(CommandOutcome::Applied { changed }) => {
                            info!("relay command applied (changed={changed})");
                        }
                        Ok(CommandOutcome::Ignored) => {}
                        Err(err) if err.is_fatal() => {
                            let _ = fault_tx.send(err);
                            return;
                        }
                        Err(err) => warn!("relay command failed: {err}"),
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    connectivity.set_reachable(false);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(MQTT_RETRY_DELAY).await;
                }
            }

            if subscription.take_pending() {
                if let Err(err) = mqtt.try_subscribe(TOPIC_RELAY_COMMAND, QoS::AtMostOnce) {
                    warn!("mqtt subscribe failed: {err}");
                    subscription.on_failed();
                }
            }
        }
    });
}

#[derive(Clone)]
struct HostStore {
    data_dir: Arc<PathBuf>,
}

impl HostStore {
    fn new() -> Self {
        let data_dir = std::env::var("SOCKET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.socket"));

        Self {
            data_dir: Arc::new(data_dir),
        }
    }

    fn runtime_path(&self) -> PathBuf {
        self.data_dir.join("runtime.json")
    }

    fn button_path(&self) -> PathBuf {
        self.data_dir.join("button.pressed")
    }

    async fn load_config(&self) -> anyhow::Result<SocketConfig> {
        match tokio::fs::read(self.runtime_path()).await {
            Ok(raw) => Ok(serde_json::from_slice::<SocketConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(SocketConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn erase(&self) -> std::io::Result<()> {
        match std::fs::remove_file(self.runtime_path()) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// Stands in for the relay GPIO.
struct SimRelay;

impl RelayDriver for SimRelay {
    fn set_energized(&mut self, energized: bool) -> Result<(), DeviceError> {
        info!("[relay] output {}", if energized { "high" } else { "low" });
        Ok(())
    }
}

/// Synthesizes a 50 Hz load current that flows only while the relay is on.
/// `SOCKET_SIM_LOAD_AMPS` sets the load (default 1.5 A RMS).
struct SimCurrentInput {
    actuator: ActuatorState,
    amplitude_raw: f64,
    index: u64,
}

impl SimCurrentInput {
    fn new(actuator: ActuatorState, config: &MeasurementConfig) -> Self {
        let load_amps = std::env::var("SOCKET_SIM_LOAD_AMPS")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .unwrap_or(1.5);

        Self {
            actuator,
            amplitude_raw: load_amps * 2.0_f64.sqrt() / f64::from(config.amps_per_raw()),
            index: 0,
        }
    }
}

impl AnalogInput for SimCurrentInput {
    fn read_raw(&mut self) -> Result<u16, DeviceError> {
        self.index = self.index.wrapping_add(1);

        // Small deterministic ripple so the noise floor has something to hide.
        let ripple = ((self.index * 7) % 5) as f64 - 2.0;
        let tone = if self.actuator.get() {
            let phase = (self.index as f64) / SIM_SAMPLES_PER_CYCLE;
            self.amplitude_raw * (2.0 * PI * phase).sin()
        } else {
            0.0
        };

        Ok((SIM_OFFSET_RAW + tone + ripple).clamp(0.0, 4_095.0).round() as u16)
    }
}

/// The button counts as held while `button.pressed` exists in the data dir.
struct SimButton {
    marker: PathBuf,
}

impl SimButton {
    fn new(marker: PathBuf) -> Self {
        Self { marker }
    }
}

impl ButtonInput for SimButton {
    fn is_pressed(&mut self) -> Result<bool, DeviceError> {
        self.marker
            .try_exists()
            .map_err(|err| DeviceError::DigitalRead(err.to_string()))
    }
}

struct SimPairingRadio {
    service_name: String,
}

impl SimPairingRadio {
    fn start(config: &SocketConfig) -> Self {
        info!(
            "[pairing] advertising `{}` until the network is reachable",
            config.pairing.service_name
        );
        Self {
            service_name: config.pairing.service_name.clone(),
        }
    }
}

impl PairingRadio for SimPairingRadio {
    fn stop(&mut self) -> Result<(), DeviceError> {
        info!("[pairing] `{}` stopped", self.service_name);
        Ok(())
    }
}

struct HostReset {
    store: HostStore,
}

impl FactoryReset for HostReset {
    fn erase_configuration(&mut self) -> Result<(), DeviceError> {
        self.store
            .erase()
            .map_err(|err| DeviceError::ConfigErase(err.to_string()))
    }

    fn restart(&mut self) {
        // The host has no reset line; exit and let the service manager relaunch.
        warn!("restart requested");
        std::process::exit(0);
    }
}

struct MqttSink(AsyncClient);

impl TelemetrySink for MqttSink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), DeviceError> {
        self.0
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|err| DeviceError::Publish(err.to_string()))
    }
}
