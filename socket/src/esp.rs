use std::{
    ffi::CString,
    ptr,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::mqtt::client::{Details, EventPayload, QoS};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        adc::{
            attenuation::DB_11,
            oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
            ADC1,
        },
        delay::{Ets, FreeRtos},
        gpio::{AnyOutputPin, Gpio3, Gpio9, Input, Level, Output, PinDriver, Pull},
        peripherals::Peripherals,
        task::thread::ThreadSpawnConfiguration,
    },
    ipv4::IpEvent,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{self, esp, EspError},
    wifi::{EspWifi, WifiEvent},
};
use log::{error, info, warn};

use socket_common::{
    command::handle_message,
    supervisor::{self, TaskSpec, COMMAND_TASK, CURRENT_TASK, PAIRING_TASK, RESET_TASK},
    AnalogInput, ButtonInput, CommandOutcome, CommandSubscription, ConnectivitySignal,
    DeviceError, FactoryReset, NetworkConfig, Pacer, PairingConfig, PairingLifecycle,
    PairingRadio, RadioGuard, RelayDriver, SocketConfig, Switch, TelemetrySink,
    TOPIC_RELAY_COMMAND,
};

const NVS_NAMESPACE: &str = "socket";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(2);

type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    // Erases and re-initialises NVS when the partition is full or from a
    // newer layout.
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        SocketConfig::default()
    });
    config.sanitize();

    info!(
        "NVS config loaded: mqtt=`{}:{}`, pairing=`{}`",
        config.network.mqtt_host, config.network.mqtt_port, config.pairing.service_name
    );

    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let relay = GpioRelay(PinDriver::output(AnyOutputPin::from(pins.gpio8))?);
    let switch = Arc::new(Switch::new(relay).context("failed to drive relay low")?);

    let connectivity = ConnectivitySignal::new();
    let _ip_subscription = {
        let connectivity = connectivity.clone();
        sys_loop.subscribe::<IpEvent, _>(move |event| {
            if matches!(event, IpEvent::DhcpIpAssigned(_)) {
                connectivity.set_reachable(true);
            }
        })?
    };
    let _wifi_subscription = {
        let connectivity = connectivity.clone();
        sys_loop.subscribe::<WifiEvent, _>(move |event| {
            if matches!(event, WifiEvent::StaDisconnected { .. }) {
                connectivity.set_reachable(false);
                if let Err(err) = esp!(unsafe { sys::esp_wifi_connect() }) {
                    warn!("wifi reconnect request failed: {err}");
                }
            }
        })?
    };

    let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))
        .context("wifi init failed")?;
    let radio = Arc::new(RadioGuard::new(
        BleProvisioning::start(&config.pairing).context("failed to start pairing radio")?,
    ));

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    {
        let button = config.button.clone();
        let input = pins.gpio9;
        spawn_task(RESET_TASK, move || {
            let mut input = match PinDriver::input(input)
                .and_then(|mut pin| pin.set_pull(Pull::Up).map(|()| pin))
            {
                Ok(pin) => GpioButton(pin),
                Err(err) => restart_on_fault(RESET_TASK, &anyhow!(err)),
            };
            if let Err(err) =
                supervisor::run_button_loop(&button, &mut input, &mut NvsReset, &mut EspPacer)
            {
                restart_on_fault(RESET_TASK, &anyhow!(err));
            }
        })?;
    }

    let mqtt_slot: Arc<OnceLock<SharedMqtt>> = Arc::new(OnceLock::new());

    {
        let measurement = config.measurement.clone();
        let actuator = switch.state();
        let connectivity = connectivity.clone();
        let mut sink = MqttSink(Arc::clone(&mqtt_slot));
        let gpio3 = pins.gpio3;
        spawn_task(CURRENT_TASK, move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register measurement task with watchdog: {err:#}");
            }

            let mut input = match CurrentSenseAdc::new(adc1, gpio3) {
                Ok(input) => input,
                Err(err) => restart_on_fault(CURRENT_TASK, &err),
            };

            match supervisor::run_measurement_loop(
                measurement,
                &mut input,
                &mut EspPacer,
                &actuator,
                &connectivity,
                &mut sink,
                feed_watchdog,
            ) {
                Ok(never) => match never {},
                Err(err) => restart_on_fault(CURRENT_TASK, &anyhow!(err)),
            }
        })?;
    }

    {
        let lifecycle = PairingLifecycle::new(config.pairing.clone());
        let connectivity = connectivity.clone();
        let radio = Arc::clone(&radio);
        spawn_task(PAIRING_TASK, move || {
            lifecycle.run(&connectivity, &mut EspPacer, &radio);
        })?;
    }

    // The broker is only dialled once the station has an address.
    connectivity.wait_reachable_forever();

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&config.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    spawn_mqtt_receiver(Arc::clone(&switch), mqtt_conn, Arc::clone(&mqtt_client))?;
    let _ = mqtt_slot.set(mqtt_client);

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn spawn_task<F>(spec: TaskSpec, body: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    ThreadSpawnConfiguration {
        stack_size: spec.stack_size,
        priority: spec.priority,
        ..Default::default()
    }
    .set()?;

    let spawned = thread::Builder::new()
        .name(spec.name.into())
        .stack_size(spec.stack_size)
        .spawn(body);

    ThreadSpawnConfiguration::default().set()?;
    spawned.with_context(|| format!("failed to spawn {}", spec.name))?;
    Ok(())
}

fn restart_on_fault(task: TaskSpec, err: &anyhow::Error) -> ! {
    error!("{}: fatal hardware fault, restarting: {err:#}", task.name);
    thread::sleep(Duration::from_millis(100));
    unsafe { sys::esp_restart() }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    switch: Arc<Switch<GpioRelay>>,
    mut conn: EspMqttConnection,
    mqtt: SharedMqtt,
) -> anyhow::Result<()> {
    spawn_task(COMMAND_TASK, move || {
        let mut subscription = CommandSubscription::new();

        loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        subscription.on_connected();
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => match handle_message(&switch, topic, data) {
                        Ok(CommandOutcome::Applied { changed }) => {
                            info!("relay command applied (changed={changed})");
                        }
                        Ok(CommandOutcome::Ignored) => {}
                        Err(err) if err.is_fatal() => {
                            restart_on_fault(COMMAND_TASK, &anyhow!(err))
                        }
                        Err(err) => warn!("relay command failed: {err}"),
                    },
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(MQTT_RETRY_DELAY);
                }
            }

            // The event is released here; the client lock is free again.
            if subscription.take_pending() {
                let subscribed = mqtt
                    .lock()
                    .unwrap()
                    .subscribe(TOPIC_RELAY_COMMAND, QoS::AtMostOnce);
                if let Err(err) = subscribed {
                    warn!("mqtt subscribe failed: {err:?}");
                    subscription.on_failed();
                }
            }
        }
    })
}

struct GpioRelay(PinDriver<'static, AnyOutputPin, Output>);

impl RelayDriver for GpioRelay {
    fn set_energized(&mut self, energized: bool) -> Result<(), DeviceError> {
        self.0
            .set_level(Level::from(energized))
            .map_err(|err| DeviceError::OutputWrite(err.to_string()))
    }
}

/// Active-low with the internal pull-up.
struct GpioButton(PinDriver<'static, Gpio9, Input>);

impl ButtonInput for GpioButton {
    fn is_pressed(&mut self) -> Result<bool, DeviceError> {
        Ok(self.0.is_low())
    }
}

struct CurrentSenseAdc {
    channel: AdcChannelDriver<'static, Gpio3, AdcDriver<'static, ADC1>>,
}

impl CurrentSenseAdc {
    fn new(adc1: ADC1, pin: Gpio3) -> anyhow::Result<Self> {
        let adc = AdcDriver::new(adc1).context("adc1 init failed")?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(adc, pin, &config).context("adc1 ch3 init failed")?;
        Ok(Self { channel })
    }
}

impl AnalogInput for CurrentSenseAdc {
    fn read_raw(&mut self) -> Result<u16, DeviceError> {
        self.channel
            .read_raw()
            .map_err(|err| DeviceError::AnalogRead(err.to_string()))
    }
}

struct EspPacer;

impl Pacer for EspPacer {
    fn delay_us(&mut self, micros: u32) {
        Ets::delay_us(micros);
    }

    fn yield_now(&mut self) {
        // One FreeRTOS tick lets the idle task run and service its watchdog.
        unsafe { sys::vTaskDelay(1) };
    }

    fn sleep(&mut self, duration: Duration) {
        FreeRtos::delay_ms(duration.as_millis().try_into().unwrap_or(u32::MAX));
    }
}

/// BLE provisioning manager. The strings are kept alive for as long as the
/// manager may read them.
struct BleProvisioning {
    _service_name: CString,
    _proof_of_possession: CString,
}

impl BleProvisioning {
    fn start(pairing: &PairingConfig) -> anyhow::Result<Self> {
        let service_name = CString::new(pairing.service_name.as_str())?;
        let proof_of_possession = CString::new(pairing.proof_of_possession.as_str())?;

        let prov_config = sys::wifi_prov_mgr_config_t {
            scheme: unsafe { sys::wifi_prov_scheme_ble },
            scheme_event_handler: sys::wifi_prov_event_handler_t {
                event_cb: Some(sys::wifi_prov_scheme_ble_event_cb_free_btdm),
                user_data: ptr::null_mut(),
            },
            app_event_handler: sys::wifi_prov_event_handler_t {
                event_cb: None,
                user_data: ptr::null_mut(),
            },
        };

        esp!(unsafe { sys::wifi_prov_mgr_init(prov_config) })?;
        esp!(unsafe {
            sys::wifi_prov_mgr_start_provisioning(
                sys::wifi_prov_security_WIFI_PROV_SECURITY_1,
                proof_of_possession.as_ptr().cast(),
                service_name.as_ptr(),
                ptr::null(),
            )
        })?;

        info!("pairing radio advertising `{}`", pairing.service_name);
        Ok(Self {
            _service_name: service_name,
            _proof_of_possession: proof_of_possession,
        })
    }
}

impl PairingRadio for BleProvisioning {
    fn stop(&mut self) -> Result<(), DeviceError> {
        unsafe { sys::wifi_prov_mgr_stop_provisioning() };
        Ok(())
    }
}

struct NvsReset;

impl FactoryReset for NvsReset {
    fn erase_configuration(&mut self) -> Result<(), DeviceError> {
        esp!(unsafe { sys::nvs_flash_erase() })
            .map_err(|err: EspError| DeviceError::ConfigErase(err.to_string()))
    }

    fn restart(&mut self) {
        unsafe { sys::esp_restart() };
    }
}

/// Telemetry goes out only once the MQTT client exists.
struct MqttSink(Arc<OnceLock<SharedMqtt>>);

impl TelemetrySink for MqttSink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), DeviceError> {
        let Some(client) = self.0.get() else {
            return Err(DeviceError::Publish("mqtt client not started".into()));
        };

        client
            .lock()
            .unwrap()
            .enqueue(topic, QoS::AtLeastOnce, false, payload)
            .map(|_| ())
            .map_err(|err| DeviceError::Publish(err.to_string()))
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<SocketConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<SocketConfig>(value)?),
            None => Ok(SocketConfig::default()),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 1,
        trigger_panic: true,
    };
    let rc = unsafe { sys::esp_task_wdt_init(&config) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { sys::esp_task_wdt_add(ptr::null_mut()) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { sys::esp_task_wdt_reset() };
}
