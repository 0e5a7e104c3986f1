use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    pub calibration_samples: u32,
    pub rms_samples: u32,
    pub sample_interval_us: u32,
    pub yield_every_samples: u32,
    pub cycle_period_ms: u64,
    pub adc_vref_mv: f32,
    pub adc_max_raw: f32,
    pub current_ratio: f32,
    pub noise_threshold_a: f32,
    pub noise_bias_a: f32,
    /// Mains voltage is not sensed; power is `current * nominal_voltage_v`.
    pub nominal_voltage_v: f32,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            calibration_samples: 100,
            rms_samples: 1_000,
            sample_interval_us: 50,
            yield_every_samples: 200,
            cycle_period_ms: 2_000,
            adc_vref_mv: 3_100.0,
            adc_max_raw: 4_095.0,
            current_ratio: 100.0,
            noise_threshold_a: 0.18,
            noise_bias_a: 0.05,
            nominal_voltage_v: 220.0,
        }
    }
}

impl MeasurementConfig {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }

    /// Amps per raw ADC unit of RMS deviation.
    pub fn amps_per_raw(&self) -> f32 {
        (self.adc_vref_mv / self.adc_max_raw) / self.current_ratio
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.calibration_samples = self.calibration_samples.clamp(1, 10_000);
        self.rms_samples = self.rms_samples.clamp(1, 100_000);
        self.sample_interval_us = self.sample_interval_us.min(10_000);
        self.yield_every_samples = self.yield_every_samples.max(1);
        self.cycle_period_ms = self.cycle_period_ms.clamp(1, 3_600_000);

        if !(self.adc_vref_mv.is_finite() && self.adc_vref_mv > 0.0) {
            self.adc_vref_mv = defaults.adc_vref_mv;
        }
        if !(self.adc_max_raw.is_finite() && self.adc_max_raw >= 1.0) {
            self.adc_max_raw = defaults.adc_max_raw;
        }
        if !(self.current_ratio.is_finite() && self.current_ratio > 0.0) {
            self.current_ratio = defaults.current_ratio;
        }
        if !(self.noise_threshold_a.is_finite() && self.noise_threshold_a >= 0.0) {
            self.noise_threshold_a = defaults.noise_threshold_a;
        }
        if !(self.noise_bias_a.is_finite() && self.noise_bias_a >= 0.0) {
            self.noise_bias_a = defaults.noise_bias_a;
        }
        // Readings just above the floor must stay positive after the bias.
        self.noise_bias_a = self.noise_bias_a.min(self.noise_threshold_a);
        if !(self.nominal_voltage_v.is_finite() && self.nominal_voltage_v > 0.0) {
            self.nominal_voltage_v = defaults.nominal_voltage_v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub poll_interval_ms: u64,
    pub long_press_ms: u64,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            long_press_ms: 5_000,
        }
    }
}

impl ButtonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Consecutive pressed polls that make up a long press.
    pub fn long_press_ticks(&self) -> u32 {
        let ticks = self.long_press_ms / self.poll_interval_ms.max(1);
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }

    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(10, 1_000);
        self.long_press_ms = self.long_press_ms.clamp(self.poll_interval_ms, 60_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    pub network_timeout_ms: u64,
    pub settle_ms: u64,
    pub service_name: String,
    pub proof_of_possession: String,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            network_timeout_ms: 60_000,
            settle_ms: 5_000,
            service_name: "PROV_C3_SMART_HANG".to_string(),
            proof_of_possession: "12345678_HANG".to_string(),
        }
    }
}

impl PairingConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.network_timeout_ms = self.network_timeout_ms.clamp(1_000, 3_600_000);
        self.settle_ms = self.settle_ms.min(60_000);

        // The BLE advertising name is limited to 29 bytes.
        if self.service_name.is_empty() || self.service_name.len() > 29 {
            self.service_name = defaults.service_name;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            client_id: "smart-socket-c3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub button: ButtonConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl SocketConfig {
    pub fn sanitize(&mut self) {
        self.measurement.sanitize();
        self.button.sanitize();
        self.pairing.sanitize();

        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = 1883;
        }
        if self.network.client_id.is_empty() {
            self.network.client_id = NetworkConfig::default().client_id;
        }
    }
}
