use crate::{
    actuator::ActuatorState,
    config::MeasurementConfig,
    error::DeviceError,
    pacer::{Pacer, YieldPolicy},
    types::MeasurementSample,
};

/// One ADC channel returning raw counts.
pub trait AnalogInput {
    fn read_raw(&mut self) -> Result<u16, DeviceError>;
}

/// DC-offset compensated RMS current measurement.
///
/// Each cycle first re-acquires the zero-current bias of the sense circuit,
/// which drifts with temperature and supply, then integrates squared
/// deviations from that bias over a longer burst.
pub struct CurrentSensor {
    config: MeasurementConfig,
    offset_raw: i32,
}

impl CurrentSensor {
    pub fn new(config: MeasurementConfig) -> Self {
        Self {
            config,
            offset_raw: 0,
        }
    }

    /// Offset acquired by the most recent cycle.
    #[cfg(test)]
    pub fn offset_raw(&self) -> i32 {
        self.offset_raw
    }

    /// Runs one full measurement cycle. Any failed ADC read aborts the
    /// cycle; no stale value is substituted.
    pub fn measure<A, P>(
        &mut self,
        input: &mut A,
        pacer: &mut P,
        actuator: &ActuatorState,
    ) -> Result<MeasurementSample, DeviceError>
    where
        A: AnalogInput,
        P: Pacer,
    {
        self.offset_raw = self.calibrate(input, pacer)?;
        let rms_amps = self.sample_rms(input, pacer)?;
        Ok(self.report(rms_amps, actuator.get()))
    }

    fn calibrate<A: AnalogInput, P: Pacer>(
        &self,
        input: &mut A,
        pacer: &mut P,
    ) -> Result<i32, DeviceError> {
        let samples = self.config.calibration_samples.max(1);
        let mut sum: i64 = 0;

        for _ in 0..samples {
            sum += i64::from(input.read_raw()?);
            pacer.delay_us(self.config.sample_interval_us);
        }

        // Integer mean, truncated.
        Ok((sum / i64::from(samples)) as i32)
    }

    fn sample_rms<A: AnalogInput, P: Pacer>(
        &self,
        input: &mut A,
        pacer: &mut P,
    ) -> Result<f32, DeviceError> {
        let samples = self.config.rms_samples.max(1);
        let policy = YieldPolicy::every(self.config.yield_every_samples);
        let mut sum_sq: u64 = 0;

        for i in 0..samples {
            let deviation = i64::from(input.read_raw()?) - i64::from(self.offset_raw);
            sum_sq += deviation.unsigned_abs().pow(2);
            pacer.delay_us(self.config.sample_interval_us);

            if policy.should_yield(i) {
                pacer.yield_now();
            }
        }

        Ok(self.rms_amps(sum_sq, samples))
    }

    /// Converts an accumulated sum of squared raw deviations to RMS amps.
    pub fn rms_amps(&self, sum_sq: u64, samples: u32) -> f32 {
        let mean_sq = sum_sq as f64 / f64::from(samples.max(1));
        (mean_sq.sqrt() as f32) * self.config.amps_per_raw()
    }

    /// Applies the noise floor and derives power from the nominal voltage.
    pub fn report(&self, rms_amps: f32, energized: bool) -> MeasurementSample {
        let current_amps = if energized && rms_amps > self.config.noise_threshold_a {
            rms_amps - self.config.noise_bias_a
        } else {
            0.0
        };

        MeasurementSample {
            current_amps,
            power_watts: current_amps * self.config.nominal_voltage_v,
            relay_state: energized,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{f64::consts::PI, time::Duration};

    use super::*;
    use crate::{
        actuator::{RelayDriver, Switch},
        types::SwitchCommand,
    };
    use pretty_assertions::assert_eq;

    /// Returns `offset` for the calibration burst, then a sine of `amplitude`
    /// counts with a period of `period` samples.
    struct ToneInput {
        offset: f64,
        amplitude: f64,
        period: u32,
        calibration_samples: u32,
        reads: u32,
        fail_at: Option<u32>,
    }

    impl ToneInput {
        fn new(offset: f64, amplitude: f64) -> Self {
            Self {
                offset,
                amplitude,
                period: 20,
                calibration_samples: MeasurementConfig::default().calibration_samples,
                reads: 0,
                fail_at: None,
            }
        }
    }

    impl AnalogInput for ToneInput {
        fn read_raw(&mut self) -> Result<u16, DeviceError> {
            let index = self.reads;
            self.reads += 1;

            if self.fail_at == Some(index) {
                return Err(DeviceError::AnalogRead("adc1 ch3".into()));
            }

            let value = if index < self.calibration_samples {
                self.offset
            } else {
                let phase = f64::from(index - self.calibration_samples) / f64::from(self.period);
                self.offset + self.amplitude * (2.0 * PI * phase).sin()
            };
            Ok(value.round() as u16)
        }
    }

    #[derive(Default)]
    struct CountingPacer {
        delays: u32,
        yields: u32,
        yield_after_reads: Vec<u32>,
    }

    impl Pacer for CountingPacer {
        fn delay_us(&mut self, _micros: u32) {
            self.delays += 1;
        }

        fn yield_now(&mut self) {
            self.yields += 1;
            self.yield_after_reads.push(self.delays);
        }

        fn sleep(&mut self, _duration: Duration) {}
    }

    struct NullRelay;

    impl RelayDriver for NullRelay {
        fn set_energized(&mut self, _energized: bool) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn energized_state() -> ActuatorState {
        let switch = Switch::new(NullRelay).unwrap();
        switch.apply(SwitchCommand::On).unwrap();
        switch.state()
    }

    fn raw_rms_to_amps(raw_rms: f64) -> f32 {
        (raw_rms as f32) * MeasurementConfig::default().amps_per_raw()
    }

    #[test]
    fn rms_is_independent_of_dc_offset() {
        let amplitude = 400.0;
        let expected = raw_rms_to_amps(amplitude / 2.0_f64.sqrt());

        for offset in [1_000.0, 2_048.0, 3_200.0] {
            let mut sensor = CurrentSensor::new(MeasurementConfig::default());
            let mut input = ToneInput::new(offset, amplitude);
            let sample = sensor
                .measure(&mut input, &mut CountingPacer::default(), &energized_state())
                .unwrap();

            let measured = sample.current_amps + MeasurementConfig::default().noise_bias_a;
            assert!(
                (measured - expected).abs() < 0.005,
                "offset {offset}: measured {measured}, expected {expected}"
            );
            assert_eq!(sensor.offset_raw(), offset as i32);
        }
    }

    #[test]
    fn reports_zero_when_relay_is_off() {
        let mut sensor = CurrentSensor::new(MeasurementConfig::default());
        let mut input = ToneInput::new(2_048.0, 1_500.0);

        let sample = sensor
            .measure(&mut input, &mut CountingPacer::default(), &ActuatorState::new())
            .unwrap();

        assert_eq!(sample.current_amps, 0.0);
        assert_eq!(sample.power_watts, 0.0);
        assert!(!sample.relay_state);
    }

    #[test]
    fn noise_floor_suppresses_small_readings() {
        let sensor = CurrentSensor::new(MeasurementConfig::default());

        assert_eq!(sensor.report(0.18, true).current_amps, 0.0);
        assert_eq!(sensor.report(0.05, true).current_amps, 0.0);
        assert_eq!(sensor.report(0.0, true).current_amps, 0.0);
    }

    #[test]
    fn readings_above_floor_subtract_bias() {
        let sensor = CurrentSensor::new(MeasurementConfig::default());

        let sample = sensor.report(1.25, true);

        assert!((sample.current_amps - 1.20).abs() < 1e-6);
        assert!((sample.power_watts - 264.0).abs() < 1e-3);
        assert!(sample.relay_state);
    }

    #[test]
    fn reported_current_is_never_negative_above_floor() {
        let sensor = CurrentSensor::new(MeasurementConfig::default());
        let mut rms = 0.181_f32;
        while rms < 20.0 {
            assert!(sensor.report(rms, true).current_amps > 0.0, "rms {rms}");
            rms += 0.037;
        }
    }

    #[test]
    fn rms_conversion_uses_calibration_constants() {
        let sensor = CurrentSensor::new(MeasurementConfig::default());

        // Constant deviation of 4095 counts: 3100 mV / ratio 100 = 31 A.
        let amps = sensor.rms_amps(4_095_u64.pow(2) * 10, 10);

        assert!((amps - 31.0).abs() < 1e-3);
    }

    #[test]
    fn sampling_yields_periodically() {
        let mut sensor = CurrentSensor::new(MeasurementConfig::default());
        let mut input = ToneInput::new(2_048.0, 100.0);
        let mut pacer = CountingPacer::default();

        sensor
            .measure(&mut input, &mut pacer, &ActuatorState::new())
            .unwrap();

        assert_eq!(input.reads, 1_100);
        assert_eq!(pacer.delays, 1_100);
        assert_eq!(pacer.yields, 5);
        assert_eq!(pacer.yield_after_reads, vec![101, 301, 501, 701, 901]);
    }

    #[test]
    fn failed_read_aborts_the_cycle() {
        let mut sensor = CurrentSensor::new(MeasurementConfig::default());
        let mut input = ToneInput::new(2_048.0, 100.0);
        input.fail_at = Some(550);

        let err = sensor
            .measure(&mut input, &mut CountingPacer::default(), &energized_state())
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(input.reads, 551);
    }

    #[test]
    fn offset_is_reacquired_every_cycle() {
        let mut sensor = CurrentSensor::new(MeasurementConfig::default());
        let state = energized_state();

        let mut first = ToneInput::new(2_000.0, 300.0);
        sensor
            .measure(&mut first, &mut CountingPacer::default(), &state)
            .unwrap();
        assert_eq!(sensor.offset_raw(), 2_000);

        let mut drifted = ToneInput::new(2_100.0, 300.0);
        let sample = sensor
            .measure(&mut drifted, &mut CountingPacer::default(), &state)
            .unwrap();
        assert_eq!(sensor.offset_raw(), 2_100);

        let expected = raw_rms_to_amps(300.0 / 2.0_f64.sqrt()) - MeasurementConfig::default().noise_bias_a;
        assert!((sample.current_amps - expected).abs() < 0.005);
    }
}
