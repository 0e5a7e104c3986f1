use std::{
    thread,
    time::{Duration, Instant},
};

/// Timing primitives a control loop needs from its scheduler.
pub trait Pacer {
    /// Busy-wait between ADC samples. Does not give up the core.
    fn delay_us(&mut self, micros: u32);

    /// Give up the core for the scheduler's minimum quantum (one tick).
    fn yield_now(&mut self);

    /// Blocking timed wait between loop cycles.
    fn sleep(&mut self, duration: Duration);
}

/// Yield once every `every` iterations of a tight loop.
///
/// Iteration 0 yields, matching a `i % every == 0` check, so a 1000-sample
/// pass at the default cadence of 200 yields five times. Each yield costs
/// one scheduler tick; the RMS estimate is a mean over squared deviations
/// and does not depend on sample spacing, so the gaps only lengthen the
/// measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldPolicy {
    every: u32,
}

impl YieldPolicy {
    pub fn every(every: u32) -> Self {
        Self {
            every: every.max(1),
        }
    }

    pub fn should_yield(self, iteration: u32) -> bool {
        iteration % self.every == 0
    }
}

/// Pacer backed by OS threads, used on the host and in threaded runtimes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPacer;

impl Pacer for StdPacer {
    fn delay_us(&mut self, micros: u32) {
        let until = Instant::now() + Duration::from_micros(u64::from(micros));
        while Instant::now() < until {
            std::hint::spin_loop();
        }
    }

    fn yield_now(&mut self) {
        thread::sleep(Duration::from_millis(1));
    }

    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cadence_yields_five_times_per_pass() {
        let policy = YieldPolicy::every(200);
        let yields = (0..1_000).filter(|&i| policy.should_yield(i)).count();

        assert_eq!(yields, 5);
    }

    #[test]
    fn zero_cadence_is_treated_as_every_sample() {
        let policy = YieldPolicy::every(0);

        assert!(policy.should_yield(0));
        assert!(policy.should_yield(7));
    }

    #[test]
    fn yields_land_on_block_starts() {
        let policy = YieldPolicy::every(200);
        let at: Vec<u32> = (0..401).filter(|&i| policy.should_yield(i)).collect();

        assert_eq!(at, vec![0, 200, 400]);
    }

    #[test]
    fn std_pacer_delay_waits_at_least_requested() {
        let start = Instant::now();
        StdPacer.delay_us(200);
        assert!(start.elapsed() >= Duration::from_micros(200));
    }
}
