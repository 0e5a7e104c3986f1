use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use log::{info, warn};

use crate::{config::PairingConfig, error::DeviceError, pacer::Pacer};

/// ```text
///   AwaitingNetwork ──reachable──▶ SettlingGrace ──settle──▶ Stopped
///          │                                                   ▲
///          └─────────────────────timeout───────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    AwaitingNetwork,
    SettlingGrace,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    NetworkReachable,
    TimedOut,
}

/// Blocks until the network is reachable or `timeout` elapses.
pub trait ConnectivityWait {
    fn wait_reachable(&self, timeout: Duration) -> WaitOutcome;
}

/// Level-triggered connectivity flag shared between the network
/// collaborator (writer) and the pairing and telemetry paths (readers).
#[derive(Debug, Clone, Default)]
pub struct ConnectivitySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ConnectivitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        let (lock, cvar) = &*self.inner;
        let mut current = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != reachable {
            *current = reachable;
            info!("network {}", if reachable { "reachable" } else { "unreachable" });
        }
        cvar.notify_all();
    }

    pub fn is_reachable(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait_reachable_forever(&self) {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = cvar
            .wait_while(guard, |reachable| !*reachable)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl ConnectivityWait for ConnectivitySignal {
    fn wait_reachable(&self, timeout: Duration) -> WaitOutcome {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut reachable = lock.lock().unwrap_or_else(PoisonError::into_inner);

        while !*reachable {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            reachable = cvar
                .wait_timeout(reachable, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        WaitOutcome::NetworkReachable
    }
}

/// The external pairing transport.
pub trait PairingRadio {
    fn stop(&mut self) -> Result<(), DeviceError>;
}

/// Owns the radio and guarantees `stop` reaches it at most once, even when
/// shut down from several contexts.
pub struct RadioGuard<R> {
    radio: Mutex<R>,
    stopped: AtomicBool,
}

impl<R: PairingRadio> RadioGuard<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio: Mutex::new(radio),
            stopped: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns `Ok(false)` when an earlier call already stopped the radio.
    pub fn shutdown_once(&self) -> Result<bool, DeviceError> {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        warn!("stopping pairing radio");
        let mut radio = self.radio.lock().unwrap_or_else(PoisonError::into_inner);
        radio.stop()?;
        info!("pairing radio off");
        Ok(true)
    }

    #[cfg(test)]
    pub fn with_radio<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        let radio = self.radio.lock().unwrap_or_else(PoisonError::into_inner);
        f(&radio)
    }
}

/// The radio is shut down on entry to `Stopped`, at most once. Pairing that
/// times out is abandoned, not retried.
pub struct PairingLifecycle {
    config: PairingConfig,
    state: PairingState,
}

impl PairingLifecycle {
    pub fn new(config: PairingConfig) -> Self {
        Self {
            config,
            state: PairingState::AwaitingNetwork,
        }
    }

    /// Advances on the result of the initial wait. Only `AwaitingNetwork`
    /// reacts; later outcomes are ignored.
    pub fn on_wait_outcome(&mut self, outcome: WaitOutcome) -> PairingState {
        if self.state == PairingState::AwaitingNetwork {
            self.state = match outcome {
                WaitOutcome::NetworkReachable => {
                    info!("network joined; pairing radio stops in {:?}", self.config.settle());
                    PairingState::SettlingGrace
                }
                WaitOutcome::TimedOut => {
                    warn!("pairing timed out");
                    PairingState::Stopped
                }
            };
        }
        self.state
    }

    pub fn on_settled(&mut self) -> PairingState {
        if self.state == PairingState::SettlingGrace {
            self.state = PairingState::Stopped;
        }
        self.state
    }

    /// Drives the lifecycle to `Stopped` and shuts the radio down.
    ///
    /// The wait is the only suspension point besides the settle sleep. A
    /// failed shutdown is logged; pairing is not retried either way.
    pub fn run<C, P, R>(mut self, connectivity: &C, pacer: &mut P, radio: &RadioGuard<R>)
    where
        C: ConnectivityWait,
        P: Pacer,
        R: PairingRadio,
    {
        let outcome = connectivity.wait_reachable(self.config.network_timeout());

        if self.on_wait_outcome(outcome) == PairingState::SettlingGrace {
            pacer.sleep(self.config.settle());
            self.on_settled();
        }

        if let Err(err) = radio.shutdown_once() {
            warn!("pairing radio shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, thread};

    use super::*;
    use pretty_assertions::assert_eq;

    /// Virtual time shared between the wait primitive, the pacer and the radio.
    #[derive(Default)]
    struct VirtualClock {
        now: Cell<Duration>,
        reachable_at: Option<Duration>,
    }

    impl ConnectivityWait for Rc<VirtualClock> {
        fn wait_reachable(&self, timeout: Duration) -> WaitOutcome {
            let deadline = self.now.get() + timeout;
            match self.reachable_at {
                Some(at) if at <= deadline => {
                    self.now.set(self.now.get().max(at));
                    WaitOutcome::NetworkReachable
                }
                _ => {
                    self.now.set(deadline);
                    WaitOutcome::TimedOut
                }
            }
        }
    }

    struct ClockPacer(Rc<VirtualClock>);

    impl Pacer for ClockPacer {
        fn delay_us(&mut self, micros: u32) {
            let now = self.0.now.get();
            self.0.now.set(now + Duration::from_micros(u64::from(micros)));
        }

        fn yield_now(&mut self) {}

        fn sleep(&mut self, duration: Duration) {
            self.0.now.set(self.0.now.get() + duration);
        }
    }

    struct RecordingRadio {
        clock: Rc<VirtualClock>,
        stopped_at: Vec<Duration>,
    }

    impl PairingRadio for RecordingRadio {
        fn stop(&mut self) -> Result<(), DeviceError> {
            self.stopped_at.push(self.clock.now.get());
            Ok(())
        }
    }

    fn config() -> PairingConfig {
        PairingConfig {
            network_timeout_ms: 60_000,
            settle_ms: 5_000,
            ..PairingConfig::default()
        }
    }

    fn run_with(reachable_at: Option<Duration>) -> (Vec<Duration>, RadioGuard<RecordingRadio>) {
        let clock = Rc::new(VirtualClock {
            now: Cell::new(Duration::ZERO),
            reachable_at,
        });
        let radio = RadioGuard::new(RecordingRadio {
            clock: Rc::clone(&clock),
            stopped_at: Vec::new(),
        });

        PairingLifecycle::new(config()).run(&clock, &mut ClockPacer(Rc::clone(&clock)), &radio);

        let stops = radio.with_radio(|radio| radio.stopped_at.clone());
        (stops, radio)
    }

    #[test]
    fn network_join_stops_radio_after_settle() {
        let (stops, radio) = run_with(Some(Duration::from_secs(10)));

        assert_eq!(stops, vec![Duration::from_secs(15)]);
        assert!(radio.is_stopped());
    }

    #[test]
    fn timeout_stops_radio_without_settle() {
        let (stops, _) = run_with(None);

        assert_eq!(stops, vec![Duration::from_secs(60)]);
    }

    #[test]
    fn join_after_timeout_counts_as_timeout() {
        let (stops, _) = run_with(Some(Duration::from_secs(61)));

        assert_eq!(stops, vec![Duration::from_secs(60)]);
    }

    #[test]
    fn late_reachable_event_does_not_stop_again() {
        let (_, radio) = run_with(Some(Duration::from_secs(10)));

        let mut lifecycle = PairingLifecycle::new(config());
        lifecycle.on_wait_outcome(WaitOutcome::TimedOut);
        assert_eq!(
            lifecycle.on_wait_outcome(WaitOutcome::NetworkReachable),
            PairingState::Stopped
        );

        assert!(!radio.shutdown_once().unwrap());
        assert_eq!(radio.with_radio(|radio| radio.stopped_at.len()), 1);
    }

    #[test]
    fn transitions_only_move_forward() {
        let mut lifecycle = PairingLifecycle::new(config());
        assert_eq!(lifecycle.on_settled(), PairingState::AwaitingNetwork);

        assert_eq!(
            lifecycle.on_wait_outcome(WaitOutcome::NetworkReachable),
            PairingState::SettlingGrace
        );
        assert_eq!(
            lifecycle.on_wait_outcome(WaitOutcome::TimedOut),
            PairingState::SettlingGrace
        );
        assert_eq!(lifecycle.on_settled(), PairingState::Stopped);
        assert_eq!(lifecycle.on_settled(), PairingState::Stopped);
    }

    struct CountingRadio(Arc<std::sync::atomic::AtomicUsize>);

    impl PairingRadio for CountingRadio {
        fn stop(&mut self) -> Result<(), DeviceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn concurrent_shutdowns_reach_radio_once() {
        let stops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let guard = Arc::new(RadioGuard::new(CountingRadio(Arc::clone(&stops))));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                thread::spawn(move || guard.shutdown_once().unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|stopped| *stopped)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_wakes_waiter_when_set() {
        let signal = ConnectivitySignal::new();
        let setter = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.set_reachable(true);
            })
        };

        let outcome = signal.wait_reachable(Duration::from_secs(5));
        setter.join().unwrap();

        assert_eq!(outcome, WaitOutcome::NetworkReachable);
    }

    #[test]
    fn signal_times_out_when_never_set() {
        let signal = ConnectivitySignal::new();
        let start = Instant::now();

        let outcome = signal.wait_reachable(Duration::from_millis(30));

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn signal_already_set_returns_immediately() {
        let signal = ConnectivitySignal::new();
        signal.set_reachable(true);

        assert_eq!(
            signal.wait_reachable(Duration::ZERO),
            WaitOutcome::NetworkReachable
        );
        signal.wait_reachable_forever();

        signal.set_reachable(false);
        assert!(!signal.is_reachable());
    }
}
