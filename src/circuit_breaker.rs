// src/circuit_breaker.rs
// Circuit breaker for external dependencies: tracks failures and temporarily
// excludes dependencies that are down.

use crate::evidence::SourceKind;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default failures within the window before the circuit trips.
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default window in which failures are counted.
const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default time a tripped circuit stays open before allowing a probe.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// An external collaborator guarded by its own circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    Model,
    Source(SourceKind),
    TraceBackend,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Source(kind) => write!(f, "source:{}", kind),
            Self::TraceBackend => write!(f, "trace_backend"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Circuit state for a single dependency.
#[derive(Debug, Clone)]
enum State {
    /// Normal operation, tracking recent consecutive failures.
    Closed { failures: Vec<Instant> },
    /// Tripped: all calls are rejected until cooldown expires.
    Open { tripped_at: Instant },
    /// Cooldown expired: one probe call is in flight. A probe that never
    /// reports back (cancelled, dropped) expires after another cooldown.
    HalfOpen { probe_at: Instant },
}

impl Default for State {
    fn default() -> Self {
        Self::Closed {
            failures: Vec::new(),
        }
    }
}

/// Thread-safe circuit breaker shared by every request.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    states: Arc<Mutex<HashMap<Dependency, State>>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_settings(BreakerSettings::default())
    }

    pub fn with_settings(settings: BreakerSettings) -> Self {
        Self {
            settings,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Check whether a dependency may be called.
    ///
    /// Returns `true` if the circuit is Closed or transitions to HalfOpen
    /// (allowing a single probe). Returns `false` while Open.
    pub fn is_available(&self, dep: Dependency) -> bool {
        let Ok(mut states) = self.states.lock() else {
            return true; // poisoned mutex: fail open
        };
        let state = states.entry(dep).or_default();

        match state {
            State::Closed { .. } => true,
            State::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.settings.cooldown {
                    info!(dependency = %dep, "Circuit half-open, allowing probe call");
                    *state = State::HalfOpen { probe_at: Instant::now() };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_at } => {
                if probe_at.elapsed() >= self.settings.cooldown {
                    warn!(dependency = %dep, "Probe call never reported back, allowing another");
                    *probe_at = Instant::now();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether the circuit is currently open, without consuming a probe.
    pub fn is_open(&self, dep: Dependency) -> bool {
        let Ok(states) = self.states.lock() else {
            return false;
        };
        match states.get(&dep) {
            Some(State::Open { tripped_at }) => tripped_at.elapsed() < self.settings.cooldown,
            Some(State::HalfOpen { probe_at }) => probe_at.elapsed() < self.settings.cooldown,
            _ => false,
        }
    }

    /// Record a successful call; resets the circuit to Closed.
    pub fn record_success(&self, dep: Dependency) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states.entry(dep).or_default();

        let was_half_open = matches!(state, State::HalfOpen { .. });
        *state = State::Closed {
            failures: Vec::new(),
        };

        if was_half_open {
            info!(dependency = %dep, "Circuit recovered (half-open probe succeeded)");
        }
    }

    /// Record a failed call; may trip the circuit.
    pub fn record_failure(&self, dep: Dependency) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states.entry(dep).or_default();
        let now = Instant::now();

        match state {
            State::Closed { failures } => {
                failures.push(now);
                let window = self.settings.failure_window;
                failures.retain(|t| now.duration_since(*t) < window);

                if failures.len() as u32 >= self.settings.failure_threshold {
                    warn!(
                        dependency = %dep,
                        failures = failures.len(),
                        "Circuit tripped, dependency will be skipped for {}s",
                        self.settings.cooldown.as_secs()
                    );
                    *state = State::Open { tripped_at: now };
                }
            }
            State::HalfOpen { .. } => {
                warn!(dependency = %dep, "Half-open probe failed, circuit re-tripped");
                *state = State::Open { tripped_at: now };
            }
            State::Open { .. } => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
