//! Stall detection and the consecutive-failure circuit breaker.
//!
//! [`StallDetector`] watches individual steps (worker attempts, verifications)
//! and reports a stall on lack of progress, repeated identical output or
//! elapsed wall-clock time. [`CircuitBreaker`] counts whole-lane failures.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{CircuitBreakerConfig, StallConfig};

/// Kind of step fed to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Worker,
    Tool,
    Verification,
    Merge,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub kind: StepKind,
    pub progress: bool,
    /// Fingerprint of the step's output, when it has one.
    pub signature: Option<String>,
}

/// Why the detector tripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum StallReason {
    NoProgress { steps: u32 },
    RepeatedOutput { repeats: u32 },
    Elapsed { secs: u64 },
    StepLimit { steps: u32 },
}

impl std::fmt::Display for StallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StallReason::NoProgress { steps } => {
                write!(f, "no progress in {} consecutive steps", steps)
            }
            StallReason::RepeatedOutput { repeats } => {
                write!(f, "identical output repeated {} times", repeats)
            }
            StallReason::Elapsed { secs } => write!(f, "run exceeded {}s", secs),
            StallReason::StepLimit { steps } => write!(f, "step limit of {} reached", steps),
        }
    }
}

#[derive(Debug)]
pub struct StallDetector {
    config: StallConfig,
    started: Instant,
    /// Time already spent before this detector was created.
    carried: Duration,
    steps: Vec<Step>,
    no_progress: u32,
    repeated: u32,
    last_signature: Option<String>,
}

impl StallDetector {
    pub fn new(config: StallConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            carried: Duration::ZERO,
            steps: Vec::new(),
            no_progress: 0,
            repeated: 0,
            last_signature: None,
        }
    }

    /// Start the detector as if it had been running for `elapsed` already.
    pub fn started_ago(config: StallConfig, elapsed: Duration) -> Self {
        let mut detector = Self::new(config);
        detector.carried = elapsed;
        detector
    }

    pub fn record_step(&mut self, kind: StepKind, progress: bool, signature: Option<String>) {
        if progress {
            self.no_progress = 0;
        } else {
            self.no_progress += 1;
        }

        // Steps without a signature leave the repeat streak untouched.
        if let Some(sig) = &signature {
            if self.last_signature.as_ref() == Some(sig) {
                self.repeated += 1;
            } else {
                self.repeated = 1;
                self.last_signature = Some(sig.clone());
            }
        }

        self.steps.push(Step {
            kind,
            progress,
            signature,
        });
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn elapsed(&self) -> Duration {
        self.carried + self.started.elapsed()
    }

    /// The first stall condition that holds, if any.
    pub fn stall_reason(&self) -> Option<StallReason> {
        if self.no_progress >= self.config.max_no_progress {
            return Some(StallReason::NoProgress {
                steps: self.no_progress,
            });
        }
        if self.repeated >= self.config.max_repeated {
            return Some(StallReason::RepeatedOutput {
                repeats: self.repeated,
            });
        }
        if self.elapsed() > Duration::from_secs(self.config.max_elapsed_secs) {
            return Some(StallReason::Elapsed {
                secs: self.config.max_elapsed_secs,
            });
        }
        None
    }

    pub fn is_stalled(&self) -> bool {
        self.stall_reason().is_some()
    }

    /// Stall reason, or the hard step cap once reached.
    pub fn halt_reason(&self) -> Option<StallReason> {
        self.stall_reason().or_else(|| {
            (self.steps.len() as u64 >= self.config.max_steps as u64).then_some(
                StallReason::StepLimit {
                    steps: self.config.max_steps,
                },
            )
        })
    }

    pub fn should_halt(&self) -> bool {
        self.halt_reason().is_some()
    }
}

/// Opens after `threshold` consecutive lane failures; any success closes it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    enabled: bool,
    threshold: u32,
    consecutive: u32,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive += 1;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn is_open(&self) -> bool {
        self.enabled && self.consecutive >= self.threshold
    }
}
