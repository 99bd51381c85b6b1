use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Highest percentage the simulator will ever report. The last stretch to
/// 100 is reserved for a confirmed completion from the scan service.
pub const PROGRESS_CEILING: u8 = 90;

/// Ordered narrative shown alongside the simulated percentage
pub const STATUS_MESSAGES: [&str; 10] = [
    "Crawling target pages...",
    "Analyzing forms and input fields...",
    "Testing for cross-site scripting (XSS)...",
    "Testing for SQL injection...",
    "Checking access control...",
    "Checking cryptographic configuration...",
    "Inspecting security headers and misconfigurations...",
    "Checking for vulnerable components...",
    "Testing for server-side request forgery (SSRF)...",
    "Finalizing results...",
];

/// Fabricates a believable progress percentage for a scan whose server
/// reports no incremental progress.
pub struct ProgressSimulator {
    rng: StdRng,
    min_step: u8,
    max_step: u8,
    tick: Duration,
}

impl ProgressSimulator {
    pub fn new(min_step: u8, max_step: u8, tick: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let min_step = min_step.max(1);
        Self {
            rng,
            min_step,
            max_step: max_step.max(min_step),
            tick,
        }
    }

    /// Progress after one more tick. Never decreases and never passes the ceiling.
    pub fn advance(&mut self, current: u8) -> u8 {
        if current >= PROGRESS_CEILING {
            return current;
        }
        let step = self.rng.random_range(self.min_step..=self.max_step);
        current.saturating_add(step).min(PROGRESS_CEILING)
    }

    /// Narrative for `percent`: entry `floor(percent / 100 * N)` of the list
    pub fn status_message(percent: u8) -> &'static str {
        let n = STATUS_MESSAGES.len();
        let index = (percent.min(100) as usize * n) / 100;
        STATUS_MESSAGES[index.min(n - 1)]
    }

    /// Time the simulator would typically need to reach `percent`.
    ///
    /// Inverts the advance rate (mean step per tick) so a recovered scan can
    /// be given a start time consistent with the progress it already shows.
    pub fn estimated_elapsed(&self, percent: u8) -> Duration {
        let mean_step = (self.min_step as f64 + self.max_step as f64) / 2.0;
        let ticks = percent.min(PROGRESS_CEILING) as f64 / mean_step;
        self.tick.mul_f64(ticks)
    }
}
