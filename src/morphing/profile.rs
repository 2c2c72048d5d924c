//! Traffic profiles: weighted packet-size and delay distributions.
//!
//! A profile describes the statistical shape of some legitimate traffic
//! class. The morphing writer samples it to decide how large each emitted
//! frame should be and how long to wait between frames. Peers can steer a
//! single upcoming frame through one-shot overrides carried by control
//! frames.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

/// One-shot override slots, serialized by the profile's own lock.
#[derive(Debug, Default)]
struct Overrides {
    /// 0 = unset
    next_packet_size: usize,
    /// zero = unset
    next_delay: Duration,
}

/// A named distribution over packet sizes and inter-frame delays.
///
/// Lookups hand out copies, so override state never leaks between
/// sessions sharing a template name.
#[derive(Debug)]
pub struct TrafficProfile {
    name: String,
    /// (size, weight) pairs, ascending by size
    packet_sizes: Vec<(usize, f64)>,
    /// (delay, weight) pairs, ascending by delay
    delays: Vec<(Duration, f64)>,
    overrides: Mutex<Overrides>,
}

impl Clone for TrafficProfile {
    fn clone(&self) -> Self {
        // Overrides are per-session state and do not travel with the copy
        Self {
            name: self.name.clone(),
            packet_sizes: self.packet_sizes.clone(),
            delays: self.delays.clone(),
            overrides: Mutex::new(Overrides::default()),
        }
    }
}

impl TrafficProfile {
    /// Create a profile from explicit distributions.
    pub fn new(
        name: impl Into<String>,
        packet_sizes: Vec<(usize, f64)>,
        delays: Vec<(Duration, f64)>,
    ) -> Self {
        Self {
            name: name.into(),
            packet_sizes,
            delays,
            overrides: Mutex::new(Overrides::default()),
        }
    }

    /// Profile name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pick the next target packet size: the pending one-shot override if
    /// set (clearing it), otherwise a sample from the distribution.
    pub fn get_packet_size(&self) -> usize {
        {
            let mut ov = self.overrides.lock();
            if ov.next_packet_size > 0 {
                let size = ov.next_packet_size;
                ov.next_packet_size = 0;
                return size;
            }
        }

        let r = rand::thread_rng().gen::<f64>();
        sample_weighted(&self.packet_sizes, r)
    }

    /// Pick the next inter-frame delay, mirroring [`get_packet_size`].
    ///
    /// [`get_packet_size`]: Self::get_packet_size
    pub fn get_delay(&self) -> Duration {
        {
            let mut ov = self.overrides.lock();
            if !ov.next_delay.is_zero() {
                let delay = ov.next_delay;
                ov.next_delay = Duration::ZERO;
                return delay;
            }
        }

        let r = rand::thread_rng().gen::<f64>();
        sample_weighted(&self.delays, r)
    }

    /// Install a one-shot packet-size override.
    pub fn set_next_packet_size(&self, size: usize) {
        self.overrides.lock().next_packet_size = size;
    }

    /// Install a one-shot delay override.
    pub fn set_next_delay(&self, delay: Duration) {
        self.overrides.lock().next_delay = delay;
    }

    /// Build a profile from captured traffic observations.
    ///
    /// Observed values are frequency-counted and normalized into weights,
    /// sorted ascending.
    pub fn from_capture(packet_sizes: &[usize], delays: &[Duration]) -> Self {
        Self::new(
            "Custom",
            frequency_distribution(packet_sizes),
            frequency_distribution(delays),
        )
    }
}

/// Cumulative-weight roulette selection. Falls through to the last entry
/// when weights do not cover `r` (e.g. all zero).
fn sample_weighted<T: Copy>(dist: &[(T, f64)], r: f64) -> T {
    let mut cumsum = 0.0;
    for &(value, weight) in dist {
        cumsum += weight;
        if r <= cumsum {
            return value;
        }
    }
    dist.last().expect("distribution must not be empty").0
}

/// Frequency-count values into a normalized, ascending distribution.
fn frequency_distribution<T: Copy + Ord>(values: &[T]) -> Vec<(T, f64)> {
    let mut freq: BTreeMap<T, usize> = BTreeMap::new();
    for &v in values {
        *freq.entry(v).or_insert(0) += 1;
    }

    let total = values.len() as f64;
    freq.into_iter()
        .map(|(v, count)| (v, count as f64 / total))
        .collect()
}

/// Video streaming: large consistent packets, frame-rate pacing.
fn youtube() -> TrafficProfile {
    TrafficProfile::new(
        "YouTube",
        vec![
            (1400, 0.35),
            (1200, 0.25),
            (1000, 0.20),
            (800, 0.10),
            (600, 0.05),
            (400, 0.05),
        ],
        vec![
            (Duration::from_millis(8), 0.30),
            (Duration::from_millis(12), 0.25),
            (Duration::from_millis(16), 0.20),
            (Duration::from_millis(20), 0.15),
            (Duration::from_millis(30), 0.10),
        ],
    )
}

/// Video conferencing: mid-size packets at a steady cadence.
fn zoom() -> TrafficProfile {
    TrafficProfile::new(
        "Zoom",
        vec![(500, 0.30), (600, 0.40), (700, 0.30)],
        vec![
            (Duration::from_millis(30), 0.40),
            (Duration::from_millis(40), 0.40),
            (Duration::from_millis(50), 0.20),
        ],
    )
}

/// HTTP/2 API traffic: bursty request/response pairs.
fn http2_api() -> TrafficProfile {
    TrafficProfile::new(
        "HTTP/2 API",
        vec![(200, 0.20), (500, 0.30), (1000, 0.30), (1500, 0.20)],
        vec![
            (Duration::from_millis(5), 0.30),
            (Duration::from_millis(10), 0.40),
            (Duration::from_millis(15), 0.30),
        ],
    )
}

/// Look up a built-in profile template by name, returning a fresh copy.
///
/// Recognized names: `youtube`, `zoom`, `http2-api` (alias
/// `mimic-http2-api`).
pub fn by_name(name: &str) -> Option<TrafficProfile> {
    match name {
        "youtube" => Some(youtube()),
        "zoom" => Some(zoom()),
        "http2-api" | "mimic-http2-api" => Some(http2_api()),
        _ => None,
    }
}
