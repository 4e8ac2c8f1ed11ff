//! Throughput and percent-of-ceiling computation.

use serde::Serialize;

use crate::constants::{BITS_PER_BYTE, BITS_PER_MEGABIT};
use crate::entitlement::Entitlement;
use crate::record_store::{CounterSample, SubscriberId};

/// Published utilization for one subscriber at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtilizationSample {
    /// Subscriber the sample belongs to.
    pub subscriber_id: SubscriberId,
    /// Receive rate in Mbps.
    pub rx_mbps: f64,
    /// Transmit rate in Mbps.
    pub tx_mbps: f64,
    /// Receive rate as a percentage of the downlink ceiling (0-100).
    pub rx_percent_of_ceiling: u8,
    /// Transmit rate as a percentage of the uplink ceiling (0-100).
    pub tx_percent_of_ceiling: u8,
    /// Sample time in Unix milliseconds.
    pub sampled_at: u64,
}

impl UtilizationSample {
    /// Zero-traffic sample.
    pub fn idle(subscriber_id: SubscriberId, sampled_at: u64) -> Self {
        UtilizationSample {
            subscriber_id,
            rx_mbps: 0.0,
            tx_mbps: 0.0,
            rx_percent_of_ceiling: 0,
            tx_percent_of_ceiling: 0,
            sampled_at,
        }
    }
}

/// Compute utilization from two consecutive counter samples.
///
/// Without a previous sample the result is zero traffic. A counter that went
/// backwards (session reconnect) contributes zero for that direction.
pub fn update(
    previous: Option<&CounterSample>,
    current: &CounterSample,
    elapsed_secs: f64,
    entitlement: &Entitlement,
) -> UtilizationSample {
    let subscriber_id = entitlement.subscriber_id.clone();
    let prev = match previous {
        Some(p) => p,
        None => return UtilizationSample::idle(subscriber_id, current.sampled_at),
    };

    let elapsed = elapsed_secs.max(1e-8);
    let rx_mbps = bytes_to_mbps(
        current.rx_bytes_total.saturating_sub(prev.rx_bytes_total),
        elapsed,
    );
    let tx_mbps = bytes_to_mbps(
        current.tx_bytes_total.saturating_sub(prev.tx_bytes_total),
        elapsed,
    );

    UtilizationSample {
        subscriber_id,
        rx_mbps,
        tx_mbps,
        rx_percent_of_ceiling: percent_of_ceiling(rx_mbps, entitlement.downlink_ceiling_mbps),
        tx_percent_of_ceiling: percent_of_ceiling(tx_mbps, entitlement.uplink_ceiling_mbps),
        sampled_at: current.sampled_at,
    }
}

/// Convert a byte delta over `elapsed` seconds to megabits per second.
fn bytes_to_mbps(delta: u64, elapsed: f64) -> f64 {
    delta as f64 * BITS_PER_BYTE / BITS_PER_MEGABIT / elapsed
}

/// Convert a rate to a 0-100 percentage of `ceiling`; a zero ceiling yields 0.
fn percent_of_ceiling(rate: f64, ceiling: u64) -> u8 {
    if ceiling == 0 || !(rate > 0.0) {
        return 0;
    }
    let percent = (rate / ceiling as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Keeps the previous counter sample of one subscriber.
pub struct UtilizationTracker {
    previous: Option<CounterSample>,
    fallback_elapsed_secs: f64,
}

impl UtilizationTracker {
    /// `fallback_elapsed_secs` is used when two samples carry the same
    /// timestamp (normally the poll interval).
    pub fn new(fallback_elapsed_secs: f64) -> Self {
        UtilizationTracker {
            previous: None,
            fallback_elapsed_secs,
        }
    }

    /// Feed a new counter sample and return the resulting utilization.
    pub fn observe(
        &mut self,
        current: CounterSample,
        entitlement: &Entitlement,
    ) -> UtilizationSample {
        let elapsed = match &self.previous {
            Some(prev) if current.sampled_at > prev.sampled_at => {
                (current.sampled_at - prev.sampled_at) as f64 / 1000.0
            }
            _ => self.fallback_elapsed_secs,
        };
        let sample = update(self.previous.as_ref(), &current, elapsed, entitlement);
        self.previous = Some(current);
        sample
    }

    /// Forget the baseline; the next observation reports zero traffic.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn previous(&self) -> Option<&CounterSample> {
        self.previous.as_ref()
    }
}
