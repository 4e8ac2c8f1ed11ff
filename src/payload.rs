//! JSON feed payload for the polling front end.

use serde::Serialize;

use crate::constants::PAYLOAD_CAPACITY;
use crate::poll_loop::{PollState, Published};
use crate::record_store::SubscriberId;

/// One subscriber row in the payload.
#[derive(Debug, Serialize)]
struct PayloadEntry<'a> {
    /// Subscriber identifier.
    id: &'a SubscriberId,
    /// Poll state.
    state: PollState,
    /// Policy (package) name.
    policy: Option<&'a str>,
    /// [downlink, uplink] ceilings, gauge maxima.
    ceiling: [u64; 2],
    rx_mbps: f64,
    tx_mbps: f64,
    rx_pct: u8,
    tx_pct: u8,
    /// Sample time in Unix milliseconds, null before the first tick.
    sampled_at: Option<u64>,
}

impl<'a> PayloadEntry<'a> {
    fn new(id: &'a SubscriberId, published: &'a Published) -> Self {
        let ceiling = published.entitlement.as_ref().map_or([0, 0], |e| {
            [e.downlink_ceiling_mbps, e.uplink_ceiling_mbps]
        });
        let policy = published
            .entitlement
            .as_ref()
            .and_then(|e| e.policy_name.as_deref());
        let sample = published.sample.as_ref();

        PayloadEntry {
            id,
            state: published.state,
            policy,
            ceiling,
            rx_mbps: sample.map_or(0.0, |s| round2(s.rx_mbps)),
            tx_mbps: sample.map_or(0.0, |s| round2(s.tx_mbps)),
            rx_pct: sample.map_or(0, |s| s.rx_percent_of_ceiling),
            tx_pct: sample.map_or(0, |s| s.tx_percent_of_ceiling),
            sampled_at: sample.map(|s| s.sampled_at),
        }
    }
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    #[serde(rename = "s")]
    subscribers: Vec<PayloadEntry<'a>>,
}

/// Two decimal places, as the gauges display them.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Serialize the JSON payload for `rows` straight into `out`, reusing its
/// allocation across calls.
pub fn build_payload(
    out: &mut Vec<u8>,
    rows: &[(SubscriberId, Published)],
) -> Result<(), serde_json::Error> {
    out.clear();
    out.reserve(PAYLOAD_CAPACITY);

    let payload = Payload {
        subscribers: rows
            .iter()
            .map(|(id, published)| PayloadEntry::new(id, published))
            .collect(),
    };
    serde_json::to_writer(&mut *out, &payload)
}
