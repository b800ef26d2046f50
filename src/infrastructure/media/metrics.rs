//! Session engine metrics
//!
//! Counters go through the `metrics` facade; the host decides which
//! recorder (if any) is installed.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Register descriptions for every metric the engine emits
pub fn describe_metrics() {
    describe_counter!("rtp_packets_sent_total", "Total number of RTP data packets sent");
    describe_counter!(
        "rtp_packets_received_total",
        "Total number of RTP data packets accepted from the network"
    );
    describe_counter!("rtp_packets_lost_total", "Total number of RTP packets detected as lost");
    describe_counter!(
        "rtp_packets_discarded_total",
        "Total number of RTP packets dropped, by reason"
    );
    describe_counter!("rtcp_reports_sent_total", "Total number of RTCP compound packets sent");
    describe_counter!(
        "rtp_write_failures_total",
        "Total number of swallowed transient write failures"
    );
    describe_gauge!("rtp_jitter", "Latest receive jitter estimate in timestamp units");
    describe_histogram!(
        "rtp_send_interval_seconds",
        "Average time between sent packets per statistics window"
    );
}

pub fn record_packet_sent(octets: usize) {
    counter!("rtp_packets_sent_total").increment(1);
    counter!("rtp_octets_sent_total").increment(octets as u64);
}

pub fn record_packet_received(octets: usize) {
    counter!("rtp_packets_received_total").increment(1);
    counter!("rtp_octets_received_total").increment(octets as u64);
}

pub fn record_packets_lost(count: u64) {
    counter!("rtp_packets_lost_total").increment(count);
}

pub fn record_discard(reason: &'static str) {
    counter!("rtp_packets_discarded_total", "reason" => reason).increment(1);
}

pub fn record_report_sent() {
    counter!("rtcp_reports_sent_total").increment(1);
}

pub fn record_write_failure() {
    counter!("rtp_write_failures_total").increment(1);
}

pub fn update_jitter(jitter: u32) {
    gauge!("rtp_jitter").set(jitter as f64);
}

pub fn record_send_interval(average: Duration) {
    histogram!("rtp_send_interval_seconds").record(average.as_secs_f64());
}
