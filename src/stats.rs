use std::time::{Duration, Instant};

use crate::engine::{PingResult, ResultCode};
use crate::utils::format_time;

#[derive(Debug, Clone)]
pub struct PingStatistics {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub min_time: f64,
    pub max_time: f64,
    pub total_time: f64,
    pub start_time: Instant,
}

impl PingStatistics {
    pub fn new() -> Self {
        Self {
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            min_time: f64::INFINITY,
            max_time: 0.0,
            total_time: 0.0,
            start_time: Instant::now(),
        }
    }

    /// Counts one settled request. Only `Ok` results count as received.
    pub fn record(&mut self, result: &PingResult) {
        self.packets_sent += 1;

        if result.code() == ResultCode::Ok {
            self.record_received(result.round_trip());
        } else {
            self.packets_lost += 1;
        }
    }

    fn record_received(&mut self, round_trip: Duration) {
        let time_ms = round_trip.as_secs_f64() * 1000.0;
        self.packets_received += 1;
        self.total_time += time_ms;

        if time_ms < self.min_time {
            self.min_time = time_ms;
        }

        if time_ms > self.max_time {
            self.max_time = time_ms;
        }
    }

    pub fn loss_percentage(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        (self.packets_lost as f64 / self.packets_sent as f64) * 100.0
    }

    pub fn average_time(&self) -> f64 {
        if self.packets_received == 0 {
            return 0.0;
        }
        self.total_time / self.packets_received as f64
    }

    pub fn format_summary(&self, target: &str) -> String {
        let mut summary = format!(
            "\nPing statistics for {}:\n    Packets: Sent = {}, Received = {}, Lost = {} ({:.0}% loss),\n",
            target,
            self.packets_sent,
            self.packets_received,
            self.packets_lost,
            self.loss_percentage()
        );

        if self.packets_received > 0 {
            let min_time = if self.min_time == f64::INFINITY { 0.0 } else { self.min_time };
            summary.push_str(&format!(
                "Approximate round trip times in milli-seconds:\n    Minimum = {:.0}ms, Maximum = {:.0}ms, Average = {:.0}ms\n",
                min_time,
                self.max_time,
                self.average_time()
            ));
        }

        summary
    }

    pub fn format_response(&self, result: &PingResult, payload_size: usize, resolved_name: Option<&str>) -> String {
        let source_display = match (result.responder(), resolved_name) {
            (Some(source), Some(name)) => format!("{} [{}]", name, source),
            (Some(source), None) => source.to_string(),
            (None, _) => String::new(),
        };

        match result.code() {
            ResultCode::Ok => format!(
                "Reply from {}: bytes={} time={} seq={}",
                source_display,
                payload_size,
                format_time(result.round_trip()),
                result.sequence_id()
            ),
            ResultCode::TimeExceeded => format!("Reply from {}: TTL expired in transit.", source_display),
            ResultCode::NoReply => "Request timed out.".to_string(),
            ResultCode::Error => "General failure.".to_string(),
        }
    }

    pub fn format_header(&self, target: &str, resolved_ip: &str, payload_size: usize) -> String {
        if target == resolved_ip {
            format!("Pinging {} with {} bytes of data:", target, payload_size)
        } else {
            format!("Pinging {} [{}] with {} bytes of data:", target, resolved_ip, payload_size)
        }
    }
}

impl Default for PingStatistics {
    fn default() -> Self {
        Self::new()
    }
}
