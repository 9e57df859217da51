//! Channel traffic snapshots and their log formatting

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cumulative counters of one channel at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub up_bytes: u64,
    pub up_packets: u64,
    pub down_bytes: u64,
    pub down_packets: u64,
}

impl TrafficSnapshot {
    pub fn packets(&self) -> u64 {
        self.up_packets + self.down_packets
    }

    /// Counter growth since `prev`
    pub fn delta_since(&self, prev: &TrafficSnapshot) -> TrafficSnapshot {
        TrafficSnapshot {
            up_bytes: self.up_bytes.saturating_sub(prev.up_bytes),
            up_packets: self.up_packets.saturating_sub(prev.up_packets),
            down_bytes: self.down_bytes.saturating_sub(prev.down_bytes),
            down_packets: self.down_packets.saturating_sub(prev.down_packets),
        }
    }

    /// Per-second rates between `prev` and `self`
    pub fn rate_since(&self, prev: &TrafficSnapshot, elapsed: Duration) -> Throughput {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let per_sec = |now: u64, then: u64| now.saturating_sub(then) as f64 / secs;
        Throughput {
            up_bytes: per_sec(self.up_bytes, prev.up_bytes),
            up_packets: per_sec(self.up_packets, prev.up_packets),
            down_bytes: per_sec(self.down_bytes, prev.down_bytes),
            down_packets: per_sec(self.down_packets, prev.down_packets),
        }
    }
}

impl fmt::Display for TrafficSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "up {} / {} pkts, down {} / {} pkts",
            format_bytes(self.up_bytes as f64),
            self.up_packets,
            format_bytes(self.down_bytes as f64),
            self.down_packets
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub up_bytes: f64,
    pub up_packets: f64,
    pub down_bytes: f64,
    pub down_packets: f64,
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "up {}/s {:.2} pkt/s, down {}/s {:.2} pkt/s",
            format_bytes(self.up_bytes),
            self.up_packets,
            format_bytes(self.down_bytes),
            self.down_packets
        )
    }
}

/// One stats tick's worth of change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsReport {
    pub delta: TrafficSnapshot,
    pub rate: Throughput,
}

/// Snapshot carried from one stats tick to the next
#[derive(Debug, Clone, Copy)]
pub struct StatsWindow {
    prev: TrafficSnapshot,
    prev_at: Instant,
}

impl StatsWindow {
    pub fn new(start: TrafficSnapshot, at: Instant) -> Self {
        Self {
            prev: start,
            prev_at: at,
        }
    }

    pub fn prev(&self) -> TrafficSnapshot {
        self.prev
    }

    /// Slide the window to `now`. Reports only when packets moved.
    pub fn advance(&mut self, now: TrafficSnapshot, at: Instant) -> Option<StatsReport> {
        let report = (now.packets() != self.prev.packets()).then(|| StatsReport {
            delta: now.delta_since(&self.prev),
            rate: now.rate_since(&self.prev, at.saturating_duration_since(self.prev_at)),
        });
        self.prev = now;
        self.prev_at = at;
        report
    }
}

/// Human-readable size with two decimals
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(0.0), "0.00B");
        assert_eq!(format_bytes(1023.0), "1023.00B");
        assert_eq!(format_bytes(1536.0), "1.50KB");
        assert_eq!(format_bytes(5.0 * 1024.0 * 1024.0), "5.00MB");
        assert_eq!(format_bytes(3.0 * 1024f64.powi(5)), "3072.00TB");
    }

    #[test]
    fn test_rate_since() {
        let prev = TrafficSnapshot {
            up_bytes: 1000,
            up_packets: 10,
            ..Default::default()
        };
        let now = TrafficSnapshot {
            up_bytes: 3000,
            up_packets: 30,
            down_bytes: 500,
            down_packets: 5,
        };
        let rate = now.rate_since(&prev, Duration::from_secs(2));
        assert_eq!(rate.up_bytes, 1000.0);
        assert_eq!(rate.up_packets, 10.0);
        assert_eq!(rate.down_bytes, 250.0);
        assert_eq!(now.packets(), 35);
    }

    #[test]
    fn test_window_carries_previous_snapshot() {
        let start = Instant::now();
        let mut window = StatsWindow::new(TrafficSnapshot::default(), start);

        let first = TrafficSnapshot {
            up_bytes: 400,
            up_packets: 4,
            ..Default::default()
        };
        let report = window.advance(first, start + Duration::from_secs(1)).unwrap();
        assert_eq!(report.delta, first);
        assert_eq!(report.rate.up_bytes, 400.0);

        // quiet tick: nothing reported, window still moves
        assert!(window.advance(first, start + Duration::from_secs(2)).is_none());
        assert_eq!(window.prev(), first);

        let second = TrafficSnapshot {
            up_bytes: 600,
            up_packets: 6,
            down_bytes: 50,
            down_packets: 1,
        };
        let report = window.advance(second, start + Duration::from_secs(4)).unwrap();
        assert_eq!(report.delta.up_bytes, 200);
        assert_eq!(report.delta.down_packets, 1);
        assert_eq!(report.rate.up_bytes, 100.0);
        assert_eq!(window.prev(), second);
    }
}
