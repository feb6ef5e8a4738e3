//! Observability for the scheduler tasks and the network.
//!
//! Every periodic task registers a named timer slot and stores its last
//! elapsed duration there each iteration; the report sorts by how far each
//! task overruns its period. Traffic counters track total bytes both ways
//! plus a decayed moving average.

use std::io::{self, Write};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One registered periodic task.
pub struct TimerSlot {
    name: String,
    period: Duration,
    /// Last elapsed time in microseconds, 0 before the first report.
    elapsed_micros: AtomicU64,
}

impl TimerSlot {

    /// Store the elapsed time of the latest iteration.
    pub fn set_elapsed(&self, elapsed: Duration) {
        self.elapsed_micros.store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// How far the last iteration overran the period, as a fraction of the
    /// period. Zero before any sample.
    fn overrun(&self) -> f64 {
        let elapsed = self.elapsed_micros.load(Ordering::Relaxed);
        if elapsed == 0 {
            return 0.0;
        }
        (elapsed as f64 - self.period.as_micros() as f64) / self.period.as_micros() as f64
    }

}

/// The registry of all timer slots.
#[derive(Default)]
pub struct TimerStats {
    slots: Mutex<Vec<Arc<TimerSlot>>>,
}

impl TimerStats {

    pub fn new() -> Self {
        Self::default()
    }

    /// Register a periodic task and get the slot it reports into.
    pub fn register(&self, name: impl Into<String>, period: Duration) -> Arc<TimerSlot> {
        let slot = Arc::new(TimerSlot {
            name: name.into(),
            period,
            elapsed_micros: AtomicU64::new(0),
        });
        self.slots.lock().expect("poisoned").push(Arc::clone(&slot));
        slot
    }

    /// Emit one line per task, worst overrun last.
    pub fn report(&self, write: &mut impl Write) -> io::Result<()> {
        let mut slots = self.slots.lock().expect("poisoned").clone();
        slots.sort_by(|a, b| a.overrun().total_cmp(&b.overrun()));
        for slot in slots {
            let elapsed = slot.elapsed_micros.load(Ordering::Relaxed) as f64 / 1e6;
            writeln!(
                write,
                "{:8.4}s ({:6.2} per cent) {}",
                elapsed,
                slot.overrun() * 100.0,
                slot.name,
            )?;
        }
        Ok(())
    }

}

/// Byte counters for the whole server, updated from every session.
#[derive(Default)]
pub struct TrafficStats {
    total_sent: AtomicI64,
    total_received: AtomicI64,
    /// Decayed averages in bytes per second, stored as bits of f32.
    avg_sent: AtomicU64,
    avg_received: AtomicU64,
    /// Totals at the previous average update.
    prev_sent: AtomicI64,
    prev_received: AtomicI64,
}

impl TrafficStats {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent(&self, amount: usize) {
        self.total_sent.fetch_add(amount as i64, Ordering::Relaxed);
    }

    pub fn add_received(&self, amount: usize) {
        self.total_received.fetch_add(amount as i64, Ordering::Relaxed);
    }

    /// Fold the bytes since the previous call into the moving averages.
    /// Called from a periodic task with the elapsed interval.
    pub fn update_average(&self, interval: Duration) {
        const DECAY: f64 = 0.1;
        let secs = interval.as_secs_f64().max(1e-3);

        let sent = self.total_sent.load(Ordering::Relaxed);
        let diff = sent - self.prev_sent.swap(sent, Ordering::Relaxed);
        let avg = f64::from(f32::from_bits(self.avg_sent.load(Ordering::Relaxed) as u32));
        let new = avg * DECAY + diff as f64 / secs * (1.0 - DECAY);
        self.avg_sent.store((new as f32).to_bits() as u64, Ordering::Relaxed);

        let received = self.total_received.load(Ordering::Relaxed);
        let diff = received - self.prev_received.swap(received, Ordering::Relaxed);
        let avg = f64::from(f32::from_bits(self.avg_received.load(Ordering::Relaxed) as u32));
        let new = avg * DECAY + diff as f64 / secs * (1.0 - DECAY);
        self.avg_received.store((new as f32).to_bits() as u64, Ordering::Relaxed);
    }

    /// Human readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Received: {:.2} MB (avg {}/s), Sent: {:.2} MB (avg {}/s)",
            self.total_received.load(Ordering::Relaxed) as f64 / 1e6,
            f32::from_bits(self.avg_received.load(Ordering::Relaxed) as u32) as i64,
            self.total_sent.load(Ordering::Relaxed) as f64 / 1e6,
            f32::from_bits(self.avg_sent.load(Ordering::Relaxed) as u32) as i64,
        )
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn report_sorts_by_overrun() {
        let stats = TimerStats::new();
        let fast = stats.register("fast", Duration::from_millis(100));
        let slow = stats.register("slow", Duration::from_millis(100));
        fast.set_elapsed(Duration::from_millis(10));
        slow.set_elapsed(Duration::from_millis(250));

        let mut out = Vec::new();
        stats.report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let fast_at = text.find("fast").unwrap();
        let slow_at = text.find("slow").unwrap();
        assert!(fast_at < slow_at, "{text}");
    }

    #[test]
    fn traffic_totals_and_average() {
        let traffic = TrafficStats::new();
        traffic.add_sent(1000);
        traffic.add_received(500);
        traffic.update_average(Duration::from_secs(1));
        let summary = traffic.summary();
        assert!(summary.contains("Received: 0.00 MB"), "{summary}");
        // 90% of 1000 B/s folded in on the first update.
        assert!(summary.contains("avg 900/s"), "{summary}");
    }

}
