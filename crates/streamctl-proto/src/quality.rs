// quality.rs -- connection quality estimation with hysteresis
//
// Frame/latency interval bookkeeping in the style of myq2-common's client
// sampling, rebuilt around a rolling-window loss estimator with hysteresis.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::invalidation::InvalidationQueue;

const QUALITY_WINDOW: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Okay,
    Poor,
}

struct Window {
    good_frames: u32,
    total_frames: u32,
    window_start: Instant,
    prev_loss_percent: Option<u32>,
    last_status: ConnectionStatus,
}

/// Observes per-frame receive events from the video pipeline and emits
/// OKAY/POOR status transitions, plus the loss-count and invalidation-queue
/// bookkeeping that feeds the Control Session's telemetry and invalidation
/// workers.
pub struct ConnectionQualityMonitor {
    window: Mutex<Window>,
    last_seen_frame: AtomicU64,
    last_good_frame: AtomicU64,
    has_seen_any_frame: std::sync::atomic::AtomicBool,
    loss_count_since_last_report: AtomicU32,
    invalidation: Arc<InvalidationQueue>,
}

impl ConnectionQualityMonitor {
    pub fn new(invalidation: Arc<InvalidationQueue>) -> Self {
        Self {
            window: Mutex::new(Window {
                good_frames: 0,
                total_frames: 0,
                window_start: Instant::now(),
                prev_loss_percent: None,
                last_status: ConnectionStatus::Okay,
            }),
            last_seen_frame: AtomicU64::new(0),
            last_good_frame: AtomicU64::new(0),
            has_seen_any_frame: std::sync::atomic::AtomicBool::new(false),
            loss_count_since_last_report: AtomicU32::new(0),
            invalidation,
        }
    }

    pub fn invalidation_queue(&self) -> &InvalidationQueue {
        &self.invalidation
    }

    pub fn any_frame_seen(&self) -> bool {
        self.has_seen_any_frame.load(Ordering::SeqCst)
    }

    pub fn last_good_frame(&self) -> u64 {
        self.last_good_frame.load(Ordering::SeqCst)
    }

    pub fn last_seen_frame(&self) -> u64 {
        self.last_seen_frame.load(Ordering::SeqCst)
    }

    /// A complete frame made it through the decode pipeline.
    pub fn connection_received_complete_frame(&self, idx: u64) {
        self.window.lock().good_frames += 1;
        self.last_good_frame.store(idx, Ordering::SeqCst);
    }

    /// A frame index was observed (complete or not). May trigger a window
    /// roll every 3000 ms and return a status transition to emit.
    pub fn connection_saw_frame(&self, idx: u64) -> Option<ConnectionStatus> {
        self.has_seen_any_frame.store(true, Ordering::SeqCst);
        let last_seen = self.last_seen_frame.load(Ordering::SeqCst);
        debug_assert!(seq_ge_mod16(idx, last_seen), "frame index regressed");

        let delta = idx.wrapping_sub(last_seen);
        self.last_seen_frame.store(idx, Ordering::SeqCst);

        let mut win = self.window.lock();
        win.total_frames = win.total_frames.saturating_add(delta as u32);

        if win.window_start.elapsed() >= QUALITY_WINDOW {
            return self.roll_window(&mut win);
        }
        None
    }

    fn roll_window(&self, win: &mut Window) -> Option<ConnectionStatus> {
        let loss_percent = if win.total_frames == 0 {
            0
        } else {
            100u32.saturating_sub(win.good_frames.saturating_mul(100) / win.total_frames)
        };

        let transition = if win.last_status != ConnectionStatus::Poor
            && (loss_percent >= 30
                || (loss_percent >= 15 && win.prev_loss_percent.unwrap_or(0) >= 15))
        {
            Some(ConnectionStatus::Poor)
        } else if win.last_status != ConnectionStatus::Okay && loss_percent <= 5 {
            Some(ConnectionStatus::Okay)
        } else {
            None
        };

        if let Some(status) = transition {
            win.last_status = status;
        }
        win.prev_loss_percent = Some(loss_percent);
        win.good_frames = 0;
        win.total_frames = 0;
        win.window_start = Instant::now();

        transition
    }

    /// `next - last - 1` packets were lost between two observed sequence
    /// numbers; accumulate for the next loss-stats report.
    pub fn connection_lost_packets(&self, last: u32, next: u32) {
        let lost = next.saturating_sub(last).saturating_sub(1);
        self.loss_count_since_last_report.fetch_add(lost, Ordering::SeqCst);
    }

    /// Consume and reset the accumulated loss count (called by the
    /// telemetry worker once per loss-stats report).
    pub fn take_loss_count(&self) -> u32 {
        self.loss_count_since_last_report.swap(0, Ordering::SeqCst)
    }

    /// A frame-loss range was detected; queue it for invalidation (or
    /// escalate to an IDR request if the queue is full).
    pub fn connection_detected_frame_loss(&self, start: u64, end: u64) {
        self.invalidation.detected_frame_loss(start, end);
    }

    pub fn request_idr_on_demand(&self) {
        self.invalidation.request_idr_on_demand();
    }
}

/// Compares two frame indices under 16-bit wraparound ordering (frame
/// counters wrap within their low 16 bits well before `u64` would).
fn seq_ge_mod16(idx: u64, last: u64) -> bool {
    let diff = (idx.wrapping_sub(last) as u16) as i16;
    diff >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ConnectionQualityMonitor {
        ConnectionQualityMonitor::new(Arc::new(InvalidationQueue::new()))
    }

    fn force_window_elapsed(win: &Mutex<Window>) {
        win.lock().window_start = Instant::now() - QUALITY_WINDOW - Duration::from_millis(1);
    }

    #[test]
    fn single_30pct_loss_window_transitions_to_poor() {
        let m = monitor();
        force_window_elapsed(&m.window);
        for i in 0..70u64 {
            m.connection_received_complete_frame(i);
        }
        let status = m.connection_saw_frame(100);
        assert_eq!(status, Some(ConnectionStatus::Poor));
    }

    #[test]
    fn single_15pct_window_does_not_transition() {
        let m = monitor();
        force_window_elapsed(&m.window);
        for i in 0..85u64 {
            m.connection_received_complete_frame(i);
        }
        let status = m.connection_saw_frame(100);
        assert_eq!(status, None);
    }

    #[test]
    fn two_consecutive_15pct_windows_transition_on_second() {
        let m = monitor();
        force_window_elapsed(&m.window);
        for i in 0..85u64 {
            m.connection_received_complete_frame(i);
        }
        assert_eq!(m.connection_saw_frame(100), None);

        force_window_elapsed(&m.window);
        for i in 100..185u64 {
            m.connection_received_complete_frame(i);
        }
        let status = m.connection_saw_frame(200);
        assert_eq!(status, Some(ConnectionStatus::Poor));
    }

    #[test]
    fn recovers_to_okay_after_low_loss_window() {
        let m = monitor();
        force_window_elapsed(&m.window);
        for i in 0..70u64 {
            m.connection_received_complete_frame(i);
        }
        assert_eq!(m.connection_saw_frame(100), Some(ConnectionStatus::Poor));

        force_window_elapsed(&m.window);
        for i in 100..198u64 {
            m.connection_received_complete_frame(i);
        }
        let status = m.connection_saw_frame(200);
        assert_eq!(status, Some(ConnectionStatus::Okay));
    }

    #[test]
    fn mid_band_loss_never_changes_state() {
        let m = monitor();
        force_window_elapsed(&m.window);
        for i in 0..90u64 {
            m.connection_received_complete_frame(i);
        }
        // 10% loss: within the 6-14% dead band.
        let status = m.connection_saw_frame(100);
        assert_eq!(status, None);
    }

    #[test]
    fn lost_packets_accumulate_and_reset() {
        let m = monitor();
        m.connection_lost_packets(100, 201);
        assert_eq!(m.take_loss_count(), 100);
        assert_eq!(m.take_loss_count(), 0);
    }
}
