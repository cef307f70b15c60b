//! Dispatch counters, compiled in with the `metrics` feature.
//!
//! Without the feature every function is an empty no-op.

#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::info;

    static ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static CLOSED: AtomicU64 = AtomicU64::new(0);
    static REQUESTS: AtomicU64 = AtomicU64::new(0);
    static PROTOCOL_ERRORS: AtomicU64 = AtomicU64::new(0);
    // Readiness events returned by epoll_wait, across all workers.
    static WAKEUPS: AtomicU64 = AtomicU64::new(0);
    // Shared registration: events skipped because another worker held the slot.
    static LOCK_CONTENDED: AtomicU64 = AtomicU64::new(0);
    static STALE_EVENTS: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone, Copy, Debug, Default)]
    pub struct MetricsSnapshot {
        pub accepted: u64,
        pub closed: u64,
        pub requests: u64,
        pub protocol_errors: u64,
        pub wakeups: u64,
        pub lock_contended: u64,
        pub stale_events: u64,
    }

    pub fn inc_accepted() {
        ACCEPTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_closed() {
        CLOSED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests() {
        REQUESTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_protocol_errors() {
        PROTOCOL_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wakeups() {
        WAKEUPS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lock_contended() {
        LOCK_CONTENDED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale_events() {
        STALE_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: ACCEPTED.load(Ordering::Relaxed),
            closed: CLOSED.load(Ordering::Relaxed),
            requests: REQUESTS.load(Ordering::Relaxed),
            protocol_errors: PROTOCOL_ERRORS.load(Ordering::Relaxed),
            wakeups: WAKEUPS.load(Ordering::Relaxed),
            lock_contended: LOCK_CONTENDED.load(Ordering::Relaxed),
            stale_events: STALE_EVENTS.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(|| {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                    let snap = snapshot();
                    let wakeups = snap.wakeups.saturating_sub(last.wakeups);
                    let contended = snap.lock_contended.saturating_sub(last.lock_contended);
                    let wasted_pct = if wakeups > 0 {
                        100.0 * contended as f64 / wakeups as f64
                    } else {
                        0.0
                    };
                    info!(
                        interval_secs = INTERVAL_SECS,
                        accepted = snap.accepted.saturating_sub(last.accepted),
                        closed = snap.closed.saturating_sub(last.closed),
                        requests = snap.requests.saturating_sub(last.requests),
                        protocol_errors = snap.protocol_errors.saturating_sub(last.protocol_errors),
                        wakeups,
                        contended,
                        stale = snap.stale_events.saturating_sub(last.stale_events),
                        wasted_pct = format_args!("{wasted_pct:.1}"),
                        "metrics delta"
                    );
                    last = snap;
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "metrics reporter not started");
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy, Debug, Default)]
    pub struct MetricsSnapshot {
        pub accepted: u64,
        pub closed: u64,
        pub requests: u64,
        pub protocol_errors: u64,
        pub wakeups: u64,
        pub lock_contended: u64,
        pub stale_events: u64,
    }

    pub fn inc_accepted() {}
    pub fn inc_closed() {}
    pub fn inc_requests() {}
    pub fn inc_protocol_errors() {}
    pub fn inc_wakeups() {}
    pub fn inc_lock_contended() {}
    pub fn inc_stale_events() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
