//! In-process publish/subscribe. The bus holds weak references: sinks
//! are owned by whoever registered them and may be dropped freely.

use std::sync::{Mutex, Weak};
use tracing::{debug, warn};

use super::MetricsEvent;

/// Consecutive failures after which a sink is quarantined.
const MAX_SINK_FAILURES: u32 = 5;

/// A sink receives every published event. Writes must be fast local
/// operations; a failing sink is logged and eventually dropped, never
/// propagated to the publisher.
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    fn write(&self, event: &MetricsEvent) -> anyhow::Result<()>;
}

struct SinkEntry {
    sink: Weak<dyn EventSink>,
    consecutive_failures: u32,
}

#[derive(Default)]
pub struct EventBus {
    sinks: Mutex<Vec<SinkEntry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: &std::sync::Arc<dyn EventSink>) {
        let mut sinks = self.sinks.lock().expect("bus mutex poisoned");
        sinks.push(SinkEntry {
            sink: std::sync::Arc::downgrade(sink),
            consecutive_failures: 0,
        });
    }

    /// Deliver an event to every live sink, in registration order.
    ///
    /// Synchronous by design: once publish returns, every sink has seen
    /// the event, which is what gives `(session, iteration)` events their
    /// per-sink ordering guarantee.
    pub fn publish(&self, event: &MetricsEvent) {
        let mut sinks = self.sinks.lock().expect("bus mutex poisoned");
        sinks.retain_mut(|entry| {
            let Some(sink) = entry.sink.upgrade() else {
                return false;
            };
            match sink.write(event) {
                Ok(()) => {
                    entry.consecutive_failures = 0;
                    true
                }
                Err(e) => {
                    entry.consecutive_failures += 1;
                    warn!(
                        sink = sink.name(),
                        failures = entry.consecutive_failures,
                        error = %e,
                        "Event sink write failed"
                    );
                    if entry.consecutive_failures >= MAX_SINK_FAILURES {
                        warn!(sink = sink.name(), "Dropping repeatedly failing sink");
                        false
                    } else {
                        true
                    }
                }
            }
        });
        debug!(kind = event.kind.kind_str(), session = %event.session_id, "Published event");
    }

    /// Number of currently registered (live) sinks.
    pub fn sink_count(&self) -> usize {
        let mut sinks = self.sinks.lock().expect("bus mutex poisoned");
        sinks.retain(|entry| entry.sink.strong_count() > 0);
        sinks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }
        fn write(&self, event: &MetricsEvent) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(event.kind.kind_str().to_string());
            Ok(())
        }
    }

    struct FailingSink {
        attempts: AtomicUsize,
    }

    impl EventSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }
        fn write(&self, _event: &MetricsEvent) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk full")
        }
    }

    fn user_message(text: &str) -> MetricsEvent {
        MetricsEvent::new(
            "s1",
            Some("i1"),
            EventKind::UserMessage {
                text: text.to_string(),
            },
        )
    }

    #[test]
    fn test_delivery_in_publish_order() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn EventSink> = sink.clone();
        bus.register(&as_dyn);

        bus.publish(&user_message("a"));
        bus.publish(&MetricsEvent::new(
            "s1",
            Some("i1"),
            EventKind::IterationEnd {
                outcome: crate::metrics::IterationOutcome::Success,
                duration_ms: 10,
                exit_code: 0,
            },
        ));

        let seen = sink.seen.lock().unwrap();
        assert_eq!(*seen, vec!["user_message", "iteration_end"]);
    }

    #[test]
    fn test_failed_sink_does_not_block_publisher() {
        let bus = EventBus::new();
        let failing = Arc::new(FailingSink {
            attempts: AtomicUsize::new(0),
        });
        let recording = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let f: Arc<dyn EventSink> = failing.clone();
        let r: Arc<dyn EventSink> = recording.clone();
        bus.register(&f);
        bus.register(&r);

        // Publishing never panics or errors, and healthy sinks keep
        // receiving events.
        for _ in 0..10 {
            bus.publish(&user_message("x"));
        }
        assert_eq!(recording.seen.lock().unwrap().len(), 10);

        // The failing sink was quarantined after repeated failures.
        assert_eq!(failing.attempts.load(Ordering::SeqCst), 5);
        assert_eq!(bus.sink_count(), 1);
    }

    #[test]
    fn test_dropped_sink_is_pruned() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn EventSink> = sink.clone();
        bus.register(&as_dyn);
        assert_eq!(bus.sink_count(), 1);

        drop(as_dyn);
        drop(sink);
        bus.publish(&user_message("after drop"));
        assert_eq!(bus.sink_count(), 0);
    }
}
