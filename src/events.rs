//! Trace events delivered to a caller-supplied sink. The sink's mask is
//! queried once when a thread starts being followed; only the selected
//! kinds get emission sites compiled into translated code.

use bitflags::bitflags;

use crate::cpu::CpuContext;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const CALL    = 1 << 0;
        const RET     = 1 << 1;
        const EXEC    = 1 << 2;
        const BLOCK   = 1 << 3;
        const COMPILE = 1 << 4;
    }
}

/// One trace record. Addresses are guest addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Call { location: usize, target: usize, depth: u32 },
    Ret { location: usize, target: usize, depth: u32 },
    Exec { location: usize },
    Block { start: usize, end: usize },
    Compile { start: usize, end: usize },
}

/// Consumer of trace events. Methods take `&self` in the manner of
/// [log::Log]: `process` is called from the followed thread's hot path
/// while `flush` may arrive from any thread, so implementations own their
/// interior mutability.
pub trait EventSink: Send + Sync {
    fn query_mask(&self) -> EventMask;

    /// The thread is about to start executing out of the cache.
    fn start(&self) {}

    /// `cpu_context` is present for events emitted from a full prolog.
    fn process(&self, event: &Event, cpu_context: Option<&mut CpuContext>);

    /// The thread has stopped being followed.
    fn stop(&self) {}

    fn flush(&self) {}
}

/// Sink used when the caller passes none: subscribes to nothing.
pub(crate) struct NoneSink;

impl EventSink for NoneSink {
    fn query_mask(&self) -> EventMask {
        EventMask::empty()
    }

    fn process(&self, _event: &Event, _cpu_context: Option<&mut CpuContext>) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records everything it is handed, for assertions.
    pub struct CollectorSink {
        mask: EventMask,
        pub events: Mutex<Vec<Event>>,
        pub started: std::sync::atomic::AtomicBool,
        pub flushed: std::sync::atomic::AtomicBool,
    }

    impl CollectorSink {
        pub fn with_mask(mask: EventMask) -> Self {
            CollectorSink {
                mask,
                events: Mutex::new(Vec::new()),
                started: std::sync::atomic::AtomicBool::new(false),
                flushed: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl EventSink for CollectorSink {
        fn query_mask(&self) -> EventMask {
            self.mask
        }

        fn start(&self) {
            self.started.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        fn process(&self, event: &Event, _cpu_context: Option<&mut CpuContext>) {
            self.events.lock().unwrap().push(*event);
        }

        fn flush(&self) {
            self.flushed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_controls_membership() {
        let mask = EventMask::CALL | EventMask::COMPILE;
        assert!(mask.contains(EventMask::CALL));
        assert!(!mask.contains(EventMask::EXEC));
        assert_eq!(NoneSink.query_mask(), EventMask::empty());
    }
}
