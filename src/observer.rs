//! Optional hook counting how often each entry gate takes the slow path,
//! and receiving backpatch descriptors for capture and later replay via
//! [crate::Stride::prefetch_backpatch].

use crate::backpatch::Backpatch;

/// All methods default to no-ops; implement the ones of interest. Methods
/// take `&self` because gates fire on the followed thread while the
/// observer is installed from another.
pub trait Observer: Send + Sync {
    fn increment_total(&self) {}

    fn increment_call_imm(&self) {}
    fn increment_call_reg(&self) {}
    fn increment_call_mem(&self) {}
    fn increment_post_call_invoke(&self) {}
    fn increment_excluded_call_imm(&self) {}
    fn increment_ret_slow_path(&self) {}

    fn increment_jmp_imm(&self) {}
    fn increment_jmp_mem(&self) {}
    fn increment_jmp_reg(&self) {}

    fn increment_jmp_cond_imm(&self) {}
    fn increment_jmp_cond_mem(&self) {}
    fn increment_jmp_cond_reg(&self) {}
    fn increment_jmp_cond_jcxz(&self) {}

    fn increment_jmp_continuation(&self) {}

    /// A backpatch was just applied; `descriptor` can be stored and replayed
    /// into a fresh engine to pre-warm its cache.
    fn notify_backpatch(&self, _descriptor: &Backpatch) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct CountingObserver {
        pub total: AtomicU32,
        pub call_imm: AtomicU32,
        pub call_mem: AtomicU32,
        pub ret_slow_path: AtomicU32,
        pub backpatches: Mutex<Vec<Backpatch>>,
    }

    impl Observer for CountingObserver {
        fn increment_total(&self) {
            self.total.fetch_add(1, Ordering::SeqCst);
        }
        fn increment_call_imm(&self) {
            self.call_imm.fetch_add(1, Ordering::SeqCst);
        }
        fn increment_call_mem(&self) {
            self.call_mem.fetch_add(1, Ordering::SeqCst);
        }
        fn increment_ret_slow_path(&self) {
            self.ret_slow_path.fetch_add(1, Ordering::SeqCst);
        }
        fn notify_backpatch(&self, descriptor: &Backpatch) {
            self.backpatches.lock().unwrap().push(*descriptor);
        }
    }
}
