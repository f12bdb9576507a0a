//! The engine: tunables, the context registry, and thread control.
//!
//! Following the calling thread works by patching the caller's return
//! address: a naked trampoline hands the address of that slot to the
//! engine, which compiles a block for it and redirects the return straight
//! into the translation cache. Foreign threads are entered through the
//! [ThreadControl] collaborator and an infection thunk instead.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::cpu::{CpuContext, CpuFeatures};
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::exec_ctx::{self, ExecCtx, RunState, MODE_NORMAL, MODE_SINGLE_STEPPING_ON_CALL};
use crate::observer::Observer;
use crate::os::{self, NoThreadControl, ThreadControl, ThreadId};
use crate::probes::{ProbeCallback, ProbeRegistry};
use crate::transform::{DefaultTransformer, Transformer};
use crate::utils::align_up;
use crate::virtualmem::{Pages, SystemPages};

pub use crate::probes::ProbeId;

const CODE_SLAB_SIZE_INITIAL: usize = 128 * 1024;
const CODE_SLAB_SIZE_DYNAMIC: usize = 4 * 1024 * 1024;
const DATA_SLAB_SIZE_INITIAL: usize = CODE_SLAB_SIZE_INITIAL / 4;
const DATA_SLAB_SIZE_DYNAMIC: usize = CODE_SLAB_SIZE_DYNAMIC / 4;
const SCRATCH_SLAB_SIZE: usize = 64 * 1024;

/// A guest address range, used for exclusions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: usize,
    pub size: usize,
}

impl MemoryRange {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

pub(crate) struct CtxHandle(pub *mut ExecCtx);
unsafe impl Send for CtxHandle {}

/// Engine state shared between the public handle and every context.
pub(crate) struct Inner {
    ic_entries: u32,
    page_size: usize,
    cpu_features: CpuFeatures,
    pages: Box<dyn Pages>,

    trust_threshold: AtomicI32,
    reap_grace_ms: AtomicU64,

    contexts: Mutex<Vec<CtxHandle>>,
    exclusions: RwLock<Vec<MemoryRange>>,
    pub(crate) probes: ProbeRegistry,
    thread_control: RwLock<Arc<dyn ThreadControl>>,

    /// Known address of the platform's thread-exit implementation, when one
    /// can be resolved; a call there unfollows instead of translating ever
    /// deeper into teardown code.
    thread_exit_impl: Option<usize>,

    code_slab_size_initial: usize,
    data_slab_size_initial: usize,
    code_slab_size_dynamic: usize,
    data_slab_size_dynamic: usize,
    scratch_slab_size: usize,
}

impl Inner {
    pub(crate) fn new_with_pages(pages: Box<dyn Pages>, ic_entries: u32) -> Arc<Inner> {
        let page_size = os::page_size();

        Arc::new(Inner {
            ic_entries,
            page_size,
            cpu_features: CpuFeatures::detect(),
            pages,
            trust_threshold: AtomicI32::new(1),
            reap_grace_ms: AtomicU64::new(20),
            contexts: Mutex::new(Vec::new()),
            exclusions: RwLock::new(Vec::new()),
            probes: ProbeRegistry::new(),
            thread_control: RwLock::new(Arc::new(NoThreadControl)),
            thread_exit_impl: None,
            code_slab_size_initial: align_up(CODE_SLAB_SIZE_INITIAL, page_size),
            data_slab_size_initial: align_up(DATA_SLAB_SIZE_INITIAL, page_size),
            code_slab_size_dynamic: align_up(CODE_SLAB_SIZE_DYNAMIC, page_size),
            data_slab_size_dynamic: align_up(DATA_SLAB_SIZE_DYNAMIC, page_size),
            scratch_slab_size: align_up(SCRATCH_SLAB_SIZE, page_size),
        })
    }

    pub fn pages(&self) -> &dyn Pages {
        self.pages.as_ref()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cpu_features(&self) -> CpuFeatures {
        self.cpu_features
    }

    pub fn ic_entries(&self) -> u32 {
        self.ic_entries
    }

    /// Bytes one indirect site's inline cache occupies.
    pub fn ic_entry_size(&self) -> usize {
        self.ic_entries as usize * std::mem::size_of::<crate::block::IcEntry>()
    }

    pub fn trust_threshold(&self) -> i32 {
        self.trust_threshold.load(Ordering::SeqCst)
    }

    /// Snapshots exist only when the trust threshold is nonzero.
    pub fn snapshot_space_needed_for(&self, real_size: usize) -> usize {
        if self.trust_threshold() != 0 {
            real_size
        } else {
            0
        }
    }

    pub fn is_excluding(&self, address: usize) -> bool {
        self.exclusions.read().unwrap().iter().any(|range| range.contains(address))
    }

    pub fn probes(&self) -> &ProbeRegistry {
        &self.probes
    }

    pub fn thread_exit_impl(&self) -> Option<usize> {
        self.thread_exit_impl
    }

    pub fn code_slab_size_initial(&self) -> usize {
        self.code_slab_size_initial
    }

    pub fn data_slab_size_initial(&self) -> usize {
        self.data_slab_size_initial
    }

    pub fn code_slab_size_dynamic(&self) -> usize {
        self.code_slab_size_dynamic
    }

    pub fn data_slab_size_dynamic(&self) -> usize {
        self.data_slab_size_dynamic
    }

    pub fn scratch_slab_size(&self) -> usize {
        self.scratch_slab_size
    }

    fn thread_control(&self) -> Arc<dyn ThreadControl> {
        self.thread_control.read().unwrap().clone()
    }

    pub(crate) fn create_exec_ctx(
        self: &Arc<Inner>,
        thread_id: ThreadId,
        transformer: Option<Arc<dyn Transformer>>,
        sink: Option<Arc<dyn EventSink>>,
    ) -> *mut ExecCtx {
        let transformer = transformer.unwrap_or_else(|| Arc::new(DefaultTransformer));
        let sink = sink.unwrap_or_else(|| Arc::new(crate::events::NoneSink));
        let ctx = ExecCtx::new(self, thread_id, transformer, sink);

        self.contexts.lock().unwrap().push(CtxHandle(ctx));
        ctx
    }

    pub(crate) fn destroy_exec_ctx(&self, ctx: *mut ExecCtx) {
        {
            let mut contexts = self.contexts.lock().unwrap();
            let index = contexts.iter().position(|handle| handle.0 == ctx);
            match index {
                Some(index) => contexts.swap_remove(index),
                // Lost the race against garbage collection
                None => return,
            };
        }

        unsafe {
            (*ctx).stop_sink();
            ExecCtx::free(ctx);
        }
    }

    fn find_ctx_by_thread_id(&self, thread_id: ThreadId) -> Option<*mut ExecCtx> {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .map(|handle| handle.0)
            .find(|&ctx| unsafe { (*ctx).thread_id } == thread_id)
    }
}

/// The instrumentation engine. One instance can follow any number of
/// threads, each with its own private translation cache.
pub struct Stride {
    inner: Arc<Inner>,
}

impl Default for Stride {
    fn default() -> Self {
        Stride::new()
    }
}

impl Stride {
    pub fn new() -> Stride {
        Stride { inner: Inner::new_with_pages(Box::new(SystemPages::new()), 2) }
    }

    /// `ic_entries` controls how many targets each indirect call/jmp site
    /// caches inline; accepted range is 2..=32.
    pub fn with_ic_entries(ic_entries: u32) -> Result<Stride> {
        if !(2..=32).contains(&ic_entries) {
            return Err(Error::InvalidIcEntries(ic_entries));
        }
        Ok(Stride { inner: Inner::new_with_pages(Box::new(SystemPages::new()), ic_entries) })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(pages: Box<dyn Pages>, ic_entries: u32) -> Stride {
        Stride { inner: Inner::new_with_pages(pages, ic_entries) }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Code in `range` runs natively; the engine re-attaches when it
    /// returns. Takes effect for blocks translated afterwards.
    pub fn exclude(&self, range: MemoryRange) {
        self.inner.exclusions.write().unwrap().push(range);
    }

    pub fn set_trust_threshold(&self, trust_threshold: i32) {
        self.inner.trust_threshold.store(trust_threshold, Ordering::SeqCst);
    }

    pub fn get_trust_threshold(&self) -> i32 {
        self.inner.trust_threshold.load(Ordering::SeqCst)
    }

    /// How long a destroy-pending context lingers before garbage collection
    /// may reap it from another thread. This guards the race between the
    /// departing thread executing its last translated bytes and the slabs
    /// being unmapped underneath it; there is no authoritative signal for
    /// "the thread is out", only this grace period.
    pub fn set_reap_grace(&self, grace: Duration) {
        self.inner.reap_grace_ms.store(grace.as_millis() as u64, Ordering::SeqCst);
    }

    /// Provide the suspend-and-modify capability needed for foreign-thread
    /// operations ([Stride::follow], [Stride::unfollow], cross-thread
    /// invalidation).
    pub fn set_thread_control(&self, thread_control: Arc<dyn ThreadControl>) {
        *self.inner.thread_control.write().unwrap() = thread_control;
    }

    /// Begin following the calling thread: on return, the caller is already
    /// executing out of the translation cache.
    pub fn follow_me(
        &self,
        transformer: Option<Arc<dyn Transformer>>,
        sink: Option<Arc<dyn EventSink>>,
    ) {
        let args = Box::into_raw(Box::new(FollowMeArgs { transformer, sink }));
        unsafe { follow_me_trampoline(Arc::as_ptr(&self.inner), args) }
    }

    /// Stop following the calling thread. Safe to call from instrumented
    /// code; takes effect at the next event site or control transfer.
    pub fn unfollow_me(&self) {
        unsafe { unfollow_me_trampoline(Arc::as_ptr(&self.inner)) }
    }

    pub fn is_following_me(&self) -> bool {
        !exec_ctx::tls_get_ctx(Arc::as_ptr(&self.inner)).is_null()
    }

    /// Follow another thread via the configured [ThreadControl].
    pub fn follow(
        &self,
        thread_id: ThreadId,
        transformer: Option<Arc<dyn Transformer>>,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Result<()> {
        if thread_id == os::current_thread_id() {
            self.follow_me(transformer, sink);
            return Ok(());
        }

        let inner = self.inner.clone();
        let mut state = Some((transformer, sink));
        let infected = self.inner.thread_control().modify_thread(thread_id, &mut |cpu| {
            let (transformer, sink) = state.take().expect("thread modified twice");
            infect(&inner, thread_id, transformer, sink, cpu);
        });

        if !infected {
            return Err(Error::Unsupported);
        }
        Ok(())
    }

    pub fn unfollow(&self, thread_id: ThreadId) -> Result<()> {
        if thread_id == os::current_thread_id() {
            self.unfollow_me();
            return Ok(());
        }

        let ctx = match self.inner.find_ctx_by_thread_id(thread_id) {
            Some(ctx) => ctx,
            None => return Err(Error::NotFollowed(thread_id)),
        };
        let ctx_ref = unsafe { &*ctx };

        if !ctx_ref.try_begin_unfollow() {
            return Ok(());
        }

        // If the thread never entered the cache, roll the redirect back
        // instead of waiting for it to run.
        if !ctx_ref.has_executed() {
            let mut disinfected = false;
            self.inner.thread_control().modify_thread(thread_id, &mut |cpu| {
                disinfected = disinfect(ctx_ref, cpu);
            });

            if disinfected {
                self.inner.destroy_exec_ctx(ctx);
            }
        }

        Ok(())
    }

    /// Arm the engine but keep it inert until `target` is reached; the
    /// block translated at `target` is pinned so this edge survives.
    pub fn activate(&self, target: usize) {
        unsafe { activate_trampoline(Arc::as_ptr(&self.inner), target) }
    }

    pub fn deactivate(&self) {
        unsafe { deactivate_trampoline(Arc::as_ptr(&self.inner)) }
    }

    /// Throw away the calling thread's translation of the block containing
    /// `address`; it is recompiled on next entry.
    pub fn invalidate(&self, address: usize) {
        let activation = self.maybe_deactivate();
        if activation.ctx.is_null() {
            return;
        }

        self.do_invalidate(activation.ctx, address, &activation);

        self.maybe_reactivate(activation);
    }

    /// Invalidate `address` in another thread's cache, spinning out any
    /// race with that thread currently executing the trampoline window.
    pub fn invalidate_for_thread(&self, thread_id: ThreadId, address: usize) {
        let activation = self.maybe_deactivate();

        if let Some(ctx) = self.inner.find_ctx_by_thread_id(thread_id) {
            while !self.do_invalidate(ctx, address, &activation) {
                std::thread::yield_now();
            }
        }

        self.maybe_reactivate(activation);
    }

    fn invalidate_for_all_threads(&self, address: usize, activation: &Activation) {
        let contexts: Vec<*mut ExecCtx> =
            self.inner.contexts.lock().unwrap().iter().map(|handle| handle.0).collect();

        for ctx in contexts {
            while !self.do_invalidate(ctx, address, activation) {
                std::thread::yield_now();
            }
        }
    }

    /// Returns false when the target thread sat inside the invalidation
    /// trampoline and the caller must retry.
    fn do_invalidate(&self, ctx: *mut ExecCtx, address: usize, activation: &Activation) -> bool {
        let ctx_ref = unsafe { &*ctx };
        let mut executing_target_block = false;

        ctx_ref.code_lock().with(|| {
            let block = match ctx_ref.block_for_no_lock(address) {
                Some(block) => block,
                None => return,
            };

            if ctx == activation.ctx {
                unsafe { (*block).invalidate() };
            } else {
                self.inner.thread_control().modify_thread(ctx_ref.thread_id, &mut |cpu| {
                    let code_start = unsafe { (*block).code_start } as u64;
                    let window = crate::block::INVALIDATE_TRAMPOLINE_SIZE as u64;
                    if cpu.rip >= code_start && cpu.rip < code_start + window {
                        executing_target_block = true;
                        return;
                    }
                    unsafe { (*block).invalidate() };
                });
            }
        });

        !executing_target_block
    }

    /// Install a callback fired whenever translated code calls `target`.
    pub fn add_call_probe(&self, target: usize, callback: ProbeCallback) -> ProbeId {
        let activation = self.maybe_deactivate();

        let (id, is_first_for_target) = self.inner.probes.add(target, callback);

        if is_first_for_target {
            self.invalidate_for_all_threads(target, &activation);
        }

        self.maybe_reactivate(activation);
        id
    }

    pub fn remove_call_probe(&self, id: ProbeId) {
        let activation = self.maybe_deactivate();

        if let Some((target, is_last_for_target)) = self.inner.probes.remove(id) {
            if is_last_for_target {
                self.invalidate_for_all_threads(target, &activation);
            }
        }

        self.maybe_reactivate(activation);
    }

    /// Attach an observer to the calling thread's context. Must be
    /// followed.
    pub fn set_observer(&self, observer: Option<Arc<dyn Observer>>) {
        let ctx = exec_ctx::tls_get_ctx(Arc::as_ptr(&self.inner));
        assert!(!ctx.is_null(), "set_observer requires the calling thread to be followed");
        unsafe { (*ctx).set_observer(observer) };
    }

    /// Translate `address` ahead of time into the calling thread's cache.
    pub fn prefetch(&self, address: usize, recycle_count: i32) {
        let ctx = exec_ctx::tls_get_ctx(Arc::as_ptr(&self.inner));
        assert!(!ctx.is_null(), "prefetch requires the calling thread to be followed");

        let (block, _code_address) = unsafe { (*ctx).obtain_block_for(address as *mut u8) };
        unsafe { (*block).recycle_count = recycle_count };
    }

    /// Replay a backpatch descriptor captured by an observer in a previous
    /// run, pre-warming the edge it describes.
    pub fn prefetch_backpatch(&self, descriptor: &crate::backpatch::Backpatch) {
        let ctx = exec_ctx::tls_get_ctx(Arc::as_ptr(&self.inner));
        assert!(!ctx.is_null(), "prefetch_backpatch requires the calling thread to be followed");
        let ctx = unsafe { &*ctx };

        let (to, from) = descriptor.edge();
        let (block_to, _) = ctx.obtain_block_for(to as *mut u8);
        let (block_from, _) = ctx.obtain_block_for(from as *mut u8);

        let trust_threshold = self.inner.trust_threshold();
        unsafe {
            (*block_to).recycle_count = trust_threshold;
            (*block_from).recycle_count = trust_threshold;
        }

        crate::backpatch::apply(block_to, block_from, descriptor);
    }

    /// Flush every followed thread's event sink.
    pub fn flush(&self) {
        let sinks: Vec<Arc<dyn EventSink>> = self
            .inner
            .contexts
            .lock()
            .unwrap()
            .iter()
            .map(|handle| unsafe { (*handle.0).sink() })
            .collect();

        for sink in sinks {
            sink.flush();
        }
    }

    /// Unfollow every thread, drop all probes, then collect contexts.
    pub fn stop(&self) {
        self.inner.probes.clear();

        'rescan: loop {
            let active = self
                .inner
                .contexts
                .lock()
                .unwrap()
                .iter()
                .map(|handle| handle.0)
                .find(|&ctx| unsafe { (*ctx).is_active() });

            match active {
                Some(ctx) => {
                    let thread_id = unsafe { (*ctx).thread_id };
                    let _ = self.unfollow(thread_id);
                    continue 'rescan;
                }
                None => break,
            }
        }

        self.garbage_collect();
    }

    /// Reap contexts whose threads have demonstrably left translated code
    /// or vanished. Returns true while contexts remain.
    pub fn garbage_collect(&self) -> bool {
        let current_thread_id = os::current_thread_id();
        let grace = Duration::from_millis(self.inner.reap_grace_ms.load(Ordering::SeqCst));

        loop {
            let victim = {
                let contexts = self.inner.contexts.lock().unwrap();
                contexts
                    .iter()
                    .map(|handle| handle.0)
                    .find(|&ctx| {
                        let ctx = unsafe { &*ctx };

                        let likely_back_in_original_code = ctx.state() == RunState::DestroyPending
                            && (ctx.thread_id == current_thread_id
                                || ctx
                                    .destroy_pending_since()
                                    .is_some_and(|since| since.elapsed() > grace));

                        likely_back_in_original_code || !os::has_thread(ctx.thread_id)
                    })
            };

            match victim {
                Some(ctx) => self.inner.destroy_exec_ctx(ctx),
                None => break,
            }
        }

        !self.inner.contexts.lock().unwrap().is_empty()
    }

    /// To be wired into the embedder's trap handler: completes a
    /// single-step excursion by resolving the stepped-to address and
    /// redirecting the thread back into the cache. The handler must clear
    /// the trap flag itself. Returns false when the trap was not ours.
    pub fn on_single_step(&self, cpu_context: &mut CpuContext) -> bool {
        let ctx = exec_ctx::tls_get_ctx(Arc::as_ptr(&self.inner));
        if ctx.is_null() {
            return false;
        }
        let ctx = unsafe { &*ctx };

        if ctx.mode() != MODE_SINGLE_STEPPING_ON_CALL {
            return false;
        }

        let resume_at = ctx.switch_block(cpu_context.rip as *mut u8);
        cpu_context.rip = resume_at as u64;
        ctx.set_mode(MODE_NORMAL);
        true
    }

    fn maybe_deactivate(&self) -> Activation {
        let ctx = exec_ctx::tls_get_ctx(Arc::as_ptr(&self.inner));
        let mut activation = Activation { ctx, pending: false, target: 0 };

        if !ctx.is_null() && unsafe { (*ctx).pending_calls() } == 0 {
            activation.pending = true;
            activation.target = unsafe { (*ctx).activation_target() }.unwrap_or(0);
            self.deactivate();
        }

        activation
    }

    fn maybe_reactivate(&self, activation: Activation) {
        if activation.pending {
            self.activate(activation.target);
        }
    }
}

struct Activation {
    ctx: *mut ExecCtx,
    pending: bool,
    target: usize,
}

struct FollowMeArgs {
    transformer: Option<Arc<dyn Transformer>>,
    sink: Option<Arc<dyn EventSink>>,
}

/// Capture the address of our caller's return slot and tail-call into the
/// engine, which patches the slot so the return lands in translated code.
#[unsafe(naked)]
unsafe extern "sysv64" fn follow_me_trampoline(_inner: *const Inner, _args: *mut FollowMeArgs) {
    core::arch::naked_asm!(
        "mov rdx, rsp",
        "jmp {do_follow_me}",
        do_follow_me = sym do_follow_me,
    );
}

extern "sysv64" fn do_follow_me(
    inner: *const Inner,
    args: *mut FollowMeArgs,
    ret_addr_ptr: *mut *mut u8,
) {
    let inner = unsafe {
        Arc::increment_strong_count(inner);
        Arc::from_raw(inner)
    };
    let args = unsafe { Box::from_raw(args) };

    let ctx = inner.create_exec_ctx(os::current_thread_id(), args.transformer, args.sink);
    exec_ctx::tls_set_ctx(ctx);
    let ctx_ref = unsafe { &*ctx };

    let return_address = unsafe { *ret_addr_ptr };
    let (block, code_address) = ctx_ref.obtain_block_for(return_address);
    ctx_ref.set_current_block(block);

    if ctx_ref.maybe_unfollow(Some(return_address)) {
        inner.destroy_exec_ctx(ctx);
        return;
    }

    ctx_ref.start_sink();

    unsafe { *ret_addr_ptr = code_address };
}

/// Stable symbol the dispatcher compares call targets against; calling it
/// from instrumented code must leave the cache before taking effect.
#[inline(never)]
pub(crate) extern "sysv64" fn unfollow_me_trampoline(inner: *const Inner) {
    let ctx = exec_ctx::tls_get_ctx(inner);
    if ctx.is_null() {
        return;
    }
    let ctx_ref = unsafe { &*ctx };

    ctx_ref.set_state(RunState::UnfollowPending);

    if !ctx_ref.maybe_unfollow(None) {
        return;
    }

    let inner = unsafe { &*inner };
    inner.destroy_exec_ctx(ctx);
}

pub(crate) fn unfollow_me_trampoline_address() -> usize {
    unfollow_me_trampoline as usize
}

#[unsafe(naked)]
unsafe extern "sysv64" fn activate_trampoline(_inner: *const Inner, _target: usize) {
    core::arch::naked_asm!(
        "mov rdx, rsp",
        "jmp {do_activate}",
        do_activate = sym do_activate,
    );
}

extern "sysv64" fn do_activate(inner: *const Inner, target: usize, ret_addr_ptr: *mut *mut u8) {
    let ctx = exec_ctx::tls_get_ctx(inner);
    if ctx.is_null() {
        return;
    }
    let ctx = unsafe { &*ctx };

    ctx.unfollow_called_while_still_following.store(false, Ordering::SeqCst);
    ctx.set_activation_target(target);

    let return_address = unsafe { *ret_addr_ptr };
    if !ctx.contains(return_address) {
        let (block, code_address) = ctx.obtain_block_for(return_address);
        ctx.set_current_block(block);

        if ctx.maybe_unfollow(Some(return_address)) {
            return;
        }

        unsafe { *ret_addr_ptr = code_address };
    }
}

/// Like [unfollow_me_trampoline], a stable symbol the dispatcher matches.
#[unsafe(naked)]
pub(crate) unsafe extern "sysv64" fn deactivate_trampoline(_inner: *const Inner) {
    core::arch::naked_asm!(
        "mov rsi, rsp",
        "jmp {do_deactivate}",
        do_deactivate = sym do_deactivate,
    );
}

extern "sysv64" fn do_deactivate(inner: *const Inner, ret_addr_ptr: *mut *mut u8) {
    let ctx = exec_ctx::tls_get_ctx(inner);
    if ctx.is_null() {
        return;
    }
    let ctx = unsafe { &*ctx };

    ctx.unfollow_called_while_still_following.store(true, Ordering::SeqCst);
    ctx.clear_activation_target();

    // Called from inside the cache: splice the return so control leaves
    // translated code at the pending location.
    let return_address = unsafe { *ret_addr_ptr };
    if ctx.contains(return_address) {
        ctx.adjust_pending_calls(-1);
        unsafe { *ret_addr_ptr = ctx.pending_return_location() };
    }
}

pub(crate) fn deactivate_trampoline_address() -> usize {
    deactivate_trampoline as usize
}

/// Runs on the target thread's behalf with that thread stopped: set up the
/// context, compile the entry block, and point the thread at the infection
/// thunk.
fn infect(
    inner: &Arc<Inner>,
    thread_id: ThreadId,
    transformer: Option<Arc<dyn Transformer>>,
    sink: Option<Arc<dyn EventSink>>,
    cpu_context: &mut CpuContext,
) {
    let ctx = inner.create_exec_ctx(thread_id, transformer, sink);
    let ctx_ref = unsafe { &*ctx };

    let pc = cpu_context.rip as *mut u8;
    let (block, code_address) = ctx_ref.obtain_block_for(pc);
    ctx_ref.set_current_block(block);

    if ctx_ref.maybe_unfollow(None) {
        inner.destroy_exec_ctx(ctx);
        return;
    }

    let infect_body = ctx_ref.write_infect_thunk(pc, code_address);

    ctx_ref.start_sink();

    cpu_context.rip = infect_body as u64;
}

/// Undo a pending infection: only possible while the thread still sits at
/// the thunk entry.
fn disinfect(ctx: &ExecCtx, cpu_context: &mut CpuContext) -> bool {
    let infection_not_active_yet = cpu_context.rip as usize == ctx.infect_body();
    if infection_not_active_yet {
        cpu_context.rip = unsafe { (*ctx.current_block()).real_start } as u64;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::CollectorSink;
    use crate::events::{Event, EventMask};
    use crate::virtualmem::tests::TestingPages;

    fn test_engine() -> Stride {
        Stride::for_tests(Box::new(TestingPages::new_rwx()), 4)
    }

    /// Create a context for the current thread without redirecting it.
    fn test_ctx(
        engine: &Stride,
        sink: Option<Arc<dyn EventSink>>,
    ) -> *mut ExecCtx {
        engine.inner().create_exec_ctx(os::current_thread_id(), None, sink)
    }

    #[test]
    fn ic_entries_are_validated() {
        assert!(Stride::with_ic_entries(1).is_err());
        assert!(Stride::with_ic_entries(33).is_err());
        assert!(Stride::with_ic_entries(2).is_ok());
        assert!(Stride::with_ic_entries(32).is_ok());
    }

    #[test]
    fn trust_threshold_roundtrips() {
        let engine = test_engine();
        assert_eq!(engine.get_trust_threshold(), 1);
        engine.set_trust_threshold(-1);
        assert_eq!(engine.get_trust_threshold(), -1);
    }

    #[test]
    fn exclusions_cover_their_range() {
        let engine = test_engine();
        engine.exclude(MemoryRange { base: 0x7000_0000, size: 0x1000 });
        assert!(engine.inner().is_excluding(0x7000_0000));
        assert!(engine.inner().is_excluding(0x7000_0fff));
        assert!(!engine.inner().is_excluding(0x7000_1000));
        assert!(!engine.inner().is_excluding(0x6fff_ffff));
    }

    #[test]
    fn remote_follow_without_thread_control_is_unsupported() {
        let engine = test_engine();
        let bogus = ThreadId(u64::MAX - 1);
        assert!(matches!(engine.follow(bogus, None, None), Err(Error::Unsupported)));
        assert!(matches!(engine.unfollow(bogus), Err(Error::NotFollowed(_))));
    }

    #[test]
    fn garbage_collect_on_empty_engine() {
        let engine = test_engine();
        assert!(!engine.garbage_collect());
    }

    #[test]
    fn flush_reaches_every_followed_sink() {
        let engine = test_engine();
        let sink = Arc::new(CollectorSink::with_mask(EventMask::empty()));
        let ctx = test_ctx(&engine, Some(sink.clone()));

        unsafe { (*ctx).start_sink() };
        assert!(sink.started.load(std::sync::atomic::Ordering::SeqCst));

        engine.flush();
        assert!(sink.flushed.load(std::sync::atomic::Ordering::SeqCst));

        engine.inner().destroy_exec_ctx(ctx);
    }

    /// mov eax, 1; mov ebx, 2; ret
    fn straight_line_guest() -> Vec<u8> {
        vec![0xb8, 0x01, 0x00, 0x00, 0x00, 0xbb, 0x02, 0x00, 0x00, 0x00, 0xc3]
    }

    #[test]
    fn straight_line_block_is_translated_and_snapshotted() {
        let engine = test_engine();
        let sink = Arc::new(CollectorSink::with_mask(EventMask::COMPILE));
        let ctx = test_ctx(&engine, Some(sink.clone()));
        let ctx_ref = unsafe { &*ctx };

        let guest = straight_line_guest();
        let (block, code_address) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);
        let block_ref = unsafe { &*block };

        // The whole basic block was consumed, up to and including the ret
        assert_eq!(block_ref.real_size as usize, guest.len());
        assert!(block_ref.code_size > 0);
        assert_eq!(block_ref.code_start, code_address);

        // Snapshot equals the live guest bytes (trust threshold is 1)
        let snapshot = unsafe {
            std::slice::from_raw_parts(block_ref.snapshot_start(), block_ref.real_size as usize)
        };
        assert_eq!(snapshot, &guest[..]);

        // The non-branch prefix is relocated verbatim
        let translated = unsafe {
            std::slice::from_raw_parts(block_ref.code_start, block_ref.code_size as usize)
        };
        assert!(
            translated.windows(10).any(|w| w == &guest[..10]),
            "straight-line instructions should be copied through"
        );

        // One compile event, covering the guest range
        let events = sink.events.lock().unwrap();
        assert_eq!(
            events[..],
            [Event::Compile {
                start: guest.as_ptr() as usize,
                end: guest.as_ptr() as usize + guest.len(),
            }]
        );

        engine.inner().destroy_exec_ctx(ctx);
    }

    #[test]
    fn repeated_lookup_reuses_and_recycles() {
        let engine = test_engine();
        let ctx = test_ctx(&engine, None);
        let ctx_ref = unsafe { &*ctx };

        let guest = straight_line_guest();
        let (block_a, _) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);
        let (block_b, _) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);

        assert_eq!(block_a, block_b, "mappings must be single-valued");
        assert_eq!(unsafe { (*block_b).recycle_count }, 1);

        engine.inner().destroy_exec_ctx(ctx);
    }

    #[test]
    fn self_modified_block_is_recompiled_below_trust() {
        let engine = test_engine();
        let ctx = test_ctx(&engine, None);
        let ctx_ref = unsafe { &*ctx };
        engine.set_trust_threshold(100); // never trusted within this test

        let mut guest = straight_line_guest();
        let (block, _) = ctx_ref.obtain_block_for(guest.as_mut_ptr());
        let old_code_size = unsafe { (*block).code_size };

        // Rewrite the immediate: snapshot compare must now fail
        guest[1] = 0x2a;
        let (block_again, _) = ctx_ref.obtain_block_for(guest.as_mut_ptr());
        assert_eq!(block, block_again);

        let snapshot = unsafe {
            std::slice::from_raw_parts((*block).snapshot_start(), (*block).real_size as usize)
        };
        assert_eq!(snapshot, &guest[..], "snapshot must track the recompilation");
        assert_eq!(unsafe { (*block).code_size }, old_code_size);

        engine.inner().destroy_exec_ctx(ctx);
    }

    #[test]
    fn indirect_call_site_embeds_inline_cache() {
        let engine = test_engine();
        let ctx = test_ctx(&engine, None);
        let ctx_ref = unsafe { &*ctx };

        // call qword [rax*8 + 0x2000]; ret
        let guest = [0xffu8, 0x14, 0xc5, 0x00, 0x20, 0x00, 0x00, 0xc3];
        let (block, _) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);
        let block_ref = unsafe { &*block };

        let translated = unsafe {
            std::slice::from_raw_parts(block_ref.code_start, block_ref.code_size as usize)
        };
        let empty = crate::block::IC_MAGIC_EMPTY.to_le_bytes();
        let slots = translated.windows(8).filter(|w| *w == empty).count();
        assert_eq!(slots, 4, "one empty marker per configured IC entry");

        engine.inner().destroy_exec_ctx(ctx);
    }

    #[test]
    fn probed_block_gets_longer_translation() {
        let engine = test_engine();

        let guest = straight_line_guest();
        let probe_id = engine.add_call_probe(guest.as_ptr() as usize, Box::new(|_| {}));

        let ctx = test_ctx(&engine, None);
        let ctx_ref = unsafe { &*ctx };
        let (block, _) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);
        let probed_size = unsafe { (*block).code_size };
        engine.inner().destroy_exec_ctx(ctx);

        engine.remove_call_probe(probe_id);

        let ctx = test_ctx(&engine, None);
        let ctx_ref = unsafe { &*ctx };
        let (block, _) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);
        let plain_size = unsafe { (*block).code_size };
        engine.inner().destroy_exec_ctx(ctx);

        assert!(
            probed_size > plain_size,
            "probe trampoline must be emitted ahead of the block"
        );
    }

    #[test]
    fn remote_follow_infects_and_unfollow_disinfects() {
        let engine = test_engine();

        let guest = [0x90u8, 0x90, 0x90, 0xc3];
        let entry = unsafe { guest.as_ptr().add(2) };
        let thread_id = ThreadId(0xdead);
        let cpu = CpuContext { rip: entry as u64, ..Default::default() };
        let control = Arc::new(crate::os::tests::ScriptedThreads::with_thread(thread_id, cpu));
        engine.set_thread_control(control.clone());

        engine.follow(thread_id, None, None).unwrap();

        // The thread was redirected to the infection thunk, which binds the
        // TLS slot before entering the translated entry block
        let ctx = engine.inner().find_ctx_by_thread_id(thread_id).unwrap();
        let redirected = control.contexts.lock().unwrap()[0].1.rip;
        assert_eq!(redirected as usize, unsafe { (*ctx).infect_body() });
        assert_ne!(redirected, entry as u64);

        // The thread never ran, so unfollow rolls the redirect back
        engine.unfollow(thread_id).unwrap();
        assert_eq!(control.contexts.lock().unwrap()[0].1.rip, entry as u64);
        assert!(engine.inner().find_ctx_by_thread_id(thread_id).is_none());
    }

    #[test]
    fn gc_reaps_destroy_pending_context_of_current_thread() {
        let engine = test_engine();
        let ctx = test_ctx(&engine, None);
        let ctx_ref = unsafe { &*ctx };

        ctx_ref.set_state(RunState::UnfollowPending);
        assert!(ctx_ref.maybe_unfollow(None));

        // Own-thread contexts are reaped without waiting out the grace
        assert!(!engine.garbage_collect());
    }
}

#[cfg(test)]
mod emission_tests {
    use super::*;
    use crate::events::testing::CollectorSink;
    use crate::events::EventMask;
    use crate::virtualmem::tests::TestingPages;
    use std::sync::Arc;

    fn count_embedded_u64(code: &[u8], value: u64) -> usize {
        let needle = value.to_le_bytes();
        code.windows(8).filter(|w| *w == needle).count()
    }

    /// An excluded call must execute natively: the translated block carries
    /// the pending-call accounting instead of a dispatcher transfer for the
    /// target.
    #[test]
    fn excluded_call_runs_natively_with_pending_call_accounting() {
        let engine = Stride::for_tests(Box::new(TestingPages::new_rwx()), 2);
        let ctx = engine.inner().create_exec_ctx(os::current_thread_id(), None, None);
        let ctx_ref = unsafe { &*ctx };

        // call rel32 to a nearby "library" body, then ret
        let mut guest = vec![0xe8u8, 0x10, 0x00, 0x00, 0x00, 0xc3];
        guest.resize(64, 0x90);
        let target = guest.as_ptr() as usize + 0x15;

        engine.exclude(MemoryRange { base: target, size: 0x10 });

        let (block, _) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);
        let block_ref = unsafe { &*block };
        let translated = unsafe {
            std::slice::from_raw_parts(block_ref.code_start, block_ref.code_size as usize)
        };

        // The pending-calls counter address is materialized only on the
        // excluded path (increment before the native call, decrement after)
        assert_eq!(
            count_embedded_u64(translated, ctx_ref.addr_of_pending_calls()),
            2,
            "excluded call must bracket the native call with pending-call accounting"
        );

        engine.inner().destroy_exec_ctx(ctx);
    }

    /// With an EXEC mask, every kept instruction gets an emission site.
    #[test]
    fn exec_mask_plants_one_event_site_per_instruction() {
        let engine = Stride::for_tests(Box::new(TestingPages::new_rwx()), 2);
        let sink = Arc::new(CollectorSink::with_mask(EventMask::EXEC));
        let ctx = engine.inner().create_exec_ctx(os::current_thread_id(), None, Some(sink));
        let ctx_ref = unsafe { &*ctx };

        // mov eax, 1; mov ebx, 2; ret
        let guest = [0xb8u8, 0x01, 0x00, 0x00, 0x00, 0xbb, 0x02, 0x00, 0x00, 0x00, 0xc3];
        let (block, _) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);
        let block_ref = unsafe { &*block };
        let translated = unsafe {
            std::slice::from_raw_parts(block_ref.code_start, block_ref.code_size as usize)
        };

        let emit_exec = crate::exec_ctx::emit_exec_event as usize as u64;
        assert_eq!(
            count_embedded_u64(translated, emit_exec),
            3,
            "three guest instructions, three exec sites"
        );

        engine.inner().destroy_exec_ctx(ctx);
    }

    /// The ret virtualization must route through the stack-pop-and-go
    /// helper rather than translating the ret in place.
    #[test]
    fn ret_dispatches_through_the_stack_helper() {
        let engine = Stride::for_tests(Box::new(TestingPages::new_rwx()), 2);
        let ctx = engine.inner().create_exec_ctx(os::current_thread_id(), None, None);
        let ctx_ref = unsafe { &*ctx };

        let guest = [0xc3u8];
        let (block, _) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);
        let block_ref = unsafe { &*block };
        let translated = unsafe {
            std::slice::from_raw_parts(block_ref.code_start, block_ref.code_size as usize)
        };

        // The transfer hands the guest ret's own address to the helper
        // (movabs rcx, <address of the ret instruction>)
        let mut expected = vec![0x48u8, 0xb9];
        expected.extend_from_slice(&(guest.as_ptr() as u64).to_le_bytes());
        assert!(
            translated.windows(expected.len()).any(|w| w == expected),
            "ret must be dispatched through the stack-pop-and-go helper"
        );
        // ...and the block ends in the unreachable trap
        assert_eq!(*translated.last().unwrap(), 0xcc);

        engine.inner().destroy_exec_ctx(ctx);
    }
}
