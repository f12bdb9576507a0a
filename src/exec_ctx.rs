//! Per-thread execution context: the translation mapping, the slab chain,
//! the shadow return stack, and the dispatcher that slow paths re-enter
//! through. One context is driven by its thread alone on the fast path;
//! cross-thread operations (invalidation, backpatch replay) synchronize on
//! the code spinlock.

use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::asm::CodeWriter;
use crate::block::{ExecBlock, BLOCK_FLAG_ACTIVATION_TARGET, MIN_BLOCK_CAPACITY};
use crate::cpu::CpuContext;
use crate::engine::Inner;
use crate::events::{Event, EventMask, EventSink};
use crate::helpers::{ensure_helpers_reachable, HelperSet};
use crate::observer::Observer;
use crate::os::ThreadId;
use crate::relocator::Relocator;
use crate::slab::{CodeSlab, DataSlab};
use crate::transform::Transformer;
use crate::utils::{align_up, SpinLock};
use crate::virtualmem::{freeze, thaw, AddressSpec};

pub(crate) const MODE_NORMAL: u32 = 0;
pub(crate) const MODE_SINGLE_STEPPING_ON_CALL: u32 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum RunState {
    Active = 0,
    UnfollowPending = 1,
    DestroyPending = 2,
}

/// One shadow return-stack entry. The array is written by emitted code with
/// hardcoded offsets; keep the layout.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub(crate) struct ExecFrame {
    pub real_address: *mut u8,
    pub code_address: *mut u8,
}

thread_local! {
    static CURRENT_EXEC_CTX: Cell<*mut ExecCtx> = const { Cell::new(std::ptr::null_mut()) };
}

pub(crate) fn tls_set_ctx(ctx: *mut ExecCtx) {
    CURRENT_EXEC_CTX.with(|cell| cell.set(ctx));
}

/// The context bound to the calling thread for `engine`, if any.
pub(crate) fn tls_get_ctx(engine: *const Inner) -> *mut ExecCtx {
    let ctx = CURRENT_EXEC_CTX.with(|cell| cell.get());
    if ctx.is_null() {
        return std::ptr::null_mut();
    }
    if Arc::as_ptr(unsafe { &(*ctx).engine }) != engine {
        return std::ptr::null_mut();
    }
    ctx
}

/// Bound into the target thread by the infection thunk itself, so the TLS
/// slot is populated before the first translated instruction runs.
pub(crate) extern "sysv64" fn tls_bind_current(ctx: *mut ExecCtx) {
    tls_set_ctx(ctx);
}

pub(crate) struct ExecCtx {
    // Fields below have their addresses baked into emitted code.
    state: AtomicU32,
    mode: AtomicU32,
    pending_calls: AtomicU32,
    resume_at: AtomicUsize,
    return_at: AtomicUsize,
    app_stack: AtomicUsize,
    current_frame: AtomicUsize,
    code_slab_head: AtomicUsize,
    pending_return_location: AtomicUsize,
    current_block: AtomicUsize,

    pub(crate) engine: Arc<Inner>,
    pub(crate) thread_id: ThreadId,

    frames: *mut ExecFrame,
    first_frame: *mut ExecFrame,

    thunk: *mut u8,
    infect_body: AtomicUsize,

    writer: UnsafeCell<CodeWriter>,
    relocator: UnsafeCell<Relocator>,
    helpers: UnsafeCell<HelperSet>,

    transformer: Arc<dyn Transformer>,
    sink: Arc<dyn EventSink>,
    sink_started: AtomicBool,
    sink_mask: EventMask,
    observer: Mutex<Option<Arc<dyn Observer>>>,

    pub(crate) unfollow_called_while_still_following: AtomicBool,
    activation_target: AtomicUsize,
    destroy_pending_since: Mutex<Option<Instant>>,

    code_lock: SpinLock,
    data_slab_head: AtomicUsize,
    scratch_slab: *mut CodeSlab,
    mappings: UnsafeCell<HashMap<usize, *mut ExecBlock>>,

    region_base: *mut u8,
    region_size: usize,
}

// The raw pointers are either engine-owned slab memory or guest addresses;
// cross-thread access is governed by the code lock and the atomics above.
unsafe impl Send for ExecCtx {}
unsafe impl Sync for ExecCtx {}

impl ExecCtx {
    /// Create a context with its whole working set in one region: header,
    /// shadow frames, infection thunk, initial code/data slabs and the
    /// scratch slab. Keeping them in one mapping guarantees the initial
    /// slabs are within displacement range of the header.
    pub fn new(
        engine: &Arc<Inner>,
        thread_id: ThreadId,
        transformer: Arc<dyn Transformer>,
        sink: Arc<dyn EventSink>,
    ) -> *mut ExecCtx {
        let page_size = engine.page_size();
        let header_size = align_up(std::mem::size_of::<ExecCtx>(), page_size);
        let frames_size = page_size;
        let thunk_size = page_size;

        let frames_offset = header_size;
        let thunk_offset = frames_offset + frames_size;
        let code_slab_offset = thunk_offset + thunk_size;
        let data_slab_offset = code_slab_offset + engine.code_slab_size_initial();
        let scratch_slab_offset = data_slab_offset + engine.data_slab_size_initial();
        let region_size = scratch_slab_offset + engine.scratch_slab_size();

        let base = engine
            .pages()
            .allocate(region_size, None)
            .expect("failed to map execution context")
            .as_ptr();

        let frames = unsafe { base.add(frames_offset) } as *mut ExecFrame;
        let frame_count = frames_size / std::mem::size_of::<ExecFrame>();
        let first_frame = unsafe { frames.add(frame_count - 1) };

        let code_slab = unsafe {
            CodeSlab::init_at(
                base.add(code_slab_offset) as *mut CodeSlab,
                engine.code_slab_size_initial(),
                page_size,
            )
        };
        let data_slab = unsafe {
            DataSlab::init_at(
                base.add(data_slab_offset) as *mut DataSlab,
                engine.data_slab_size_initial(),
            )
        };
        let scratch_slab = unsafe {
            CodeSlab::init_scratch_at(
                base.add(scratch_slab_offset) as *mut CodeSlab,
                engine.scratch_slab_size(),
            )
        };

        let sink_mask = sink.query_mask();

        let ctx = base as *mut ExecCtx;
        unsafe {
            ctx.write(ExecCtx {
                state: AtomicU32::new(RunState::Active as u32),
                mode: AtomicU32::new(MODE_NORMAL),
                pending_calls: AtomicU32::new(0),
                resume_at: AtomicUsize::new(0),
                return_at: AtomicUsize::new(0),
                app_stack: AtomicUsize::new(0),
                current_frame: AtomicUsize::new(first_frame as usize),
                code_slab_head: AtomicUsize::new(code_slab as usize),
                pending_return_location: AtomicUsize::new(0),
                current_block: AtomicUsize::new(0),
                engine: engine.clone(),
                thread_id,
                frames,
                first_frame,
                thunk: base.add(thunk_offset),
                infect_body: AtomicUsize::new(0),
                writer: UnsafeCell::new(CodeWriter::new()),
                relocator: UnsafeCell::new(Relocator::new()),
                helpers: UnsafeCell::new(HelperSet::empty()),
                transformer,
                sink,
                sink_started: AtomicBool::new(false),
                sink_mask,
                observer: Mutex::new(None),
                unfollow_called_while_still_following: AtomicBool::new(false),
                activation_target: AtomicUsize::new(0),
                destroy_pending_since: Mutex::new(None),
                code_lock: SpinLock::new(),
                data_slab_head: AtomicUsize::new(data_slab as usize),
                scratch_slab,
                mappings: UnsafeCell::new(HashMap::new()),
                region_base: base,
                region_size,
            });

            ensure_helpers_reachable(&*ctx);
        }

        log::debug!("created exec context for thread {thread_id:?}");
        ctx
    }

    /// Release every callout closure, dynamic slab and finally the region.
    ///
    /// # Safety
    /// No thread may still execute out of this context's slabs.
    pub unsafe fn free(ctx: *mut ExecCtx) {
        let engine = (*ctx).engine.clone();
        let pages = engine.pages();
        let region_base = (*ctx).region_base;
        let region_size = (*ctx).region_size;
        let region_end = region_base.add(region_size);
        let in_region = |ptr: *mut u8| ptr >= region_base && ptr < region_end;

        // Drop callout closures before their blocks go away
        let mut data_slab = (*ctx).data_slab_head() as *mut DataSlab;
        while !data_slab.is_null() {
            let slab = &(*data_slab).slab;
            let blocks = slab.start() as *mut ExecBlock;
            let num_blocks = slab.offset as usize / std::mem::size_of::<ExecBlock>();
            for i in 0..num_blocks {
                (*blocks.add(i)).clear();
            }
            data_slab = slab.next as *mut DataSlab;
        }

        // Free dynamically added slabs; the initial ones die with the region
        let mut code_slab = (*ctx).code_slab_head();
        while !code_slab.is_null() {
            let next = (*code_slab).slab.next as *mut CodeSlab;
            if !in_region(code_slab as *mut u8) {
                let total = ((*code_slab).slab.end() as usize) - (code_slab as usize);
                pages.free(code_slab as *mut u8, total);
            }
            code_slab = next;
        }
        let mut data_slab = (*ctx).data_slab_head() as *mut DataSlab;
        while !data_slab.is_null() {
            let next = (*data_slab).slab.next as *mut DataSlab;
            if !in_region(data_slab as *mut u8) {
                let total = ((*data_slab).slab.end() as usize) - (data_slab as usize);
                pages.free(data_slab as *mut u8, total);
            }
            data_slab = next;
        }

        std::ptr::drop_in_place(ctx);
        pages.free(region_base, region_size);
    }

    pub fn engine(&self) -> &Inner {
        &self.engine
    }

    pub fn code_lock(&self) -> &SpinLock {
        &self.code_lock
    }

    /// Emission state; callers must hold the code lock.
    #[allow(clippy::mut_from_ref)]
    pub fn writer(&self) -> &mut CodeWriter {
        unsafe { &mut *self.writer.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn relocator(&self) -> &mut Relocator {
        unsafe { &mut *self.relocator.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn helpers(&self) -> &mut HelperSet {
        unsafe { &mut *self.helpers.get() }
    }

    pub fn transformer(&self) -> Arc<dyn Transformer> {
        self.transformer.clone()
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    pub fn sink_mask(&self) -> EventMask {
        self.sink_mask
    }

    pub fn start_sink(&self) {
        if !self.sink_started.swap(true, Ordering::SeqCst) {
            self.sink.start();
        }
    }

    pub fn stop_sink(&self) {
        if self.sink_started.swap(false, Ordering::SeqCst) {
            self.sink.stop();
        }
    }

    pub fn observer(&self) -> Option<Arc<dyn Observer>> {
        self.observer.lock().unwrap().clone()
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn Observer>>) {
        *self.observer.lock().unwrap() = observer;
    }

    // Addresses baked into emitted sequences

    pub fn addr_of_app_stack(&self) -> u64 {
        &self.app_stack as *const _ as u64
    }

    pub fn addr_of_resume_at(&self) -> u64 {
        &self.resume_at as *const _ as u64
    }

    pub fn addr_of_return_at(&self) -> u64 {
        &self.return_at as *const _ as u64
    }

    pub fn addr_of_current_frame(&self) -> u64 {
        &self.current_frame as *const _ as u64
    }

    pub fn addr_of_pending_calls(&self) -> u64 {
        &self.pending_calls as *const _ as u64
    }

    pub fn addr_of_pending_return_location(&self) -> u64 {
        &self.pending_return_location as *const _ as u64
    }

    pub fn addr_of_mode(&self) -> u64 {
        &self.mode as *const _ as u64
    }

    pub fn addr_of_code_slab_head(&self) -> u64 {
        &self.code_slab_head as *const _ as u64
    }

    pub fn addr_of_current_block(&self) -> u64 {
        &self.current_block as *const _ as u64
    }

    pub fn first_frame(&self) -> *mut ExecFrame {
        self.first_frame
    }

    pub fn current_frame(&self) -> *mut ExecFrame {
        self.current_frame.load(Ordering::Relaxed) as *mut ExecFrame
    }

    /// Shadow-stack depth, in frames.
    pub fn depth(&self) -> u32 {
        let current = self.current_frame.load(Ordering::Relaxed);
        debug_assert!(current >= self.frames as usize, "shadow stack underflow");
        ((self.first_frame as usize - current) / std::mem::size_of::<ExecFrame>()) as u32
    }

    pub fn state(&self) -> RunState {
        match self.state.load(Ordering::SeqCst) {
            0 => RunState::Active,
            1 => RunState::UnfollowPending,
            _ => RunState::DestroyPending,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == RunState::Active
    }

    pub fn set_state(&self, state: RunState) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    pub fn try_begin_unfollow(&self) -> bool {
        self.state
            .compare_exchange(
                RunState::Active as u32,
                RunState::UnfollowPending as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn destroy_pending_since(&self) -> Option<Instant> {
        *self.destroy_pending_since.lock().unwrap()
    }

    pub fn begin_pending_call(&self) {
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_pending_call(&self) {
        self.pending_calls.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending_calls(&self) -> u32 {
        self.pending_calls.load(Ordering::SeqCst)
    }

    pub fn adjust_pending_calls(&self, delta: i32) {
        if delta >= 0 {
            self.pending_calls.fetch_add(delta as u32, Ordering::SeqCst);
        } else {
            self.pending_calls.fetch_sub((-delta) as u32, Ordering::SeqCst);
        }
    }

    pub fn activation_target(&self) -> Option<usize> {
        match self.activation_target.load(Ordering::SeqCst) {
            0 => None,
            target => Some(target),
        }
    }

    pub fn set_activation_target(&self, target: usize) {
        self.activation_target.store(target, Ordering::SeqCst);
    }

    pub fn clear_activation_target(&self) {
        self.activation_target.store(0, Ordering::SeqCst);
    }

    pub fn current_block(&self) -> *mut ExecBlock {
        self.current_block.load(Ordering::SeqCst) as *mut ExecBlock
    }

    pub fn set_current_block(&self, block: *mut ExecBlock) {
        self.current_block.store(block as usize, Ordering::SeqCst);
    }

    pub fn resume_at(&self) -> *mut u8 {
        self.resume_at.load(Ordering::SeqCst) as *mut u8
    }

    pub fn set_resume_at(&self, address: *mut u8) {
        self.resume_at.store(address as usize, Ordering::SeqCst);
    }

    pub fn pending_return_location(&self) -> *mut u8 {
        self.pending_return_location.load(Ordering::SeqCst) as *mut u8
    }

    pub fn infect_body(&self) -> usize {
        self.infect_body.load(Ordering::SeqCst)
    }

    pub fn code_slab_head(&self) -> *mut CodeSlab {
        self.code_slab_head.load(Ordering::SeqCst) as *mut CodeSlab
    }

    pub fn data_slab_head(&self) -> *mut DataSlab {
        self.data_slab_head.load(Ordering::SeqCst) as *mut DataSlab
    }

    fn add_code_slab(&self, slab: *mut CodeSlab) -> *mut CodeSlab {
        unsafe { (*slab).slab.next = &mut (*self.code_slab_head()).slab };
        self.code_slab_head.store(slab as usize, Ordering::SeqCst);
        slab
    }

    fn add_data_slab(&self, slab: *mut DataSlab) -> *mut DataSlab {
        unsafe { (*slab).slab.next = &mut (*self.data_slab_head()).slab };
        self.data_slab_head.store(slab as usize, Ordering::SeqCst);
        slab
    }

    /// Whether `address` lies inside this context's translated code.
    pub fn contains(&self, address: *const u8) -> bool {
        let mut slab = unsafe { &(*self.code_slab_head()).slab as *const crate::slab::Slab };
        while !slab.is_null() {
            let slab_ref = unsafe { &*slab };
            if slab_ref.contains(address) {
                return true;
            }
            slab = slab_ref.next;
        }
        false
    }

    pub fn has_executed(&self) -> bool {
        self.resume_at.load(Ordering::SeqCst) != 0
    }

    /// Complete a pending unfollow if the thread is out of engine code.
    pub fn maybe_unfollow(&self, resume_at: Option<*mut u8>) -> bool {
        if self.state() != RunState::UnfollowPending {
            return false;
        }
        if self.pending_calls() > 0 {
            return false;
        }
        self.unfollow(resume_at);
        true
    }

    pub fn unfollow(&self, resume_at: Option<*mut u8>) {
        self.set_current_block(std::ptr::null_mut());
        self.set_resume_at(resume_at.unwrap_or(std::ptr::null_mut()));

        if tls_get_ctx(Arc::as_ptr(&self.engine)) == self as *const ExecCtx as *mut ExecCtx {
            tls_set_ctx(std::ptr::null_mut());
        }

        *self.destroy_pending_since.lock().unwrap() = Some(Instant::now());
        self.set_state(RunState::DestroyPending);
        log::debug!("thread {:?} moving to destroy-pending", self.thread_id);
    }

    /// The dispatcher: resolve an untranslated target and report where the
    /// thread should resume. Shared by every entry gate.
    pub fn switch_block(&self, start_address: *mut u8) -> *mut u8 {
        if let Some(observer) = self.observer() {
            observer.increment_total();
        }

        let engine = self.engine();

        if start_address as usize == crate::engine::unfollow_me_trampoline_address()
            || start_address as usize == crate::engine::deactivate_trampoline_address()
        {
            self.unfollow_called_while_still_following.store(true, Ordering::SeqCst);
            self.set_current_block(std::ptr::null_mut());
            self.set_resume_at(start_address);
        } else if engine.thread_exit_impl() == Some(start_address as usize) {
            self.unfollow(Some(start_address));
        } else if self.maybe_unfollow(Some(start_address)) {
            // resume_at now points back at guest code
        } else if self.contains(start_address) {
            self.set_resume_at(start_address);
        } else {
            let (block, code_address) = self.obtain_block_for(start_address);
            self.set_current_block(block);
            self.set_resume_at(code_address);

            if self.activation_target() == Some(start_address as usize) {
                self.clear_activation_target();
                unsafe { (*block).flags |= BLOCK_FLAG_ACTIVATION_TARGET };
            }

            self.maybe_unfollow(Some(start_address));
        }

        self.resume_at()
    }

    /// Look up or translate the block at `real_address`. A stale block
    /// (snapshot no longer matching, trust not yet earned) is recompiled in
    /// place.
    pub fn obtain_block_for(&self, real_address: *mut u8) -> (*mut ExecBlock, *mut u8) {
        self.code_lock.acquire();

        let existing = unsafe { (*self.mappings.get()).get(&(real_address as usize)).copied() };

        let block = match existing {
            Some(block) => {
                let trust_threshold = self.engine().trust_threshold();
                let block_ref = unsafe { &mut *block };

                // A negative threshold means never trust; at or above the
                // threshold the block is reused unchecked; below it the
                // snapshot decides.
                let still_up_to_date = trust_threshold >= 0
                    && (block_ref.recycle_count >= trust_threshold || unsafe {
                        std::slice::from_raw_parts(block_ref.real_start, block_ref.real_size as usize)
                            == std::slice::from_raw_parts(
                                block_ref.snapshot_start(),
                                block_ref.real_size as usize,
                            )
                    });

                self.code_lock.release();

                if still_up_to_date {
                    if trust_threshold > 0 {
                        block_ref.recycle_count += 1;
                    }
                } else {
                    self.recompile_block(block);
                }

                block
            }
            None => {
                let block = self.block_new();
                let block_ref = unsafe { &mut *block };
                block_ref.real_start = real_address;

                let capacity = unsafe {
                    (*block_ref.code_slab).slab.end() as usize - block_ref.code_start as usize
                };
                let (real_size, code_size) = crate::compile::compile_block(
                    self,
                    block,
                    real_address,
                    block_ref.code_start,
                    block_ref.code_start as u64,
                    capacity,
                );
                block_ref.real_size = real_size;
                block_ref.code_size = code_size;
                block_ref.commit();

                unsafe { (*self.mappings.get()).insert(real_address as usize, block) };

                self.code_lock.release();

                self.maybe_emit_compile_event(block);
                block
            }
        };

        (block, unsafe { (*block).code_start })
    }

    /// Mapping lookup without taking the code lock; the caller holds it.
    pub fn block_for_no_lock(&self, real_address: usize) -> Option<*mut ExecBlock> {
        unsafe { (*self.mappings.get()).get(&real_address).copied() }
    }

    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: u32) {
        self.mode.store(mode, Ordering::SeqCst);
    }

    /// Retranslate a block. The fresh code is produced in the scratch slab
    /// at the block's final PC, then copied over the original site when it
    /// fits; otherwise it moves to a storage block and the original site
    /// becomes a jump, keeping old backpatch edges valid.
    pub fn recompile_block(&self, block: *mut ExecBlock) {
        let engine = self.engine();
        let block_ref = unsafe { &mut *block };
        let internal_code = block_ref.code_start;

        self.code_lock.acquire();

        thaw(engine.pages(), internal_code, block_ref.capacity as usize);

        if !block_ref.storage_block.is_null() {
            unsafe { (*block_ref.storage_block).clear() };
        }
        block_ref.clear();

        let original_slab = block_ref.code_slab;
        block_ref.code_slab = self.scratch_slab;
        let scratch_base = unsafe { (*self.scratch_slab).slab.start() };
        let scratch_capacity = unsafe { (*self.scratch_slab).slab.size as usize };

        let (input_size, output_size) = crate::compile::compile_block(
            self,
            block,
            block_ref.real_start,
            scratch_base,
            internal_code as u64,
            scratch_capacity,
        );

        block_ref.code_slab = original_slab;

        let new_snapshot_size = engine.snapshot_space_needed_for(input_size as usize);
        let new_block_size = output_size as usize + new_snapshot_size;

        if new_block_size <= block_ref.capacity as usize {
            block_ref.real_size = input_size;
            block_ref.code_size = output_size;

            unsafe {
                std::ptr::copy_nonoverlapping(scratch_base, internal_code, output_size as usize);
                std::ptr::copy_nonoverlapping(
                    block_ref.real_start,
                    block_ref.snapshot_start(),
                    new_snapshot_size,
                );
            }

            freeze(engine.pages(), internal_code, new_block_size);
        } else {
            let storage_block = self.block_new();
            let storage_ref = unsafe { &mut *storage_block };
            storage_ref.real_start = block_ref.real_start;

            let capacity = unsafe {
                (*storage_ref.code_slab).slab.end() as usize - storage_ref.code_start as usize
            };
            let (real_size, code_size) = crate::compile::compile_block(
                self,
                storage_block,
                storage_ref.real_start,
                storage_ref.code_start,
                storage_ref.code_start as u64,
                capacity,
            );
            storage_ref.real_size = real_size;
            storage_ref.code_size = code_size;
            storage_ref.commit();

            block_ref.storage_block = storage_block;

            thaw(engine.pages(), internal_code, block_ref.capacity as usize);
            let cw = self.writer();
            cw.reset(internal_code, block_ref.capacity as usize);
            crate::asm::x86_64::jmp_abs(cw, storage_ref.code_start as u64);
            cw.flush().expect("failed to resolve labels");
            freeze(engine.pages(), internal_code, block_ref.capacity as usize);
        }

        self.code_lock.release();

        log::trace!("recompiled block at {:p}", block_ref.real_start);
        self.maybe_emit_compile_event(block);
    }

    /// Carve a fresh block record out of the data slab and point it at the
    /// next free code-slab space, growing either chain as needed.
    pub fn block_new(&self) -> *mut ExecBlock {
        let engine = self.engine();
        let mut code_slab = self.code_slab_head();
        let mut data_slab = self.data_slab_head();

        let mut code_available = unsafe { (*code_slab).slab.available() };
        if code_available < MIN_BLOCK_CAPACITY + engine.ic_entry_size() {
            code_slab = self.add_code_slab(self.code_slab_new());

            let data_slab_size = unsafe { (*data_slab).slab.size as usize };
            let data_spec = self.compute_data_address_spec(data_slab_size);
            if !data_spec.satisfied_by(unsafe { (*data_slab).slab.start() } as usize) {
                data_slab = self.add_data_slab(self.data_slab_new());
            }

            ensure_helpers_reachable(self);

            code_available = unsafe { (*code_slab).slab.available() };
        }

        let block = unsafe {
            match (*data_slab).slab.try_reserve(std::mem::size_of::<ExecBlock>()) {
                Some(memory) => memory,
                None => {
                    data_slab = self.add_data_slab(self.data_slab_new());
                    (*data_slab).slab.reserve(std::mem::size_of::<ExecBlock>())
                }
            }
        } as *mut ExecBlock;

        unsafe {
            block.write(ExecBlock {
                ctx: self as *const ExecCtx as *mut ExecCtx,
                code_slab,
                storage_block: std::ptr::null_mut(),
                real_start: std::ptr::null_mut(),
                code_start: (*code_slab).slab.cursor(),
                real_size: 0,
                code_size: 0,
                capacity: 0,
                last_callout_offset: 0,
                flags: 0,
                recycle_count: 0,
            });

            thaw(engine.pages(), (*block).code_start, code_available);
        }

        block
    }

    fn code_slab_new(&self) -> *mut CodeSlab {
        let engine = self.engine();
        let slab_size = engine.code_slab_size_dynamic();
        let spec = self.compute_code_address_spec(slab_size);

        let base = engine
            .pages()
            .allocate(slab_size, Some(&spec))
            .expect("no executable memory within displacement range")
            .as_ptr();

        unsafe { CodeSlab::init_at(base as *mut CodeSlab, slab_size, engine.page_size()) }
    }

    fn data_slab_new(&self) -> *mut DataSlab {
        let engine = self.engine();
        let slab_size = engine.data_slab_size_dynamic();
        let spec = self.compute_data_address_spec(slab_size);

        let base = engine
            .pages()
            .allocate(slab_size, Some(&spec))
            .expect("no data memory within displacement range")
            .as_ptr();

        unsafe { DataSlab::init_at(base as *mut DataSlab, slab_size) }
    }

    /// Code must be able to reference context fields using 32-bit offsets.
    fn compute_code_address_spec(&self, slab_size: usize) -> AddressSpec {
        AddressSpec {
            near: self as *const ExecCtx as usize,
            max_distance: i32::MAX as usize - self.region_size - slab_size,
        }
    }

    /// Data must be able to reference code-slab contents using 32-bit
    /// offsets (inline caches hold translated addresses and vice versa).
    fn compute_data_address_spec(&self, slab_size: usize) -> AddressSpec {
        AddressSpec {
            near: self.code_slab_head() as usize,
            max_distance: i32::MAX as usize
                - self.engine().code_slab_size_dynamic()
                - slab_size,
        }
    }

    fn maybe_emit_compile_event(&self, block: *mut ExecBlock) {
        if !self.sink_mask.contains(EventMask::COMPILE) {
            return;
        }
        let block = unsafe { &*block };
        let event = Event::Compile {
            start: block.real_start as usize,
            end: block.real_start as usize + block.real_size as usize,
        };
        self.sink.process(&event, None);
    }

    /// Write the infection thunk: replay up to one syscall instruction,
    /// bind the TLS slot from inside the target thread, then enter the
    /// translated entry block.
    pub fn write_infect_thunk(&self, pc: *const u8, code_address: *mut u8) -> usize {
        const MAX_SYSCALL_SIZE: usize = 2;
        let engine = self.engine();

        self.code_lock.acquire();

        thaw(engine.pages(), self.thunk, engine.page_size());
        let cw = self.writer();
        cw.reset(self.thunk, engine.page_size());

        // An interrupted Linux syscall restarts at the syscall instruction,
        // so bring it along.
        let preceding =
            unsafe { std::slice::from_raw_parts(pc.sub(MAX_SYSCALL_SIZE), MAX_SYSCALL_SIZE) };
        cw.put_bytes(preceding);

        let infect_body = cw.pc();
        self.infect_body.store(infect_body as usize, Ordering::SeqCst);

        crate::helpers::write_prolog(self, crate::helpers::PrologKind::Minimal, cw);
        crate::helpers::write_call_aligned(
            cw,
            tls_bind_current as usize as u64,
            &[crate::helpers::CallArg::Imm(self as *const ExecCtx as u64)],
        );
        crate::helpers::write_epilog(self, crate::helpers::PrologKind::Minimal, cw);

        crate::asm::x86_64::jmp_abs(cw, code_address as u64);

        cw.flush().expect("failed to resolve labels");
        freeze(engine.pages(), self.thunk, engine.page_size());

        self.code_lock.release();

        infect_body as usize
    }
}

pub(crate) type EntryGate = extern "sysv64" fn(*mut ExecCtx, *mut u8) -> *mut u8;

macro_rules! define_entry_gate {
    ($name:ident, $increment:ident) => {
        pub(crate) extern "sysv64" fn $name(ctx: *mut ExecCtx, start_address: *mut u8) -> *mut u8 {
            let ctx = unsafe { &*ctx };
            if let Some(observer) = ctx.observer() {
                observer.$increment();
            }
            ctx.switch_block(start_address)
        }
    };
}

define_entry_gate!(entry_gate_call_imm, increment_call_imm);
define_entry_gate!(entry_gate_call_reg, increment_call_reg);
define_entry_gate!(entry_gate_call_mem, increment_call_mem);
define_entry_gate!(entry_gate_post_call_invoke, increment_post_call_invoke);
define_entry_gate!(entry_gate_excluded_call_imm, increment_excluded_call_imm);
define_entry_gate!(entry_gate_ret_slow_path, increment_ret_slow_path);

define_entry_gate!(entry_gate_jmp_imm, increment_jmp_imm);
define_entry_gate!(entry_gate_jmp_mem, increment_jmp_mem);
define_entry_gate!(entry_gate_jmp_reg, increment_jmp_reg);

define_entry_gate!(entry_gate_jmp_cond_imm, increment_jmp_cond_imm);
define_entry_gate!(entry_gate_jmp_cond_mem, increment_jmp_cond_mem);
define_entry_gate!(entry_gate_jmp_cond_reg, increment_jmp_cond_reg);
define_entry_gate!(entry_gate_jmp_cond_jcxz, increment_jmp_cond_jcxz);

define_entry_gate!(entry_gate_jmp_continuation, increment_jmp_continuation);

/// Target of the invalidation trampoline. `distance_ptr` is the address of
/// the distance word the trampoline's call pushed; it leads back to the
/// invalidated block record.
pub(crate) extern "sysv64" fn recompile_and_switch_block(ctx: *mut ExecCtx, distance_ptr: *mut i32) {
    let ctx = unsafe { &*ctx };
    let block = unsafe {
        let distance = *distance_ptr;
        (distance_ptr as *mut u8).offset(distance as isize) as *mut ExecBlock
    };
    let start_address = unsafe { (*block).real_start };

    if ctx.maybe_unfollow(Some(start_address)) {
        return;
    }

    ctx.recompile_block(block);

    ctx.set_current_block(block);
    ctx.set_resume_at(unsafe { (*block).code_start });

    if ctx.activation_target() == Some(start_address as usize) {
        ctx.clear_activation_target();
        unsafe { (*block).flags |= BLOCK_FLAG_ACTIVATION_TARGET };
    }

    ctx.maybe_unfollow(Some(start_address));
}

// Event shims called from emitted code with the full context saved.

pub(crate) extern "sysv64" fn emit_call_event(
    ctx: *mut ExecCtx,
    location: u64,
    target: u64,
    cpu_context: *mut CpuContext,
) {
    let ctx = unsafe { &*ctx };
    let event = Event::Call {
        location: location as usize,
        target: target as usize,
        depth: ctx.depth(),
    };
    unsafe { (*cpu_context).rip = location };
    ctx.sink.process(&event, Some(unsafe { &mut *cpu_context }));
}

pub(crate) extern "sysv64" fn emit_ret_event(ctx: *mut ExecCtx, location: u64, cpu_context: *mut CpuContext) {
    let ctx = unsafe { &*ctx };
    let app_stack = ctx.app_stack.load(Ordering::Relaxed) as *const usize;
    let event = Event::Ret {
        location: location as usize,
        target: unsafe { *app_stack },
        depth: ctx.depth(),
    };
    unsafe { (*cpu_context).rip = location };
    ctx.sink.process(&event, Some(unsafe { &mut *cpu_context }));
}

pub(crate) extern "sysv64" fn emit_exec_event(ctx: *mut ExecCtx, location: u64, cpu_context: *mut CpuContext) {
    let ctx = unsafe { &*ctx };
    let event = Event::Exec { location: location as usize };
    unsafe { (*cpu_context).rip = location };
    ctx.sink.process(&event, Some(unsafe { &mut *cpu_context }));
}

pub(crate) extern "sysv64" fn emit_block_event(
    ctx: *mut ExecCtx,
    block: *mut ExecBlock,
    cpu_context: *mut CpuContext,
) {
    let ctx = unsafe { &*ctx };
    let block = unsafe { &*block };
    let event = Event::Block {
        start: block.real_start as usize,
        end: block.real_start as usize + block.real_size as usize,
    };
    unsafe { (*cpu_context).rip = block.real_start as u64 };
    ctx.sink.process(&event, Some(unsafe { &mut *cpu_context }));
}

/// Polled at every interruptible event site.
pub(crate) extern "sysv64" fn maybe_unfollow_shim(ctx: *mut ExecCtx, resume_at: *mut u8) -> u64 {
    let ctx = unsafe { &*ctx };
    ctx.maybe_unfollow(Some(resume_at)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Stride;
    use crate::virtualmem::tests::TestingPages;

    #[test]
    fn exec_frame_layout_matches_emitted_offsets() {
        assert_eq!(std::mem::size_of::<ExecFrame>(), 16);
        assert_eq!(std::mem::offset_of!(ExecFrame, real_address), 0);
        assert_eq!(std::mem::offset_of!(ExecFrame, code_address), 8);
    }

    #[test]
    fn run_state_progresses_monotonically() {
        let engine = Stride::for_tests(Box::new(TestingPages::new_rwx()), 2);
        let ctx = engine.inner().create_exec_ctx(crate::os::current_thread_id(), None, None);
        let ctx_ref = unsafe { &*ctx };

        assert!(ctx_ref.is_active());
        assert!(ctx_ref.try_begin_unfollow());
        assert_eq!(ctx_ref.state(), RunState::UnfollowPending);
        // Only one transition out of Active wins
        assert!(!ctx_ref.try_begin_unfollow());

        // Unfollow is deferred while engine excursions are outstanding
        ctx_ref.begin_pending_call();
        assert!(!ctx_ref.maybe_unfollow(None));
        ctx_ref.end_pending_call();
        assert!(ctx_ref.maybe_unfollow(None));
        assert_eq!(ctx_ref.state(), RunState::DestroyPending);
        assert!(ctx_ref.destroy_pending_since().is_some());

        engine.inner().destroy_exec_ctx(ctx);
    }

    #[test]
    fn contains_covers_translated_code_only() {
        let engine = Stride::for_tests(Box::new(TestingPages::new_rwx()), 2);
        let ctx = engine.inner().create_exec_ctx(crate::os::current_thread_id(), None, None);
        let ctx_ref = unsafe { &*ctx };

        let guest = [0x90u8, 0xc3]; // nop; ret
        let (_block, code_address) = ctx_ref.obtain_block_for(guest.as_ptr() as *mut u8);

        assert!(ctx_ref.contains(code_address));
        assert!(!ctx_ref.contains(guest.as_ptr()));

        engine.inner().destroy_exec_ctx(ctx);
    }

    #[test]
    fn shadow_stack_starts_empty_at_first_frame() {
        let engine = Stride::for_tests(Box::new(TestingPages::new_rwx()), 2);
        let ctx = engine.inner().create_exec_ctx(crate::os::current_thread_id(), None, None);
        let ctx_ref = unsafe { &*ctx };

        assert_eq!(ctx_ref.current_frame(), ctx_ref.first_frame());
        assert_eq!(ctx_ref.depth(), 0);

        engine.inner().destroy_exec_ctx(ctx);
    }
}
