//! After a slow-path dispatch resolves a target, the originating site is
//! rewritten so the next traversal of that edge stays inside translated
//! code: direct sites get a straight jump, indirect sites get an
//! inline-cache entry. Every applied backpatch is also reported to the
//! observer as a descriptor that can be replayed into a fresh engine.

use crate::asm::x86_64::*;
use crate::block::{ExecBlock, IcEntry};
use crate::exec_ctx::ExecCtx;
use crate::helpers::{write_epilog, PrologKind};
use crate::virtualmem::{freeze, thaw};

/// Opaque, replayable description of one applied backpatch. The layout is
/// an engine-versioned blob; observers should treat it as bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backpatch {
    /// Guest start of the block the edge leads to.
    pub(crate) to: usize,
    /// Guest start of the block holding the patched site.
    pub(crate) from: usize,
    pub(crate) kind: BackpatchKind,
}

#[repr(C, u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BackpatchKind {
    Call { code_offset: u32, opened_prolog: u32, ret_real_address: usize, ret_code_offset: u32 },
    Ret { code_offset: u32 },
    Jmp { code_offset: u32, opened_prolog: u32 },
    InlineCache { ic_offset: u32 },
}

impl PrologKind {
    pub(crate) fn from_u32(value: u32) -> PrologKind {
        match value {
            0 => PrologKind::None,
            1 => PrologKind::Ic,
            2 => PrologKind::Minimal,
            3 => PrologKind::Full,
            _ => unreachable!("corrupt prolog kind"),
        }
    }
}

fn may_now_backpatch(ctx: &ExecCtx, target_block: &ExecBlock) -> bool {
    if !ctx.is_active() {
        return false;
    }
    if target_block.is_activation_target() {
        return false;
    }
    if target_block.recycle_count < ctx.engine().trust_threshold() {
        return false;
    }
    true
}

fn notify(ctx: &ExecCtx, descriptor: Backpatch) {
    if let Some(observer) = ctx.observer() {
        observer.notify_backpatch(&descriptor);
    }
}

/// Rewrite a direct-call site with the shadow push and a straight jump to
/// the already-resolved block.
pub(crate) extern "sysv64" fn backpatch_call(
    block: *mut ExecBlock,
    from: *mut ExecBlock,
    code_offset: u64,
    opened_prolog: u64,
    ret_real_address: u64,
    ret_code_offset: u64,
) {
    // A null target means the thread just got unfollowed mid-dispatch
    if block.is_null() {
        return;
    }
    let block = unsafe { &mut *block };
    let from = unsafe { &*from };
    let ctx = unsafe { &*block.ctx };

    if !may_now_backpatch(ctx, block) {
        return;
    }

    let opened_prolog = PrologKind::from_u32(opened_prolog as u32);
    let code_start = unsafe { from.code_start.add(code_offset as usize) };
    let ret_code_address = unsafe { from.code_start.add(ret_code_offset as usize) };
    let code_max_size = ret_code_address as usize - code_start as usize;

    ctx.code_lock().with(|| {
        let engine = ctx.engine();
        thaw(engine.pages(), code_start, code_max_size);

        let cw = ctx.writer();
        cw.reset(code_start, code_max_size);

        if opened_prolog == PrologKind::None {
            pushfq(cw);
            push(cw, RAX);
            push(cw, RCX);
            push(cw, RDX);
        }

        movabs(cw, RCX, ret_real_address);
        movabs(cw, RDX, ret_code_address as u64);
        call_abs(cw, ctx.helpers().stack_push as u64);

        if opened_prolog == PrologKind::None {
            pop(cw, RDX);
            pop(cw, RCX);
            pop(cw, RAX);
            popfq(cw);
        } else {
            write_epilog(ctx, opened_prolog, cw);
        }

        push(cw, RAX);
        movabs(cw, RAX, ret_real_address);
        xchg(cw, mem_opnd(64, RSP, 0), RAX);

        jmp_abs(cw, block.code_start as u64);

        cw.flush().expect("failed to resolve labels");
        assert!(cw.offset() <= code_max_size);
        freeze(engine.pages(), code_start, code_max_size);
    });

    notify(
        ctx,
        Backpatch {
            to: block.real_start as usize,
            from: from.real_start as usize,
            kind: BackpatchKind::Call {
                code_offset: code_offset as u32,
                opened_prolog: opened_prolog as u32,
                ret_real_address: ret_real_address as usize,
                ret_code_offset: ret_code_offset as u32,
            },
        },
    );
}

pub(crate) extern "sysv64" fn backpatch_jmp(
    block: *mut ExecBlock,
    from: *mut ExecBlock,
    code_offset: u64,
    opened_prolog: u64,
) {
    if block.is_null() {
        return;
    }
    let block = unsafe { &mut *block };
    let from = unsafe { &*from };
    let ctx = unsafe { &*block.ctx };

    if !may_now_backpatch(ctx, block) {
        return;
    }

    let opened_prolog = PrologKind::from_u32(opened_prolog as u32);
    let code_start = unsafe { from.code_start.add(code_offset as usize) };
    const CODE_MAX_SIZE: usize = 128;

    ctx.code_lock().with(|| {
        let engine = ctx.engine();
        thaw(engine.pages(), code_start, CODE_MAX_SIZE);

        let cw = ctx.writer();
        cw.reset(code_start, CODE_MAX_SIZE);

        if opened_prolog != PrologKind::None {
            write_epilog(ctx, opened_prolog, cw);
        }

        jmp_abs(cw, block.code_start as u64);

        cw.flush().expect("failed to resolve labels");
        freeze(engine.pages(), code_start, CODE_MAX_SIZE);
    });

    notify(
        ctx,
        Backpatch {
            to: block.real_start as usize,
            from: from.real_start as usize,
            kind: BackpatchKind::Jmp {
                code_offset: code_offset as u32,
                opened_prolog: opened_prolog as u32,
            },
        },
    );
}

/// Rewrite the landing site of a call's return once the block after the
/// call is known.
pub(crate) extern "sysv64" fn backpatch_ret(block: *mut ExecBlock, from: *mut ExecBlock, code_offset: u64) {
    if block.is_null() {
        return;
    }
    let block = unsafe { &mut *block };
    let from = unsafe { &*from };
    let ctx = unsafe { &*block.ctx };

    if !may_now_backpatch(ctx, block) {
        return;
    }

    let code_start = unsafe { from.code_start.add(code_offset as usize) };
    const CODE_MAX_SIZE: usize = 128;

    ctx.code_lock().with(|| {
        let engine = ctx.engine();
        thaw(engine.pages(), code_start, CODE_MAX_SIZE);

        let cw = ctx.writer();
        cw.reset(code_start, CODE_MAX_SIZE);

        jmp_abs(cw, block.code_start as u64);

        cw.flush().expect("failed to resolve labels");
        assert!(cw.offset() <= CODE_MAX_SIZE);
        freeze(engine.pages(), code_start, CODE_MAX_SIZE);
    });

    notify(
        ctx,
        Backpatch {
            to: block.real_start as usize,
            from: from.real_start as usize,
            kind: BackpatchKind::Ret { code_offset: code_offset as u32 },
        },
    );
}

/// Claim the first empty slot of the inline cache embedded at the
/// originating indirect site. A populated entry is never rewritten; a full
/// cache stays full until the block is invalidated wholesale.
pub(crate) extern "sysv64" fn backpatch_inline_cache(block: *mut ExecBlock, from: *mut ExecBlock, ic_offset: u64) {
    if block.is_null() {
        return;
    }
    let block = unsafe { &mut *block };
    let from = unsafe { &*from };
    let ctx = unsafe { &*block.ctx };

    if !may_now_backpatch(ctx, block) {
        return;
    }

    let engine = ctx.engine();
    let ic_entries = unsafe { from.code_start.add(ic_offset as usize) } as *mut IcEntry;

    for index in 0..engine.ic_entries() as usize {
        let entry = unsafe { &mut *ic_entries.add(index) };

        if entry.real_start == block.real_start {
            return;
        }
        if !entry.real_start.is_null() {
            continue;
        }

        ctx.code_lock().with(|| {
            thaw(engine.pages(), entry as *const IcEntry as *const u8, std::mem::size_of::<IcEntry>());

            entry.real_start = block.real_start;
            entry.code_start = block.code_start;

            freeze(engine.pages(), entry as *const IcEntry as *const u8, std::mem::size_of::<IcEntry>());
        });

        notify(
            ctx,
            Backpatch {
                to: block.real_start as usize,
                from: from.real_start as usize,
                kind: BackpatchKind::InlineCache { ic_offset: ic_offset as u32 },
            },
        );

        return;
    }
}

/// Replay a captured descriptor against freshly-obtained blocks; used by
/// [crate::Stride::prefetch_backpatch].
pub(crate) fn apply(block: *mut ExecBlock, from: *mut ExecBlock, descriptor: &Backpatch) {
    match descriptor.kind {
        BackpatchKind::Call { code_offset, opened_prolog, ret_real_address, ret_code_offset } => {
            backpatch_call(
                block,
                from,
                code_offset as u64,
                opened_prolog as u64,
                ret_real_address as u64,
                ret_code_offset as u64,
            );
        }
        BackpatchKind::Ret { code_offset } => backpatch_ret(block, from, code_offset as u64),
        BackpatchKind::Jmp { code_offset, opened_prolog } => {
            backpatch_jmp(block, from, code_offset as u64, opened_prolog as u64);
        }
        BackpatchKind::InlineCache { ic_offset } => {
            backpatch_inline_cache(block, from, ic_offset as u64);
        }
    }
}

impl Backpatch {
    /// Guest addresses of the edge this descriptor re-establishes.
    pub fn edge(&self) -> (usize, usize) {
        (self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::IC_MAGIC_EMPTY;
    use crate::engine::Stride;
    use crate::exec_ctx::ExecCtx;
    use crate::virtualmem::tests::TestingPages;

    fn engine_with_ctx() -> (Stride, *mut ExecCtx) {
        let engine = Stride::for_tests(Box::new(TestingPages::new_rwx()), 4);
        let ctx = engine.inner().create_exec_ctx(crate::os::current_thread_id(), None, None);
        (engine, ctx)
    }

    /// Locate the inline cache embedded in a translated block by its empty
    /// markers.
    fn find_ic_offset(block: *mut ExecBlock) -> u64 {
        let block = unsafe { &*block };
        let code = unsafe {
            std::slice::from_raw_parts(block.code_start, block.code_size as usize)
        };
        let marker = IC_MAGIC_EMPTY.to_le_bytes();
        let marker_at = code
            .windows(8)
            .position(|w| w == marker)
            .expect("block has no inline cache");
        // The first marker sits one pointer after the start of the array
        (marker_at - std::mem::size_of::<*mut u8>()) as u64
    }

    fn ic_entries_of(block: *mut ExecBlock, ic_offset: u64, count: usize) -> Vec<IcEntry> {
        let base = unsafe { (*block).code_start.add(ic_offset as usize) } as *const IcEntry;
        (0..count).map(|i| unsafe { *base.add(i) }).collect()
    }

    #[test]
    fn inline_cache_population_is_monotonic() {
        let (engine, ctx) = engine_with_ctx();
        let ctx_ref = unsafe { &*ctx };
        engine.set_trust_threshold(0); // recycle_count 0 passes the gate

        // Indirect call through a register, then distinct target blocks
        let from_guest = [0xffu8, 0xd0, 0xc3]; // call rax; ret
        let target_a = [0x90u8, 0xc3];
        let target_b = [0xc3u8];

        let (from, _) = ctx_ref.obtain_block_for(from_guest.as_ptr() as *mut u8);
        let (to_a, _) = ctx_ref.obtain_block_for(target_a.as_ptr() as *mut u8);
        let (to_b, _) = ctx_ref.obtain_block_for(target_b.as_ptr() as *mut u8);

        let ic_offset = find_ic_offset(from);

        backpatch_inline_cache(to_a, from, ic_offset);
        let entries = ic_entries_of(from, ic_offset, 4);
        assert_eq!(entries[0].real_start, unsafe { (*to_a).real_start });
        assert_eq!(entries[0].code_start, unsafe { (*to_a).code_start });
        assert!(entries[1].real_start.is_null());

        // Same target again: no duplicate entry
        backpatch_inline_cache(to_a, from, ic_offset);
        let entries = ic_entries_of(from, ic_offset, 4);
        assert!(entries[1].real_start.is_null());

        // A second target claims the next slot; the first is untouched
        backpatch_inline_cache(to_b, from, ic_offset);
        let entries = ic_entries_of(from, ic_offset, 4);
        assert_eq!(entries[0].real_start, unsafe { (*to_a).real_start });
        assert_eq!(entries[1].real_start, unsafe { (*to_b).real_start });

        engine.inner().destroy_exec_ctx(ctx);
    }

    #[test]
    fn backpatch_respects_preconditions() {
        let (engine, ctx) = engine_with_ctx();
        let ctx_ref = unsafe { &*ctx };

        let from_guest = [0xffu8, 0xd0, 0xc3];
        let target = [0x90u8, 0xc3];
        let (from, _) = ctx_ref.obtain_block_for(from_guest.as_ptr() as *mut u8);
        let (to, _) = ctx_ref.obtain_block_for(target.as_ptr() as *mut u8);
        let ic_offset = find_ic_offset(from);

        // Below the trust threshold: refused
        engine.set_trust_threshold(10);
        backpatch_inline_cache(to, from, ic_offset);
        assert!(ic_entries_of(from, ic_offset, 1)[0].real_start.is_null());

        // Activation target: refused even once trusted
        engine.set_trust_threshold(0);
        unsafe { (*to).flags |= crate::block::BLOCK_FLAG_ACTIVATION_TARGET };
        backpatch_inline_cache(to, from, ic_offset);
        assert!(ic_entries_of(from, ic_offset, 1)[0].real_start.is_null());

        // Inactive context: refused
        unsafe { (*to).flags = 0 };
        ctx_ref.set_state(crate::exec_ctx::RunState::UnfollowPending);
        backpatch_inline_cache(to, from, ic_offset);
        assert!(ic_entries_of(from, ic_offset, 1)[0].real_start.is_null());

        // All preconditions met: applied
        ctx_ref.set_state(crate::exec_ctx::RunState::Active);
        backpatch_inline_cache(to, from, ic_offset);
        assert_eq!(ic_entries_of(from, ic_offset, 1)[0].real_start, unsafe {
            (*to).real_start
        });

        // A just-unfollowed dispatch hands in a null target block
        backpatch_inline_cache(std::ptr::null_mut(), from, ic_offset);

        engine.inner().destroy_exec_ctx(ctx);
    }

    #[test]
    fn descriptors_roundtrip_through_the_observer_shape() {
        let descriptor = Backpatch {
            to: 0x5000,
            from: 0x6000,
            kind: BackpatchKind::InlineCache { ic_offset: 0x40 },
        };
        assert_eq!(descriptor.edge(), (0x6000, 0x5000));

        let call = Backpatch {
            to: 0x5000,
            from: 0x6000,
            kind: BackpatchKind::Call {
                code_offset: 0x10,
                opened_prolog: PrologKind::None as u32,
                ret_real_address: 0x7000,
                ret_code_offset: 0x90,
            },
        };
        assert_ne!(call, descriptor);
    }
}
