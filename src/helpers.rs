//! Context save/restore helpers and the other per-slab emitted routines.
//!
//! Each code slab gets at most one copy of every helper; blocks invoke them
//! with `call rel32`, which is why helpers are re-emitted into a fresh slab
//! whenever the current copies fall out of displacement range. A prolog
//! helper returns by jumping through its caller's return slot so the saved
//! frame stays intact beneath the engine code that follows it.

use std::mem::{offset_of, size_of};

use crate::asm::x86_64::*;
use crate::asm::CodeWriter;
use crate::cpu::CpuContext;
use crate::exec_ctx::ExecCtx;
use crate::virtualmem::{freeze, thaw};

/// System V red zone: leaf code may live below the app stack pointer, so
/// every excursion starts by skipping it.
pub(crate) const RED_ZONE_SIZE: i32 = 128;

/// Offset from the minimal-prolog frame base to the caller's return slot:
/// eleven saved qwords (ten GPRs and the flags).
pub(crate) const MINIMAL_PROLOG_RETURN_OFFSET: i32 = 11 * 8;

/// Offset from the full-prolog frame base (a [CpuContext]) to the caller's
/// return slot: the context plus the flags qword.
pub(crate) const FULL_PROLOG_RETURN_OFFSET: i32 = (size_of::<CpuContext>() + 8) as i32;

/// How much architectural state an excursion saves. Ordered so that an
/// already-open prolog satisfies any request for a weaker one.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PrologKind {
    None = 0,
    /// Flags, rax, rbx. Just enough for the inline-cache scan.
    Ic = 1,
    /// Flags, caller-saved GPRs, FP/SSE, upper YMM halves.
    Minimal = 2,
    /// Everything: a full [CpuContext] for user-visible callbacks.
    Full = 3,
}

/// Addresses of the helpers last emitted for the active code slab.
#[derive(Copy, Clone)]
pub(crate) struct HelperSet {
    pub prolog_minimal: *mut u8,
    pub epilog_minimal: *mut u8,
    pub prolog_full: *mut u8,
    pub epilog_full: *mut u8,
    pub stack_push: *mut u8,
    pub stack_pop_and_go: *mut u8,
    pub invalidator: *mut u8,
}

impl HelperSet {
    pub fn empty() -> Self {
        HelperSet {
            prolog_minimal: std::ptr::null_mut(),
            epilog_minimal: std::ptr::null_mut(),
            prolog_full: std::ptr::null_mut(),
            epilog_full: std::ptr::null_mut(),
            stack_push: std::ptr::null_mut(),
            stack_pop_and_go: std::ptr::null_mut(),
            invalidator: std::ptr::null_mut(),
        }
    }
}

/// Open an excursion from translated code into engine code.
pub(crate) fn write_prolog(ctx: &ExecCtx, kind: PrologKind, cw: &mut CodeWriter) {
    match kind {
        PrologKind::Minimal | PrologKind::Full => {
            let helper = if kind == PrologKind::Minimal {
                ctx.helpers().prolog_minimal
            } else {
                ctx.helpers().prolog_full
            };
            lea(cw, RSP, mem_opnd(64, RSP, -RED_ZONE_SIZE));
            call_abs(cw, helper as u64);
        }
        PrologKind::Ic => {
            lea(cw, RSP, mem_opnd(64, RSP, -RED_ZONE_SIZE));
            pushfq(cw);
            push(cw, RAX);
            push(cw, RBX);
            mov(cw, RBX, RSP);

            lea(cw, RAX, mem_opnd(64, RSP, 3 * 8 + RED_ZONE_SIZE));
            mov(cw, ip_rel(ctx.addr_of_app_stack()), RAX);
        }
        PrologKind::None => unreachable!(),
    }
}

/// Close the excursion opened by the matching [write_prolog].
pub(crate) fn write_epilog(ctx: &ExecCtx, kind: PrologKind, cw: &mut CodeWriter) {
    match kind {
        PrologKind::Minimal | PrologKind::Full => {
            let helper = if kind == PrologKind::Minimal {
                ctx.helpers().epilog_minimal
            } else {
                ctx.helpers().epilog_full
            };
            call_abs(cw, helper as u64);
            mov(cw, RSP, ip_rel(ctx.addr_of_app_stack()));
        }
        PrologKind::Ic => {
            pop(cw, RBX);
            pop(cw, RAX);
            popfq(cw);
            mov(cw, RSP, ip_rel(ctx.addr_of_app_stack()));
        }
        PrologKind::None => unreachable!(),
    }
}

const FXSAVE: [u8; 4] = [0x0f, 0xae, 0x04, 0x24]; // fxsave [rsp]
const FXRSTOR: [u8; 4] = [0x0f, 0xae, 0x0c, 0x24]; // fxrstor [rsp]

/// vextracti128 ymm0..ymm15, [rsp+0x0]..[rsp+0xF0], 1
const UPPER_YMM_SAVER: [u8; 151] = [
    0xc4, 0xe3, 0x7d, 0x39, 0x04, 0x24, 0x01,
    0xc4, 0xe3, 0x7d, 0x39, 0x4c, 0x24, 0x10, 0x01,
    0xc4, 0xe3, 0x7d, 0x39, 0x54, 0x24, 0x20, 0x01,
    0xc4, 0xe3, 0x7d, 0x39, 0x5c, 0x24, 0x30, 0x01,
    0xc4, 0xe3, 0x7d, 0x39, 0x64, 0x24, 0x40, 0x01,
    0xc4, 0xe3, 0x7d, 0x39, 0x6c, 0x24, 0x50, 0x01,
    0xc4, 0xe3, 0x7d, 0x39, 0x74, 0x24, 0x60, 0x01,
    0xc4, 0xe3, 0x7d, 0x39, 0x7c, 0x24, 0x70, 0x01,
    0xc4, 0x63, 0x7d, 0x39, 0x84, 0x24, 0x80, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x7d, 0x39, 0x8c, 0x24, 0x90, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x7d, 0x39, 0x94, 0x24, 0xa0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x7d, 0x39, 0x9c, 0x24, 0xb0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x7d, 0x39, 0xa4, 0x24, 0xc0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x7d, 0x39, 0xac, 0x24, 0xd0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x7d, 0x39, 0xb4, 0x24, 0xe0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x7d, 0x39, 0xbc, 0x24, 0xf0, 0x00, 0x00, 0x00, 0x01,
];

/// vinserti128 ymm0..ymm15, ymm0..ymm15, [rsp+0x0]..[rsp+0xF0], 1
const UPPER_YMM_RESTORER: [u8; 151] = [
    0xc4, 0xe3, 0x7d, 0x38, 0x04, 0x24, 0x01,
    0xc4, 0xe3, 0x75, 0x38, 0x4c, 0x24, 0x10, 0x01,
    0xc4, 0xe3, 0x6d, 0x38, 0x54, 0x24, 0x20, 0x01,
    0xc4, 0xe3, 0x65, 0x38, 0x5c, 0x24, 0x30, 0x01,
    0xc4, 0xe3, 0x5d, 0x38, 0x64, 0x24, 0x40, 0x01,
    0xc4, 0xe3, 0x55, 0x38, 0x6c, 0x24, 0x50, 0x01,
    0xc4, 0xe3, 0x4d, 0x38, 0x74, 0x24, 0x60, 0x01,
    0xc4, 0xe3, 0x45, 0x38, 0x7c, 0x24, 0x70, 0x01,
    0xc4, 0x63, 0x3d, 0x38, 0x84, 0x24, 0x80, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x35, 0x38, 0x8c, 0x24, 0x90, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x2d, 0x38, 0x94, 0x24, 0xa0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x25, 0x38, 0x9c, 0x24, 0xb0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x1d, 0x38, 0xa4, 0x24, 0xc0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x15, 0x38, 0xac, 0x24, 0xd0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x0d, 0x38, 0xb4, 0x24, 0xe0, 0x00, 0x00, 0x00, 0x01,
    0xc4, 0x63, 0x05, 0x38, 0xbc, 0x24, 0xf0, 0x00, 0x00, 0x00, 0x01,
];

fn write_prolog_helper(ctx: &ExecCtx, kind: PrologKind, cw: &mut CodeWriter) {
    pushfq(cw);
    cld(cw); // C ABI mandates a cleared direction flag

    if kind == PrologKind::Minimal {
        push(cw, RAX);

        // App stack pointer: above the return slot, the flags, rax and the
        // red zone the call site skipped.
        lea(cw, RAX, mem_opnd(64, RSP, 3 * 8 + RED_ZONE_SIZE));
        mov(cw, ip_rel(ctx.addr_of_app_stack()), RAX);

        push(cw, RCX);
        push(cw, RDX);
        push(cw, RBX);
        push(cw, RSI);
        push(cw, RDI);
        push(cw, R8);
        push(cw, R9);
        push(cw, R10);
        push(cw, R11);
    } else {
        // Lay down a full CpuContext, highest field first. The rsp slot is
        // a placeholder, overwritten with the app stack pointer below; the
        // rip slot is filled in by whoever reports the context.
        push(cw, RAX);
        push(cw, RCX);
        push(cw, RDX);
        push(cw, RBX);
        push(cw, RAX); // rsp slot
        push(cw, RBP);
        push(cw, RSI);
        push(cw, RDI);
        push(cw, R8);
        push(cw, R9);
        push(cw, R10);
        push(cw, R11);
        push(cw, R12);
        push(cw, R13);
        push(cw, R14);
        push(cw, R15);
        lea(cw, RSP, mem_opnd(64, RSP, -8)); // rip slot

        lea(cw, RAX, mem_opnd(64, RSP, size_of::<CpuContext>() as i32 + 2 * 8 + RED_ZONE_SIZE));
        mov(cw, ip_rel(ctx.addr_of_app_stack()), RAX);
        mov(cw, mem_opnd(64, RSP, offset_of!(CpuContext, rsp) as i32), RAX);
    }

    mov(cw, RBX, RSP);
    and(cw, RSP, imm_opnd(-16));
    sub(cw, RSP, imm_opnd(512));
    cw.put_bytes(&FXSAVE);

    if ctx.engine().cpu_features().avx2 {
        sub(cw, RSP, imm_opnd(0x100));
        cw.put_bytes(&UPPER_YMM_SAVER);
    }

    // Jump to our caller but leave its return slot in the frame
    let return_offset = if kind == PrologKind::Minimal {
        MINIMAL_PROLOG_RETURN_OFFSET
    } else {
        FULL_PROLOG_RETURN_OFFSET
    };
    jmp_rm(cw, mem_opnd(64, RBX, return_offset));
}

fn write_epilog_helper(ctx: &ExecCtx, kind: PrologKind, cw: &mut CodeWriter) {
    let return_offset = if kind == PrologKind::Minimal {
        MINIMAL_PROLOG_RETURN_OFFSET
    } else {
        FULL_PROLOG_RETURN_OFFSET
    };

    // Store our caller in the return slot created by the prolog, so the
    // final ret lands right after the epilog call site.
    pop(cw, RAX);
    mov(cw, mem_opnd(64, RBX, return_offset), RAX);

    if ctx.engine().cpu_features().avx2 {
        cw.put_bytes(&UPPER_YMM_RESTORER);
        add(cw, RSP, imm_opnd(0x100));
    }

    cw.put_bytes(&FXRSTOR);
    mov(cw, RSP, RBX);

    if kind == PrologKind::Minimal {
        pop(cw, R11);
        pop(cw, R10);
        pop(cw, R9);
        pop(cw, R8);
        pop(cw, RDI);
        pop(cw, RSI);
        pop(cw, RBX);
        pop(cw, RDX);
        pop(cw, RCX);
        pop(cw, RAX);
    } else {
        pop(cw, RAX); // discard the rip slot
        pop(cw, R15);
        pop(cw, R14);
        pop(cw, R13);
        pop(cw, R12);
        pop(cw, R11);
        pop(cw, R10);
        pop(cw, R9);
        pop(cw, R8);
        pop(cw, RDI);
        pop(cw, RSI);
        pop(cw, RBP);
        lea(cw, RSP, mem_opnd(64, RSP, 8)); // skip the rsp slot
        pop(cw, RBX);
        pop(cw, RDX);
        pop(cw, RCX);
        pop(cw, RAX);
    }

    popfq(cw);
    ret(cw);
}

/// Push a `(real, code)` return pair onto the shadow frame stack.
/// Inputs: rcx = real return address, rdx = translated return address.
/// Clobbers rcx. An exhausted frame page makes this a no-op; the ret fast
/// path then simply misses.
fn write_stack_push_helper(ctx: &ExecCtx, cw: &mut CodeWriter) {
    let skip_stack_push = cw.new_label();
    let frame_size = size_of::<crate::exec_ctx::ExecFrame>() as i64;

    movabs(cw, RAX, ctx.addr_of_current_frame());
    push(cw, RAX);

    mov(cw, RAX, mem_opnd(64, RAX, 0));
    test(cw, RAX, uimm_opnd(ctx.engine().page_size() as u64 - 1));
    jcc_short_label(cw, Cc::E, skip_stack_push);

    sub(cw, RAX, imm_opnd(frame_size));

    mov(cw, mem_opnd(64, RAX, 0), RCX);
    mov(
        cw,
        mem_opnd(64, RAX, offset_of!(crate::exec_ctx::ExecFrame, code_address) as i32),
        RDX,
    );

    pop(cw, RCX);
    mov(cw, mem_opnd(64, RCX, 0), RAX);
    ret(cw);

    cw.put_label(skip_stack_push);
    pop(cw, RAX);
    ret(cw);
}

/// The three-tier return dispatcher. Input: rcx = guest address of the ret
/// instruction, pushed rcx on the stack beneath a skipped red zone.
fn write_stack_pop_and_go_helper(ctx: &ExecCtx, cw: &mut CodeWriter) {
    let resolve_dynamically = cw.new_label();
    let check_slab = cw.new_label();
    let next_slab = cw.new_label();
    let return_at = ctx.addr_of_return_at();
    let frame_size = size_of::<crate::exec_ctx::ExecFrame>() as i64;
    let code_offset = offset_of!(crate::exec_ctx::ExecFrame, code_address) as i32;

    // Tier 1: try the shadow stack
    let mut stack_delta = RED_ZONE_SIZE + 8;
    pushfq(cw);
    push(cw, RAX);
    stack_delta += 2 * 8;

    // Stash the guest ret so every exit can run it natively once the
    // return slot has been rewritten.
    mov(cw, ip_rel(return_at), RCX);

    movabs(cw, RAX, ctx.addr_of_current_frame());
    push(cw, RAX);
    stack_delta += 8;
    mov(cw, RAX, mem_opnd(64, RAX, 0));

    mov(cw, RCX, mem_opnd(64, RAX, 0));
    cmp(cw, mem_opnd(64, RSP, stack_delta), RCX);
    jcc_short_label(cw, Cc::NE, resolve_dynamically);

    // Hit: swap the translated return address onto the app stack
    mov(cw, RCX, mem_opnd(64, RAX, code_offset));
    mov(cw, mem_opnd(64, RSP, stack_delta), RCX);

    // Pop our frame
    add(cw, RAX, imm_opnd(frame_size));
    pop(cw, RCX);
    mov(cw, mem_opnd(64, RCX, 0), RAX);

    // Proceed to the block through the guest's own ret
    pop(cw, RAX);
    popfq(cw);
    pop(cw, RCX);
    lea(cw, RSP, mem_opnd(64, RSP, RED_ZONE_SIZE));
    jmp_riprel(cw, return_at);

    cw.put_label(resolve_dynamically);

    // Clear the shadow stack so it can resync later
    movabs(cw, RCX, ctx.first_frame() as u64);
    pop(cw, RAX);
    mov(cw, mem_opnd(64, RAX, 0), RCX);

    pop(cw, RAX);
    popfq(cw);
    pop(cw, RCX);
    lea(cw, RSP, mem_opnd(64, RSP, RED_ZONE_SIZE));

    // Tier 2: the target may already be translated code
    push(cw, RAX);
    push(cw, RCX);
    push(cw, RDX);
    let stack_delta = 3 * 8;

    let edx = X86Opnd::Reg(X86Reg { num_bits: 32, reg_no: 2 });

    movabs(cw, RAX, ctx.addr_of_code_slab_head());
    mov(cw, RAX, mem_opnd(64, RAX, 0));

    cw.put_label(check_slab);
    mov(cw, RCX, mem_opnd(64, RAX, crate::slab::SLAB_DATA_OFFSET));
    cmp(cw, mem_opnd(64, RSP, stack_delta), RCX);
    jcc_short_label(cw, Cc::LE, next_slab);

    mov(cw, edx, mem_opnd(32, RAX, crate::slab::SLAB_OFFSET_OFFSET));
    add(cw, RCX, RDX);
    cmp(cw, mem_opnd(64, RSP, stack_delta), RCX);
    jcc_short_label(cw, Cc::GE, next_slab);

    // Inside a slab: the return slot already holds translated code
    pop(cw, RDX);
    pop(cw, RCX);
    pop(cw, RAX);
    jmp_riprel(cw, return_at);

    cw.put_label(next_slab);
    mov(cw, RAX, mem_opnd(64, RAX, crate::slab::SLAB_NEXT_OFFSET));
    test(cw, RAX, RAX);
    jcc_short_label(cw, Cc::NE, check_slab);

    pop(cw, RDX);
    pop(cw, RCX);
    pop(cw, RAX);

    // Tier 3: resolve through the dispatcher
    write_prolog(ctx, PrologKind::Minimal, cw);

    mov(cw, RAX, ip_rel(ctx.addr_of_app_stack()));
    mov(cw, RSI, mem_opnd(64, RAX, 0));
    movabs(cw, RDI, ctx as *const ExecCtx as u64);
    movabs(cw, RAX, crate::exec_ctx::entry_gate_ret_slow_path as usize as u64);
    call(cw, RAX);

    mov(cw, RCX, ip_rel(ctx.addr_of_app_stack()));
    mov(cw, mem_opnd(64, RCX, 0), RAX);

    write_epilog(ctx, PrologKind::Minimal, cw);

    jmp_riprel(cw, return_at);
}

/// Entered through the trampoline that block invalidation writes over a
/// block's first bytes. The trampoline's call pushed the address of a
/// distance word pointing back at the block record.
fn write_invalidator(ctx: &ExecCtx, cw: &mut CodeWriter) {
    xchg(cw, mem_opnd(64, RSP, 0), RDI);

    write_prolog(ctx, PrologKind::Minimal, cw);

    write_call_aligned(
        cw,
        crate::exec_ctx::recompile_and_switch_block as usize as u64,
        &[CallArg::Imm(ctx as *const ExecCtx as u64), CallArg::Reg(RDI)],
    );

    write_epilog(ctx, PrologKind::Minimal, cw);

    pop(cw, RDI);
    lea(cw, RSP, mem_opnd(64, RSP, RED_ZONE_SIZE));

    jmp_riprel(cw, ctx.addr_of_resume_at());
}

/// Argument to [write_call_aligned].
#[derive(Copy, Clone)]
pub(crate) enum CallArg {
    Imm(u64),
    Reg(X86Opnd),
}

/// Call a C-ABI function with the stack forced to the required 16-byte
/// alignment, whatever the current misalignment. Clobbers rax; the return
/// value is left in rax.
pub(crate) fn write_call_aligned(cw: &mut CodeWriter, func: u64, args: &[CallArg]) {
    // Register-sourced moves first so an argument register is never
    // clobbered before it is read.
    for (index, arg) in args.iter().enumerate() {
        if let CallArg::Reg(src) = arg {
            if *src != C_ARG_REGS[index] {
                debug_assert!(
                    !C_ARG_REGS[..index].contains(src),
                    "argument register read after being written"
                );
                mov(cw, C_ARG_REGS[index], *src);
            }
        }
    }
    for (index, arg) in args.iter().enumerate() {
        if let CallArg::Imm(value) = arg {
            movabs(cw, C_ARG_REGS[index], *value);
        }
    }

    // Both slots below hold the incoming rsp; [rsp+8] survives whichever
    // way the alignment rounds.
    push(cw, RSP);
    push(cw, mem_opnd(64, RSP, 0));
    and(cw, RSP, imm_opnd(-16));

    movabs(cw, RAX, func);
    call(cw, RAX);

    mov(cw, RSP, mem_opnd(64, RSP, 8));
}

type HelperWriter = fn(&ExecCtx, &mut CodeWriter);

/// (Re)emit any helper that the active code slab cannot reach with a
/// direct call, and park the invalidator address in the slab header.
pub(crate) fn ensure_helpers_reachable(ctx: &ExecCtx) {
    let helpers = ctx.helpers();

    ensure_helper_reachable(ctx, &mut helpers.prolog_minimal, |ctx, cw| {
        write_prolog_helper(ctx, PrologKind::Minimal, cw)
    });
    ensure_helper_reachable(ctx, &mut helpers.epilog_minimal, |ctx, cw| {
        write_epilog_helper(ctx, PrologKind::Minimal, cw)
    });
    ensure_helper_reachable(ctx, &mut helpers.prolog_full, |ctx, cw| {
        write_prolog_helper(ctx, PrologKind::Full, cw)
    });
    ensure_helper_reachable(ctx, &mut helpers.epilog_full, |ctx, cw| {
        write_epilog_helper(ctx, PrologKind::Full, cw)
    });
    ensure_helper_reachable(ctx, &mut helpers.stack_push, write_stack_push_helper);
    ensure_helper_reachable(ctx, &mut helpers.stack_pop_and_go, write_stack_pop_and_go_helper);
    ensure_helper_reachable(ctx, &mut helpers.invalidator, write_invalidator);

    let code_slab = ctx.code_slab_head();
    unsafe { (*code_slab).invalidator = helpers.invalidator };
}

fn ensure_helper_reachable(ctx: &ExecCtx, slot: &mut *mut u8, write: HelperWriter) {
    let slab = unsafe { &mut (*ctx.code_slab_head()).slab };

    if helper_is_reachable(*slot, slab) {
        return;
    }

    let engine = ctx.engine();
    let start = slab.cursor();
    let available = slab.available();
    thaw(engine.pages(), start, available);

    let cw = ctx.writer();
    cw.reset(start, available);
    *slot = cw.cur();

    write(ctx, cw);

    cw.flush().expect("failed to resolve labels");
    let len = cw.offset();
    freeze(engine.pages(), start, len);

    slab.reserve(len);
}

fn helper_is_reachable(helper: *mut u8, slab: &crate::slab::Slab) -> bool {
    if helper.is_null() {
        return false;
    }
    let helper = helper as u64;
    CodeWriter::can_branch_directly_between(slab.start() as u64, helper)
        && CodeWriter::can_branch_directly_between(slab.end() as u64, helper)
}
