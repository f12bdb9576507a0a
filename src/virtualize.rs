//! Control-flow virtualization: every guest control transfer is replaced
//! with a sequence that resolves the true target, transfers into translated
//! code, and keeps the hardware stack and the shadow frame stack coherent
//! with what the guest expects.

use std::mem::{offset_of, size_of};

use crate::asm::x86_64::*;
use crate::block::{ExecBlock, IcEntry, IC_ENTRY_CODE_OFFSET, IC_MAGIC_EMPTY, IC_MAGIC_SCRATCH};
use crate::compile::GeneratorContext;
use crate::cpu::CpuContext;
use crate::decoder::{BranchKind, InsnId, Segment};
use crate::exec_ctx::{self, EntryGate, ExecCtx};
use crate::helpers::{
    write_call_aligned, write_epilog, write_prolog, CallArg, PrologKind, RED_ZONE_SIZE,
};

/// What the caller must still do for the instruction after virtualization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Requirements {
    Nothing,
    /// Copy the instruction through the relocator.
    Relocate,
    /// Execute the instruction under the trap flag and re-enter.
    SingleStep,
}

/// Decoded operand of a control transfer plus the address the instruction
/// would have fallen through to, which stands in for rip when resolving
/// register-relative operands.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BranchTarget {
    pub origin_ip: u64,
    pub kind: BranchKind,
}

/// Where the register contents of the guest live while a prolog is open.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum GuestReg {
    Gpr(u8),
    Rip,
    None,
}

pub(crate) fn open_prolog(block: &ExecBlock, kind: PrologKind, gc: &mut GeneratorContext) {
    if gc.opened_prolog >= kind {
        return;
    }
    // Widening an already-open prolog is not supported
    assert_eq!(gc.opened_prolog, PrologKind::None);

    gc.opened_prolog = kind;
    gc.accumulated_stack_delta = 0;

    let ctx = unsafe { &*block.ctx };
    write_prolog(ctx, kind, gc.cw());
}

pub(crate) fn close_prolog(block: &ExecBlock, gc: &mut GeneratorContext) {
    if gc.opened_prolog == PrologKind::None {
        return;
    }

    let ctx = unsafe { &*block.ctx };
    write_epilog(ctx, gc.opened_prolog, gc.cw());

    gc.accumulated_stack_delta = 0;
    gc.opened_prolog = PrologKind::None;
}

/// Virtualize call/jmp/jcc/jcxz. The instruction is still pending in the
/// relocator on entry and consumed here.
pub(crate) fn virtualize_branch_insn(block: &mut ExecBlock, gc: &mut GeneratorContext) -> Requirements {
    let ctx = unsafe { &*block.ctx };
    let engine = ctx.engine();
    let insn = gc.instruction.unwrap();
    let target = BranchTarget { origin_ip: insn.end(), kind: insn.branch.unwrap() };

    match insn.id {
        InsnId::Call => {
            if ctx.sink_mask().contains(crate::events::EventMask::CALL) {
                write_call_event_code(block, &target, gc, Interruptible::Yes);
            }

            let excluded_target = match target.kind {
                BranchKind::Imm(addr) if ctx.activation_target().is_none() => {
                    engine.is_excluding(addr as usize).then_some(addr)
                }
                _ => None,
            };

            if excluded_target.is_some() {
                write_excluded_call_code(block, &insn, gc);
                return Requirements::Nothing;
            }

            gc.relocator().skip_one();
            write_call_invoke_code(block, &target, gc);
        }

        InsnId::Jcxz => {
            gc.relocator().skip_one();

            let cw = gc.cw();
            let is_true = cw.new_label();
            let is_false = cw.new_label();

            close_prolog(block, gc);

            let cw = gc.cw();
            jrcxz_label(cw, is_true);
            jmp_label(cw, is_false);

            gc.cw().put_label(is_true);
            write_jmp_transfer_code(block, &target, exec_ctx::entry_gate_jmp_cond_jcxz, gc);

            gc.cw().put_label(is_false);
            let false_target = BranchTarget { origin_ip: insn.end(), kind: BranchKind::Imm(insn.end()) };
            write_jmp_transfer_code(block, &false_target, exec_ctx::entry_gate_jmp_cond_jcxz, gc);
        }

        InsnId::Jmp | InsnId::Jcc(_) => {
            gc.relocator().skip_one();

            let condition = match insn.id {
                InsnId::Jcc(cc) => Some(cc),
                _ => None,
            };

            let is_false = gc.cw().new_label();
            if let Some(cc) = condition {
                debug_assert!(matches!(target.kind, BranchKind::Imm(_)));
                close_prolog(block, gc);
                jcc_label(gc.cw(), cc.negate(), is_false);
            }

            let (regular_gate, cond_gate): (EntryGate, EntryGate) = match target.kind {
                BranchKind::MemAbs { .. } | BranchKind::Mem { .. } => {
                    (exec_ctx::entry_gate_jmp_mem, exec_ctx::entry_gate_jmp_cond_mem)
                }
                BranchKind::Reg(_) => (exec_ctx::entry_gate_jmp_reg, exec_ctx::entry_gate_jmp_cond_reg),
                BranchKind::Imm(_) => (exec_ctx::entry_gate_jmp_imm, exec_ctx::entry_gate_jmp_cond_imm),
            };

            let gate = if condition.is_some() { cond_gate } else { regular_gate };
            write_jmp_transfer_code(block, &target, gate, gc);

            if condition.is_some() {
                let cond_target =
                    BranchTarget { origin_ip: insn.end(), kind: BranchKind::Imm(insn.end()) };
                gc.cw().put_label(is_false);
                write_jmp_transfer_code(block, &cond_target, cond_gate, gc);
            }
        }

        _ => unreachable!("not a branch instruction"),
    }

    Requirements::Nothing
}

pub(crate) fn virtualize_ret_insn(block: &mut ExecBlock, gc: &mut GeneratorContext) -> Requirements {
    if unsafe { &*block.ctx }.sink_mask().contains(crate::events::EventMask::RET) {
        write_ret_event_code(block, gc, Interruptible::Yes);
    }

    gc.relocator().skip_one();
    write_ret_transfer_code(block, gc);

    Requirements::Nothing
}

/// On x86-64 the kernel returns through the ordinary control flow, so the
/// instruction is simply relocated. (The in-kernel return-slot trampoline
/// is a 32-bit concern.)
pub(crate) fn virtualize_sysenter_insn(_block: &mut ExecBlock, _gc: &mut GeneratorContext) -> Requirements {
    Requirements::Relocate
}

/// A call into an excluded range runs natively. The call instruction is
/// copied so its pushed return address lands on the next translated
/// instruction; the pending-call counter keeps unfollow deferred until the
/// native code returns.
fn write_excluded_call_code(block: &mut ExecBlock, insn: &crate::decoder::Insn, gc: &mut GeneratorContext) {
    let ctx = unsafe { &*block.ctx };

    open_prolog(block, PrologKind::Ic, gc);
    let cw = gc.cw();
    movabs(cw, RAX, insn.end());
    mov(cw, ip_rel(ctx.addr_of_pending_return_location()), RAX);
    movabs(cw, RAX, ctx.addr_of_pending_calls());
    inc_mem32(cw, mem_opnd(32, RAX, 0));
    close_prolog(block, gc);

    gc.relocator().write_one(gc.cw());

    open_prolog(block, PrologKind::Minimal, gc);
    let cw = gc.cw();
    movabs(cw, RAX, ctx.addr_of_pending_calls());
    dec_mem32(cw, mem_opnd(32, RAX, 0));

    let next_instruction = BranchTarget { origin_ip: insn.end(), kind: BranchKind::Imm(insn.end()) };
    write_jmp_transfer_code(block, &next_instruction, exec_ctx::entry_gate_excluded_call_imm, gc);
}

/// The full call strategy: shadow-stack push, app-stack return address,
/// inline cache for dynamic targets, slow-path gate, and the backpatch
/// handshake once the gate has resolved.
fn write_call_invoke_code(block: &mut ExecBlock, target: &BranchTarget, gc: &mut GeneratorContext) {
    let ctx = unsafe { &*block.ctx };
    let engine = ctx.engine();
    let trust_threshold = engine.trust_threshold();
    let opened_prolog = gc.opened_prolog;
    let insn_end = gc.instruction.unwrap().end();

    let cw = gc.cw();
    let call_code_start = cw.pc();
    let push_application_retaddr = cw.new_label();
    let perform_stack_push = cw.new_label();
    let look_in_cache = cw.new_label();
    let loop_ = cw.new_label();
    let try_next = cw.new_label();
    let resolve_dynamically = cw.new_label();
    let beach = cw.new_label();

    let can_backpatch_statically =
        trust_threshold >= 0 && matches!(target.kind, BranchKind::Imm(_));

    let mut ic_entries_at: Option<u64> = None;

    if trust_threshold >= 0 && !can_backpatch_statically {
        if opened_prolog == PrologKind::None {
            open_prolog(block, PrologKind::Ic, gc);
            let cw = gc.cw();
            push(cw, RCX);
            push(cw, RDX);
        }

        let cw = gc.cw();
        call_label(cw, push_application_retaddr);
        gc.accumulated_stack_delta += 8;

        call_label(gc.cw(), perform_stack_push);

        if opened_prolog == PrologKind::None {
            let cw = gc.cw();
            pop(cw, RDX);
            pop(cw, RCX);
        } else {
            close_prolog(block, gc);
            open_prolog(block, PrologKind::Ic, gc);
            gc.accumulated_stack_delta += 8;
        }

        // The inline cache is larger than a short jump's reach
        jmp_label(gc.cw(), look_in_cache);

        let cw = gc.cw();
        let ic_start = cw.pc();
        ic_entries_at = Some(ic_start);
        for _ in 0..engine.ic_entries() {
            cw.put_u64(0); // real_start: unclaimed
            cw.put_u64(IC_MAGIC_EMPTY);
        }

        // Scratch slot: the matched code_start is parked here so it can be
        // fetched again once the guest context is restored.
        let ic_match = cw.pc();
        cw.put_u64(IC_MAGIC_SCRATCH);

        cw.put_label(look_in_cache);

        push(cw, RCX);
        write_push_branch_target_address(ctx, target, gc);

        let cw = gc.cw();
        movabs(cw, RCX, ic_start);
        movabs(cw, RBX, ic_start + engine.ic_entries() as u64 * size_of::<IcEntry>() as u64);

        // Linear scan comparing each slot's guest start with the target
        cw.put_label(loop_);
        mov(cw, RAX, mem_opnd(64, RCX, 0));

        cmp(cw, mem_opnd(64, RSP, 0), RAX);
        jcc_short_label(cw, Cc::NE, try_next);

        // An unclaimed slot ends the populated prefix
        cmp(cw, RAX, imm_opnd(0));
        jcc_short_label(cw, Cc::E, resolve_dynamically);

        // Hit: park code_start, restore the guest context, jump
        mov(cw, RCX, mem_opnd(64, RCX, IC_ENTRY_CODE_OFFSET));
        mov(cw, ip_rel(ic_match), RCX);

        pop(cw, RAX);
        pop(cw, RCX);
        write_epilog(ctx, PrologKind::Ic, cw);
        jmp_riprel(cw, ic_match);

        cw.put_label(try_next);
        add(cw, RCX, imm_opnd(size_of::<IcEntry>() as i64));
        cmp(cw, RCX, RBX);
        jcc_short_label(cw, Cc::LE, loop_);

        // Miss: resolve through the gate
        cw.put_label(resolve_dynamically);
        pop(cw, RAX);
        pop(cw, RCX);
        close_prolog(block, gc);
    }

    open_prolog(block, PrologKind::Minimal, gc);

    if ic_entries_at.is_none() {
        let cw = gc.cw();
        call_label(cw, push_application_retaddr);
        call_label(cw, perform_stack_push);
    }

    gc.accumulated_stack_delta += 8;

    let entry_gate: EntryGate = match target.kind {
        BranchKind::MemAbs { .. } | BranchKind::Mem { .. } => exec_ctx::entry_gate_call_mem,
        BranchKind::Reg(_) => exec_ctx::entry_gate_call_reg,
        BranchKind::Imm(_) => exec_ctx::entry_gate_call_imm,
    };

    // Resolve the target and enter the dispatcher
    write_push_branch_target_address(ctx, target, gc);
    let cw = gc.cw();
    pop(cw, RSI);
    movabs(cw, RDI, ctx as *const ExecCtx as u64);
    movabs(cw, RAX, entry_gate as usize as u64);
    call(cw, RAX);
    mov(cw, RDX, RAX);
    jmp_label(cw, beach);

    // Landing site for the eventual return
    let ret_real_address = insn_end;
    let ret_code_address = cw.pc();

    write_prolog(ctx, PrologKind::Minimal, cw);

    movabs(cw, RSI, ret_real_address);
    movabs(cw, RDI, ctx as *const ExecCtx as u64);
    movabs(cw, RAX, exec_ctx::entry_gate_post_call_invoke as usize as u64);
    call(cw, RAX);

    if trust_threshold >= 0 {
        mov(cw, RAX, ip_rel(ctx.addr_of_current_block()));
        write_call_aligned(
            cw,
            crate::backpatch::backpatch_ret as usize as u64,
            &[
                CallArg::Reg(RAX),
                CallArg::Imm(block as *mut ExecBlock as u64),
                CallArg::Imm(ret_code_address - block.code_start as u64),
            ],
        );
    }

    write_epilog(ctx, PrologKind::Minimal, cw);
    jmp_riprel(cw, ctx.addr_of_resume_at());

    // Subroutine: push the guest return address onto the app stack
    cw.put_label(push_application_retaddr);
    mov(cw, RAX, ip_rel(ctx.addr_of_app_stack()));
    sub(cw, RAX, imm_opnd(8));
    movabs(cw, RCX, insn_end);
    mov(cw, mem_opnd(64, RAX, 0), RCX);
    mov(cw, ip_rel(ctx.addr_of_app_stack()), RAX);
    ret(cw);

    // Subroutine: push the return pair onto the shadow frame stack
    cw.put_label(perform_stack_push);
    movabs(cw, RCX, ret_real_address);
    movabs(cw, RDX, ret_code_address);
    call_abs(cw, ctx.helpers().stack_push as u64);
    ret(cw);

    cw.put_label(beach);

    if trust_threshold >= 0 {
        mov(cw, RAX, ip_rel(ctx.addr_of_current_block()));
    }

    if can_backpatch_statically {
        write_call_aligned(
            cw,
            crate::backpatch::backpatch_call as usize as u64,
            &[
                CallArg::Reg(RAX),
                CallArg::Imm(block as *mut ExecBlock as u64),
                CallArg::Imm(call_code_start - block.code_start as u64),
                CallArg::Imm(opened_prolog as u64),
                CallArg::Imm(ret_real_address),
                CallArg::Imm(ret_code_address - block.code_start as u64),
            ],
        );
    }

    if let Some(ic_start) = ic_entries_at {
        write_call_aligned(
            gc.cw(),
            crate::backpatch::backpatch_inline_cache as usize as u64,
            &[
                CallArg::Reg(RAX),
                CallArg::Imm(block as *mut ExecBlock as u64),
                CallArg::Imm(ic_start - block.code_start as u64),
            ],
        );
    }

    // Execute the resolved code
    close_prolog(block, gc);
    jmp_riprel(gc.cw(), ctx.addr_of_resume_at());
}

/// The jmp strategy: like a call without return bookkeeping. Direct
/// targets are statically backpatchable; dynamic ones get an inline cache.
pub(crate) fn write_jmp_transfer_code(
    block: &mut ExecBlock,
    target: &BranchTarget,
    entry_gate: EntryGate,
    gc: &mut GeneratorContext,
) {
    let ctx = unsafe { &*block.ctx };
    let engine = ctx.engine();
    let trust_threshold = engine.trust_threshold();
    let opened_prolog = gc.opened_prolog;

    let cw = gc.cw();
    let code_start = cw.pc();
    let look_in_cache = cw.new_label();
    let loop_ = cw.new_label();
    let try_next = cw.new_label();
    let resolve_dynamically = cw.new_label();

    let can_backpatch_statically =
        trust_threshold >= 0 && matches!(target.kind, BranchKind::Imm(_));

    let mut ic_entries_at: Option<u64> = None;

    if trust_threshold >= 0 && !can_backpatch_statically {
        close_prolog(block, gc);

        // The inline cache is larger than a short jump's reach
        jmp_label(gc.cw(), look_in_cache);

        let cw = gc.cw();
        let ic_start = cw.pc();
        ic_entries_at = Some(ic_start);
        for _ in 0..engine.ic_entries() {
            cw.put_u64(0);
            cw.put_u64(IC_MAGIC_EMPTY);
        }

        let ic_match = cw.pc();
        cw.put_u64(IC_MAGIC_SCRATCH);

        cw.put_label(look_in_cache);
        open_prolog(block, PrologKind::Ic, gc);

        let cw = gc.cw();
        push(cw, RCX);
        write_push_branch_target_address(ctx, target, gc);

        let cw = gc.cw();
        movabs(cw, RCX, ic_start);
        movabs(cw, RBX, ic_start + engine.ic_entries() as u64 * size_of::<IcEntry>() as u64);

        cw.put_label(loop_);
        mov(cw, RAX, mem_opnd(64, RCX, 0));

        cmp(cw, mem_opnd(64, RSP, 0), RAX);
        jcc_short_label(cw, Cc::NE, try_next);

        cmp(cw, RAX, imm_opnd(0));
        jcc_short_label(cw, Cc::E, resolve_dynamically);

        mov(cw, RCX, mem_opnd(64, RCX, IC_ENTRY_CODE_OFFSET));
        mov(cw, ip_rel(ic_match), RCX);

        pop(cw, RAX);
        pop(cw, RCX);
        write_epilog(ctx, PrologKind::Ic, cw);
        jmp_riprel(cw, ic_match);

        cw.put_label(try_next);
        add(cw, RCX, imm_opnd(size_of::<IcEntry>() as i64));
        cmp(cw, RCX, RBX);
        jcc_short_label(cw, Cc::LE, loop_);

        cw.put_label(resolve_dynamically);
        pop(cw, RAX);
        pop(cw, RCX);
        close_prolog(block, gc);
    }

    open_prolog(block, PrologKind::Minimal, gc);

    write_push_branch_target_address(ctx, target, gc);
    let cw = gc.cw();
    pop(cw, RSI);
    movabs(cw, RDI, ctx as *const ExecCtx as u64);
    movabs(cw, RAX, entry_gate as usize as u64);
    call(cw, RAX);

    if trust_threshold >= 0 {
        mov(cw, RAX, ip_rel(ctx.addr_of_current_block()));
    }

    if can_backpatch_statically {
        write_call_aligned(
            cw,
            crate::backpatch::backpatch_jmp as usize as u64,
            &[
                CallArg::Reg(RAX),
                CallArg::Imm(block as *mut ExecBlock as u64),
                CallArg::Imm(code_start - block.code_start as u64),
                CallArg::Imm(opened_prolog as u64),
            ],
        );
    }

    if let Some(ic_start) = ic_entries_at {
        write_call_aligned(
            gc.cw(),
            crate::backpatch::backpatch_inline_cache as usize as u64,
            &[
                CallArg::Reg(RAX),
                CallArg::Imm(block as *mut ExecBlock as u64),
                CallArg::Imm(ic_start - block.code_start as u64),
            ],
        );
    }

    close_prolog(block, gc);

    jmp_riprel(gc.cw(), ctx.addr_of_resume_at());
}

/// The ret strategy: hand the guest return address to the three-tier
/// stack-pop-and-go helper.
fn write_ret_transfer_code(block: &mut ExecBlock, gc: &mut GeneratorContext) {
    let ctx = unsafe { &*block.ctx };
    let insn_start = gc.instruction.unwrap().address;

    close_prolog(block, gc);

    let cw = gc.cw();
    lea(cw, RSP, mem_opnd(64, RSP, -RED_ZONE_SIZE));
    push(cw, RCX);
    movabs(cw, RCX, insn_start);
    jmp_abs(cw, ctx.helpers().stack_pop_and_go as u64);
}

/// Unsupported instruction: run it in place under the trap flag. The
/// host's trap handler re-enters via switch_block once the guest has
/// advanced one instruction.
pub(crate) fn write_single_step_transfer_code(block: &mut ExecBlock, gc: &mut GeneratorContext) {
    let ctx = unsafe { &*block.ctx };
    let insn_start = gc.instruction.unwrap().address;
    write_single_step_exit(ctx, gc.cw(), insn_start);
}

pub(crate) fn write_single_step_exit(ctx: &ExecCtx, cw: &mut crate::asm::CodeWriter, pc: u64) {
    mov_abs32(cw, ctx.addr_of_mode(), exec_ctx::MODE_SINGLE_STEPPING_ON_CALL);
    pushfq(cw);
    or(cw, mem_opnd(64, RSP, 0), imm_opnd(0x100));
    popfq(cw);
    jmp_abs(cw, pc);
}

/// Leave the resolved branch target on top of the engine stack without
/// perturbing guest-visible registers.
pub(crate) fn write_push_branch_target_address(
    ctx: &ExecCtx,
    target: &BranchTarget,
    gc: &mut GeneratorContext,
) {
    let cw = gc.cw();

    match target.kind {
        BranchKind::Imm(address) => {
            push(cw, RAX);
            movabs(cw, RAX, address);
            xchg(cw, mem_opnd(64, RSP, 0), RAX);
        }

        BranchKind::Reg(reg) => {
            push(cw, RAX);
            load_real_register_into(ctx, RAX, GuestReg::Gpr(reg), target.origin_ip, gc);
            let cw = gc.cw();
            xchg(cw, mem_opnd(64, RSP, 0), RAX);
        }

        BranchKind::MemAbs { slot, segment } => {
            push(cw, RAX);
            movabs(cw, RAX, slot);
            write_segment_prefix(cw, segment);
            mov(cw, RAX, mem_opnd(64, RAX, 0));
            xchg(cw, mem_opnd(64, RSP, 0), RAX);
        }

        BranchKind::Mem { segment, base, index, scale, disp } => {
            push(cw, RAX); // placeholder for the result

            push(cw, RAX);
            push(cw, RDX);

            let base_source = base.map_or(GuestReg::None, GuestReg::Gpr);
            let index_source = index.map_or(GuestReg::None, GuestReg::Gpr);
            load_real_register_into(ctx, RAX, base_source, target.origin_ip, gc);
            load_real_register_into(ctx, RDX, index_source, target.origin_ip, gc);

            let cw = gc.cw();
            write_segment_prefix(cw, segment);
            mov(cw, RAX, mem_opnd_sib(64, RAX, RDX, scale.max(1), disp));
            mov(cw, mem_opnd(64, RSP, 2 * 8), RAX);

            pop(cw, RDX);
            pop(cw, RAX);
        }
    }
}

fn write_segment_prefix(cw: &mut crate::asm::CodeWriter, segment: Option<Segment>) {
    let prefix = match segment {
        None => return,
        Some(Segment::Cs) => 0x2e,
        Some(Segment::Ss) => 0x36,
        Some(Segment::Ds) => 0x3e,
        Some(Segment::Es) => 0x26,
        Some(Segment::Fs) => 0x64,
        Some(Segment::Gs) => 0x65,
    };
    cw.put_u8(prefix);
}

/// Recover a guest register's value while a prolog is open: saved registers
/// come from the frame, the stack pointer from the recorded app stack, rip
/// from the instruction address, and anything unsaved straight from the
/// live register.
fn load_real_register_into(
    ctx: &ExecCtx,
    target: X86Opnd,
    source: GuestReg,
    ip: u64,
    gc: &mut GeneratorContext,
) {
    match gc.opened_prolog {
        PrologKind::Minimal => load_from_minimal_frame(ctx, target, source, ip, gc),
        PrologKind::Full => load_from_full_frame(ctx, target, source, ip, gc),
        PrologKind::Ic => load_from_ic_frame(ctx, target, source, ip, gc),
        PrologKind::None => unreachable!(),
    }
}

/// Slot index (from the frame base in rbx) of each caller-saved register in
/// the minimal frame, topmost (rax) = 9.
fn minimal_frame_slot(reg: u8) -> Option<i32> {
    match reg {
        0 => Some(9), // rax
        1 => Some(8), // rcx
        2 => Some(7), // rdx
        3 => Some(6), // rbx
        6 => Some(5), // rsi
        7 => Some(4), // rdi
        8..=11 => Some(3 - (reg as i32 - 8)),
        _ => None,
    }
}

fn load_from_minimal_frame(
    ctx: &ExecCtx,
    target: X86Opnd,
    source: GuestReg,
    ip: u64,
    gc: &mut GeneratorContext,
) {
    let cw = gc.cw();
    match source {
        GuestReg::Gpr(4) => load_app_stack_pointer(ctx, target, gc),
        GuestReg::Gpr(reg) => match minimal_frame_slot(reg) {
            Some(slot) => mov(cw, target, mem_opnd(64, RBX, slot * 8)),
            // rbp, r12..r15 are not saved by the minimal prolog
            None => mov(cw, target, X86Opnd::Reg(X86Reg { num_bits: 64, reg_no: reg })),
        },
        GuestReg::Rip => movabs(cw, target, ip),
        GuestReg::None => xor(cw, target, target),
    }
}

fn load_from_full_frame(
    ctx: &ExecCtx,
    target: X86Opnd,
    source: GuestReg,
    ip: u64,
    gc: &mut GeneratorContext,
) {
    let cw = gc.cw();
    match source {
        GuestReg::Gpr(4) => load_app_stack_pointer(ctx, target, gc),
        GuestReg::Gpr(reg) => {
            let offset = cpu_context_offset(reg);
            mov(cw, target, mem_opnd(64, RBX, offset));
        }
        GuestReg::Rip => movabs(cw, target, ip),
        GuestReg::None => xor(cw, target, target),
    }
}

fn load_from_ic_frame(
    ctx: &ExecCtx,
    target: X86Opnd,
    source: GuestReg,
    ip: u64,
    gc: &mut GeneratorContext,
) {
    let cw = gc.cw();
    match source {
        GuestReg::Gpr(0) => mov(cw, target, mem_opnd(64, RBX, 8)),
        GuestReg::Gpr(3) => mov(cw, target, mem_opnd(64, RBX, 0)),
        GuestReg::Gpr(4) => load_app_stack_pointer(ctx, target, gc),
        GuestReg::Gpr(reg) => mov(cw, target, X86Opnd::Reg(X86Reg { num_bits: 64, reg_no: reg })),
        GuestReg::Rip => movabs(cw, target, ip),
        GuestReg::None => xor(cw, target, target),
    }
}

fn load_app_stack_pointer(ctx: &ExecCtx, target: X86Opnd, gc: &mut GeneratorContext) {
    let delta = gc.accumulated_stack_delta as i32;
    let cw = gc.cw();
    mov(cw, target, ip_rel(ctx.addr_of_app_stack()));
    if delta != 0 {
        lea(cw, target, mem_opnd(64, target, delta));
    }
}

fn cpu_context_offset(reg: u8) -> i32 {
    let offset = match reg {
        0 => offset_of!(CpuContext, rax),
        1 => offset_of!(CpuContext, rcx),
        2 => offset_of!(CpuContext, rdx),
        3 => offset_of!(CpuContext, rbx),
        4 => offset_of!(CpuContext, rsp),
        5 => offset_of!(CpuContext, rbp),
        6 => offset_of!(CpuContext, rsi),
        7 => offset_of!(CpuContext, rdi),
        8 => offset_of!(CpuContext, r8),
        9 => offset_of!(CpuContext, r9),
        10 => offset_of!(CpuContext, r10),
        11 => offset_of!(CpuContext, r11),
        12 => offset_of!(CpuContext, r12),
        13 => offset_of!(CpuContext, r13),
        14 => offset_of!(CpuContext, r14),
        15 => offset_of!(CpuContext, r15),
        _ => unreachable!(),
    };
    offset as i32
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum Interruptible {
    Yes,
    /// Emission sites where bailing out for unfollow would leave the guest
    /// in an inconsistent state.
    #[allow(dead_code)]
    No,
}

pub(crate) fn write_call_event_code(
    block: &mut ExecBlock,
    target: &BranchTarget,
    gc: &mut GeneratorContext,
    cc: Interruptible,
) {
    let ctx = unsafe { &*block.ctx };
    let location = gc.instruction.unwrap().address;

    open_prolog(block, PrologKind::Full, gc);

    write_push_branch_target_address(ctx, target, gc);
    let cw = gc.cw();
    pop(cw, RDX);

    write_call_aligned(
        cw,
        exec_ctx::emit_call_event as usize as u64,
        &[
            CallArg::Imm(block.ctx as u64),
            CallArg::Imm(location),
            CallArg::Reg(RDX),
            CallArg::Reg(RBX),
        ],
    );

    write_unfollow_check_code(block, gc, cc);
}

pub(crate) fn write_ret_event_code(block: &mut ExecBlock, gc: &mut GeneratorContext, cc: Interruptible) {
    let location = gc.instruction.unwrap().address;

    open_prolog(block, PrologKind::Full, gc);

    write_call_aligned(
        gc.cw(),
        exec_ctx::emit_ret_event as usize as u64,
        &[CallArg::Imm(block.ctx as u64), CallArg::Imm(location), CallArg::Reg(RBX)],
    );

    write_unfollow_check_code(block, gc, cc);
}

pub(crate) fn write_exec_event_code(block: &mut ExecBlock, gc: &mut GeneratorContext, cc: Interruptible) {
    let location = gc.instruction.unwrap().address;

    open_prolog(block, PrologKind::Full, gc);

    write_call_aligned(
        gc.cw(),
        exec_ctx::emit_exec_event as usize as u64,
        &[CallArg::Imm(block.ctx as u64), CallArg::Imm(location), CallArg::Reg(RBX)],
    );

    write_unfollow_check_code(block, gc, cc);
}

pub(crate) fn write_block_event_code(block: &mut ExecBlock, gc: &mut GeneratorContext, cc: Interruptible) {
    open_prolog(block, PrologKind::Full, gc);

    write_call_aligned(
        gc.cw(),
        exec_ctx::emit_block_event as usize as u64,
        &[
            CallArg::Imm(block.ctx as u64),
            CallArg::Imm(block as *mut ExecBlock as u64),
            CallArg::Reg(RBX),
        ],
    );

    write_unfollow_check_code(block, gc, cc);
}

/// Emitted after every event site: if an unfollow became due, leave
/// translated code for the gate-resolved resume address.
fn write_unfollow_check_code(block: &mut ExecBlock, gc: &mut GeneratorContext, cc: Interruptible) {
    let ctx = unsafe { &*block.ctx };
    let location = gc.instruction.unwrap().address;

    if cc != Interruptible::Yes {
        return;
    }

    let cw = gc.cw();
    let beach = cw.new_label();

    write_call_aligned(
        cw,
        exec_ctx::maybe_unfollow_shim as usize as u64,
        &[CallArg::Imm(block.ctx as u64), CallArg::Imm(location)],
    );
    test(cw, RAX, RAX);
    jcc_label(cw, Cc::E, beach);

    // The prolog stays conceptually open: this exit path restores the guest
    // context itself, but fall-through continues under the same prolog.
    let opened_prolog = gc.opened_prolog;
    close_prolog(block, gc);
    gc.opened_prolog = opened_prolog;

    jmp_riprel(gc.cw(), ctx.addr_of_resume_at());

    gc.cw().put_label(beach);
}
