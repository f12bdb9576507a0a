//! The block compiler: drives the relocator and the transformer over one
//! guest basic block and emits its translated counterpart.

use crate::asm::x86_64::*;
use crate::asm::CodeWriter;
use crate::block::{CalloutEntry, ExecBlock, INVALIDATE_TRAMPOLINE_SIZE, MIN_BLOCK_CAPACITY};
use crate::decoder::Insn;
use crate::events::EventMask;
use crate::exec_ctx::ExecCtx;
use crate::helpers::{write_call_aligned, CallArg, PrologKind};
use crate::relocator::Relocator;
use crate::transform::Callout;
use crate::virtualize::{self, BranchTarget, Interruptible, Requirements};

/// Shared state of one block's emission, threaded through the virtualizer.
/// Holds raw pointers to the context-owned writer and relocator; all use is
/// single-threaded under the context's code lock.
pub(crate) struct GeneratorContext {
    relocator: *mut Relocator,
    cw_ptr: *mut CodeWriter,
    pub instruction: Option<Insn>,
    /// Where the next block must pick up after an out-of-space stop.
    pub continuation_real_address: Option<u64>,
    pub opened_prolog: PrologKind,
    /// Bytes the emitted sequence has pushed onto the app stack so far;
    /// compensates guest rsp reads taken mid-sequence.
    pub accumulated_stack_delta: u32,
}

impl GeneratorContext {
    #[allow(clippy::mut_from_ref)]
    pub fn cw(&self) -> &mut CodeWriter {
        unsafe { &mut *self.cw_ptr }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn relocator(&self) -> &mut Relocator {
        unsafe { &mut *self.relocator }
    }
}

/// Hands the transformer access to the writer so it can interleave its own
/// instructions between kept guest instructions.
pub struct TransformOutput {
    cw_ptr: *mut CodeWriter,
}

impl TransformOutput {
    pub fn writer(&mut self) -> &mut CodeWriter {
        unsafe { &mut *self.cw_ptr }
    }
}

/// The iterator a transformer drives. `next` decodes the next guest
/// instruction; `keep` emits it with control transfers virtualized;
/// `put_callout` plants a callback that receives the full CPU context.
pub struct BlockIterator<'a> {
    ctx: &'a ExecCtx,
    block: *mut ExecBlock,
    pub(crate) gc: GeneratorContext,
    /// Set when decoding failed; the block exits via single-step here.
    single_step_at: Option<u64>,
}

impl BlockIterator<'_> {
    pub fn next(&mut self) -> Option<Insn> {
        let is_first_instruction = self.gc.instruction.is_none();

        if self.gc.instruction.is_some() {
            // keep() was not called for the previous instruction
            if self.gc.relocator().has_pending() {
                self.gc.relocator().skip_one();
            }

            if self.is_out_of_space() {
                let end = self.gc.instruction.unwrap().end();
                self.gc.continuation_real_address = Some(end);
                return None;
            }
            if self.gc.relocator().eob() {
                return None;
            }
        }

        let insn = match self.gc.relocator().read_one() {
            Ok(insn) => insn,
            Err(_) => {
                self.single_step_at = Some(self.gc.relocator().next_input_address());
                return None;
            }
        };

        self.gc.instruction = Some(insn);

        if is_first_instruction && self.ctx.sink_mask().contains(EventMask::BLOCK) {
            let block = unsafe { &mut *self.block };
            virtualize::write_block_event_code(block, &mut self.gc, Interruptible::Yes);
        }

        Some(insn)
    }

    pub fn keep(&mut self) {
        let block = unsafe { &mut *self.block };
        let gc = &mut self.gc;

        if self.ctx.sink_mask().contains(EventMask::EXEC) {
            virtualize::write_exec_event_code(block, gc, Interruptible::Yes);
        }

        let insn = gc.instruction.expect("keep() before next()");
        let requirements = match insn.id {
            crate::decoder::InsnId::Call
            | crate::decoder::InsnId::Jmp
            | crate::decoder::InsnId::Jcc(_)
            | crate::decoder::InsnId::Jcxz => virtualize::virtualize_branch_insn(block, gc),
            crate::decoder::InsnId::Ret => virtualize::virtualize_ret_insn(block, gc),
            crate::decoder::InsnId::Sysenter => virtualize::virtualize_sysenter_insn(block, gc),
            crate::decoder::InsnId::Other => Requirements::Relocate,
        };

        virtualize::close_prolog(block, gc);

        match requirements {
            Requirements::Relocate => gc.relocator().write_one(gc.cw()),
            Requirements::SingleStep => {
                gc.relocator().skip_one();
                virtualize::write_single_step_transfer_code(block, gc);
            }
            Requirements::Nothing => {}
        }
    }

    /// Plant a user callback at the current instruction. The closure and
    /// its captures live inline in the translated block and are dropped
    /// when the block is cleared.
    pub fn put_callout(&mut self, callout: Callout) {
        let block = unsafe { &mut *self.block };
        let gc = &mut self.gc;
        let pc = gc.instruction.expect("put_callout() before next()").address;

        let entry = CalloutEntry {
            callout: Box::into_raw(Box::new(callout)),
            pc,
            exec_ctx: self.ctx as *const ExecCtx as *mut ExecCtx,
            next_offset: block.last_callout_offset,
            _pad: 0,
        };
        let entry_bytes = unsafe {
            std::slice::from_raw_parts(
                &entry as *const CalloutEntry as *const u8,
                std::mem::size_of::<CalloutEntry>(),
            )
        };
        let entry_address = write_inline_data(gc.cw(), entry_bytes);

        block.set_last_callout_entry_address(entry_address);

        virtualize::open_prolog(block, PrologKind::Full, gc);
        write_call_aligned(
            gc.cw(),
            crate::block::invoke_callout as usize as u64,
            &[CallArg::Imm(entry_address), CallArg::Reg(RBX)],
        );
        virtualize::close_prolog(block, gc);
    }

    fn is_out_of_space(&self) -> bool {
        let block = unsafe { &*self.block };
        let slab = unsafe { &(*block.code_slab).slab };
        let engine = self.ctx.engine();

        let capacity = slab.end() as usize - self.gc.cw().cur() as usize;

        let insn_end = self.gc.instruction.unwrap().end();
        let snapshot_size =
            engine.snapshot_space_needed_for(insn_end as usize - block.real_start as usize);

        capacity < MIN_BLOCK_CAPACITY + snapshot_size + engine.ic_entry_size()
    }
}

/// Embed raw data inside the instruction stream, jumped over, past the
/// invalidation trampoline window. Returns the data's final address.
fn write_inline_data(cw: &mut CodeWriter, data: &[u8]) -> u64 {
    while cw.offset() < INVALIDATE_TRAMPOLINE_SIZE {
        nop(cw);
    }

    let after_data = cw.new_label();
    if data.len() <= i8::MAX as usize {
        jmp_short_label(cw, after_data);
    } else {
        jmp_label(cw, after_data);
    }

    let address = cw.pc();
    cw.put_bytes(data);
    cw.put_label(after_data);

    address
}

/// Translate the guest block starting at `input_code` into
/// `output_code..+capacity`, emitting as if the code lived at `output_pc`.
/// Returns (guest bytes consumed, translated bytes emitted).
pub(crate) fn compile_block(
    ctx: &ExecCtx,
    block: *mut ExecBlock,
    input_code: *const u8,
    output_code: *mut u8,
    output_pc: u64,
    capacity: usize,
) -> (u32, u32) {
    let engine = ctx.engine();
    let cw = ctx.writer();
    let relocator = ctx.relocator();

    cw.reset_with_pc(output_code, capacity, output_pc);
    relocator.reset(input_code);

    // An unreadable guest page cannot be translated; emit a one-instruction
    // single-step exit and let the trap handler sort it out.
    if crate::os::ensure_readable(input_code, engine.page_size()).is_err() {
        log::error!("guest code at {input_code:p} is not readable");
        virtualize::write_single_step_exit(ctx, cw, input_code as u64);
        cw.flush().expect("failed to resolve labels");
        return (0, cw.offset() as u32);
    }

    let gc = GeneratorContext {
        relocator: relocator as *mut Relocator,
        cw_ptr: cw as *mut CodeWriter,
        instruction: None,
        continuation_real_address: None,
        opened_prolog: PrologKind::None,
        accumulated_stack_delta: 0,
    };

    let mut iterator = BlockIterator { ctx, block, gc, single_step_at: None };
    let mut output = TransformOutput { cw_ptr: cw as *mut CodeWriter };

    maybe_write_call_probe_code(unsafe { &mut *block }, &mut iterator);

    let transformer = ctx.transformer();
    ctx.begin_pending_call();
    transformer.transform_block(&mut iterator, &mut output);
    ctx.end_pending_call();

    if let Some(continuation) = iterator.gc.continuation_real_address {
        let continue_target = BranchTarget {
            origin_ip: continuation,
            kind: crate::decoder::BranchKind::Imm(continuation),
        };
        virtualize::write_jmp_transfer_code(
            unsafe { &mut *block },
            &continue_target,
            crate::exec_ctx::entry_gate_jmp_continuation,
            &mut iterator.gc,
        );
    }

    if let Some(step_at) = iterator.single_step_at {
        virtualize::close_prolog(unsafe { &mut *block }, &mut iterator.gc);
        virtualize::write_single_step_exit(ctx, iterator.gc.cw(), step_at);
    }

    int3(cw); // should never get here

    cw.flush().expect("failed to resolve labels");

    (relocator.input_consumed() as u32, cw.offset() as u32)
}

fn maybe_write_call_probe_code(block: &mut ExecBlock, iterator: &mut BlockIterator) {
    let ctx = unsafe { &*block.ctx };
    let engine = ctx.engine();

    if !engine.probes().any_attached() {
        return;
    }
    if !engine.probes().has_probes_for(block.real_start as usize) {
        return;
    }

    let gc = &mut iterator.gc;
    assert_eq!(gc.opened_prolog, PrologKind::None);
    virtualize::open_prolog(block, PrologKind::Full, gc);

    write_call_aligned(
        gc.cw(),
        invoke_call_probes as usize as u64,
        &[CallArg::Imm(block as *mut ExecBlock as u64), CallArg::Reg(RBX)],
    );
}

/// Fired from translated code before the first instruction of a probed
/// block, under a full prolog.
pub(crate) extern "sysv64" fn invoke_call_probes(
    block: *mut ExecBlock,
    cpu_context: *mut crate::cpu::CpuContext,
) {
    unsafe {
        let block = &*block;
        let ctx = &*block.ctx;
        ctx.engine().probes().invoke(block.real_start as usize, &mut *cpu_context);
    }
}
