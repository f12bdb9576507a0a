//! Translated blocks. One [ExecBlock] records the mapping from a guest
//! basic block to its counterpart in a code slab, together with the
//! recycle counter and the optional byte snapshot used to detect
//! self-modifying guests.

use crate::asm::x86_64::*;
use crate::cpu::CpuContext;
use crate::exec_ctx::ExecCtx;
use crate::slab::CodeSlab;
use crate::transform::Callout;
use crate::virtualmem::{freeze, thaw};

/// Space every block reserves up front so that out-of-space is detected
/// before emission, never during it.
pub(crate) const MIN_BLOCK_CAPACITY: usize = 1024;

/// The first bytes of every block stay overwritable with a trampoline of
/// this size; inline data is never placed inside this window.
pub(crate) const INVALIDATE_TRAMPOLINE_SIZE: usize = 16;

/// Sentinel for an unclaimed inline-cache slot.
pub(crate) const IC_MAGIC_EMPTY: u64 = 0xbaad_d00d_baad_d00d;
/// Sentinel occupying the per-site scratch slot until the first hit.
pub(crate) const IC_MAGIC_SCRATCH: u64 = 0xcafe_f00d_cafe_f00d;

/// One inline-cache slot, embedded in translated code at an indirect
/// call/jmp site. Scanned linearly by emitted code.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct IcEntry {
    pub real_start: *mut u8,
    pub code_start: *mut u8,
}

pub(crate) const IC_ENTRY_REAL_OFFSET: i32 = std::mem::offset_of!(IcEntry, real_start) as i32;
pub(crate) const IC_ENTRY_CODE_OFFSET: i32 = std::mem::offset_of!(IcEntry, code_start) as i32;

/// Inline data node for a transformer-injected callout. Lives inside the
/// translated block behind a jump; linked through in-block offsets so the
/// chain survives the block being copied during recompilation.
#[repr(C)]
pub(crate) struct CalloutEntry {
    /// Heap pointer to the boxed user closure.
    pub callout: *mut Callout,
    pub pc: u64,
    pub exec_ctx: *mut ExecCtx,
    /// Offset of the next entry from the block's code start; 0 terminates.
    pub next_offset: u32,
    pub _pad: u32,
}

/// Block is the pending activation target and must never be backpatched
/// away.
pub(crate) const BLOCK_FLAG_ACTIVATION_TARGET: u32 = 1 << 0;

#[repr(C)]
pub(crate) struct ExecBlock {
    pub ctx: *mut ExecCtx,
    pub code_slab: *mut CodeSlab,
    /// Out-of-line home of the latest recompilation when it no longer fit
    /// the original site; the original site keeps a jump to it so stale
    /// backpatch targets remain valid.
    pub storage_block: *mut ExecBlock,

    pub real_start: *mut u8,
    pub code_start: *mut u8,
    pub real_size: u32,
    pub code_size: u32,
    pub capacity: u32,
    pub last_callout_offset: u32,

    pub flags: u32,
    pub recycle_count: i32,
}

impl ExecBlock {
    pub fn is_activation_target(&self) -> bool {
        self.flags & BLOCK_FLAG_ACTIVATION_TARGET != 0
    }

    /// The snapshot (if any) sits right after the translated code.
    pub fn snapshot_start(&self) -> *mut u8 {
        unsafe { self.code_start.add(self.code_size as usize) }
    }

    pub fn last_callout_entry(&self) -> *mut CalloutEntry {
        if self.last_callout_offset == 0 {
            return std::ptr::null_mut();
        }
        unsafe { self.code_start.add(self.last_callout_offset as usize) as *mut CalloutEntry }
    }

    /// `address` is the entry's final address (the emission PC, which
    /// equals its in-block position even while compiling via scratch).
    pub fn set_last_callout_entry_address(&mut self, address: u64) {
        self.last_callout_offset = (address - self.code_start as u64) as u32;
    }

    /// Release callout closures and detach the storage block. Called before
    /// recompilation and at context teardown.
    pub fn clear(&mut self) {
        let mut entry = self.last_callout_entry();
        while !entry.is_null() {
            unsafe {
                drop(Box::from_raw((*entry).callout));
                (*entry).callout = std::ptr::null_mut();
                entry = if (*entry).next_offset == 0 {
                    std::ptr::null_mut()
                } else {
                    self.code_start.add((*entry).next_offset as usize) as *mut CalloutEntry
                };
            }
        }
        self.last_callout_offset = 0;

        self.storage_block = std::ptr::null_mut();
    }

    /// Append the snapshot, claim the slab space and freeze the code.
    pub fn commit(&mut self) {
        let ctx = unsafe { &*self.ctx };
        let engine = ctx.engine();

        let snapshot_size = engine.snapshot_space_needed_for(self.real_size as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(self.real_start, self.snapshot_start(), snapshot_size);
        }

        self.capacity = self.code_size + snapshot_size as u32;

        let slab = unsafe { &mut (*self.code_slab).slab };
        slab.reserve(self.capacity as usize);

        freeze(engine.pages(), self.code_start, self.code_size as usize);
    }

    /// Overwrite the first bytes with a trampoline into the slab's
    /// invalidator, followed by the distance back to this record so the
    /// invalidator can find it. The trampoline is position-independent with
    /// respect to the rest of the block, which keeps executing threads safe
    /// as long as they are past the trampoline window.
    pub fn invalidate(&mut self) {
        let ctx = unsafe { &*self.ctx };
        let engine = ctx.engine();
        let cw = ctx.writer();

        thaw(engine.pages(), self.code_start, INVALIDATE_TRAMPOLINE_SIZE);
        cw.reset(self.code_start, INVALIDATE_TRAMPOLINE_SIZE);

        lea(cw, RSP, mem_opnd(64, RSP, -(crate::helpers::RED_ZONE_SIZE as i32)));
        call_abs(cw, unsafe { (*self.code_slab).invalidator } as u64);
        let distance_to_data = (self as *mut ExecBlock as i64) - (cw.pc() as i64);
        cw.put_u32(distance_to_data as i32 as u32);
        while cw.offset() < INVALIDATE_TRAMPOLINE_SIZE {
            nop(cw);
        }

        cw.flush().expect("failed to resolve labels");
        assert_eq!(cw.offset(), INVALIDATE_TRAMPOLINE_SIZE);
        freeze(engine.pages(), self.code_start, INVALIDATE_TRAMPOLINE_SIZE);
    }
}

/// Fired from translated code with the full context saved. Reinstates the
/// guest program counter, then runs the user closure; unfollow stays
/// deferred for the duration.
pub(crate) extern "sysv64" fn invoke_callout(entry: *mut CalloutEntry, cpu_context: *mut CpuContext) {
    unsafe {
        let entry = &*entry;
        let ctx = &*entry.exec_ctx;

        (*cpu_context).rip = entry.pc;

        ctx.begin_pending_call();
        (*entry.callout)(&mut *cpu_context);
        ctx.end_pending_call();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ic_entry_layout_matches_emitted_scan() {
        assert_eq!(std::mem::size_of::<IcEntry>(), 16);
        assert_eq!(IC_ENTRY_REAL_OFFSET, 0);
        assert_eq!(IC_ENTRY_CODE_OFFSET, 8);
    }

    #[test]
    fn callout_chain_offsets_terminate() {
        let mut block: ExecBlock = unsafe { std::mem::zeroed() };
        assert!(block.last_callout_entry().is_null());
        block.last_callout_offset = 0;
        block.clear();
        assert_eq!(block.last_callout_offset, 0);
    }
}
