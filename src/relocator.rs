//! Streams guest instructions into the writer, one at a time, patching
//! whatever refers to the old location. The compiler drives it through the
//! block iterator: `read_one` decodes, then either `write_one` copies the
//! instruction into the translated block or `skip_one` drops it because the
//! virtualizer replaced it.

use std::collections::VecDeque;

use crate::asm::x86_64::*;
use crate::asm::CodeWriter;
use crate::decoder::{self, DecodeError, Insn, InsnId};

/// Longest legal x86 instruction.
const MAX_INSN_LEN: usize = 15;

pub(crate) struct Relocator {
    input_start: *const u8,
    input_cur: *const u8,
    pending: VecDeque<Insn>,
    eob: bool,
    eoi: bool,
}

impl Relocator {
    pub fn new() -> Self {
        Relocator {
            input_start: std::ptr::null(),
            input_cur: std::ptr::null(),
            pending: VecDeque::new(),
            eob: false,
            eoi: false,
        }
    }

    pub fn reset(&mut self, input_code: *const u8) {
        self.input_start = input_code;
        self.input_cur = input_code;
        self.pending.clear();
        self.eob = false;
        self.eoi = false;
    }

    /// Bytes consumed from the guest so far.
    pub fn input_consumed(&self) -> usize {
        self.input_cur as usize - self.input_start as usize
    }

    /// Guest address the next read would decode at.
    pub fn next_input_address(&self) -> u64 {
        self.input_cur as u64
    }

    /// End of block: a control transfer has been read.
    pub fn eob(&self) -> bool {
        self.eob
    }

    /// End of input: execution cannot fall through the last-read insn.
    pub fn eoi(&self) -> bool {
        self.eoi
    }

    /// Whether an instruction has been read but not yet written or skipped.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Decode the next guest instruction.
    pub fn read_one(&mut self) -> Result<Insn, DecodeError> {
        let bytes = unsafe { std::slice::from_raw_parts(self.input_cur, MAX_INSN_LEN) };
        let insn = decoder::decode(bytes, self.input_cur as u64)?;

        match insn.id {
            InsnId::Call => {
                self.eob = true;
                self.eoi = false;
            }
            InsnId::Jmp | InsnId::Ret => {
                self.eob = true;
                self.eoi = true;
            }
            InsnId::Jcc(_) | InsnId::Jcxz | InsnId::Sysenter => {
                self.eob = true;
                self.eoi = false;
            }
            InsnId::Other => {}
        }

        self.input_cur = unsafe { self.input_cur.add(insn.len as usize) };
        self.pending.push_back(insn);
        Ok(insn)
    }

    /// Drop the oldest pending instruction without emitting it.
    pub fn skip_one(&mut self) {
        self.pending.pop_front().expect("no instruction pending");
    }

    /// Emit the oldest pending instruction at the writer's position,
    /// rewriting position-dependent operands.
    pub fn write_one(&mut self, cw: &mut CodeWriter) {
        let insn = self.pending.pop_front().expect("no instruction pending");
        let bytes =
            unsafe { std::slice::from_raw_parts(insn.address as *const u8, insn.len as usize) };

        match insn.id {
            // Copying a direct call keeps its semantics because the pushed
            // return address must point into translated code (the excluded
            // call path depends on exactly that).
            InsnId::Call => {
                if let Some(crate::decoder::BranchKind::Imm(target)) = insn.branch {
                    call_abs(cw, target);
                } else {
                    cw.put_bytes(bytes);
                }
            }
            InsnId::Jmp => {
                if let Some(crate::decoder::BranchKind::Imm(target)) = insn.branch {
                    jmp_abs(cw, target);
                } else {
                    cw.put_bytes(bytes);
                }
            }
            InsnId::Jcc(cc) => {
                if let Some(crate::decoder::BranchKind::Imm(target)) = insn.branch {
                    // Invert over an absolute jump so any displacement fits.
                    let not_taken = cw.new_label();
                    jcc_short_label(cw, cc.negate(), not_taken);
                    jmp_abs(cw, target);
                    cw.put_label(not_taken);
                } else {
                    unreachable!("jcc always has an immediate target");
                }
            }
            InsnId::Jcxz => {
                if let Some(crate::decoder::BranchKind::Imm(target)) = insn.branch {
                    let taken = cw.new_label();
                    let not_taken = cw.new_label();
                    jrcxz_label(cw, taken);
                    jmp_short_label(cw, not_taken);
                    cw.put_label(taken);
                    jmp_abs(cw, target);
                    cw.put_label(not_taken);
                } else {
                    unreachable!("jcxz always has an immediate target");
                }
            }
            InsnId::Ret | InsnId::Sysenter => cw.put_bytes(bytes),
            InsnId::Other => match insn.rip_operand {
                None => cw.put_bytes(bytes),
                Some(rip) => write_rip_relative(cw, bytes, rip),
            },
        }
    }
}

/// Re-emit an instruction whose memory operand was RIP-relative. When the
/// target is still within disp32 range of the new location the displacement
/// is adjusted in place; otherwise the operand is rewritten to go through a
/// scratch register holding the absolute address.
fn write_rip_relative(cw: &mut CodeWriter, bytes: &[u8], rip: crate::decoder::RipOperand) {
    let new_end = cw.pc() + bytes.len() as u64;
    let disp = rip.target.wrapping_sub(new_end) as i64;

    if let Ok(disp) = i32::try_from(disp) {
        let mut patched = bytes.to_vec();
        let at = rip.disp_offset as usize;
        patched[at..at + 4].copy_from_slice(&disp.to_le_bytes());
        cw.put_bytes(&patched);
        return;
    }

    // Pick a scratch register the instruction does not already use. The rm
    // operand is RIP so only the modrm reg field matters.
    let modrm = bytes[rip.modrm_offset as usize];
    let rex_r = rip.rex_offset.map_or(0, |at| (bytes[at as usize] >> 2) & 1);
    let reg_ext = ((modrm >> 3) & 7) | (rex_r << 3);
    let scratch_no = [0u8, 1, 2].into_iter().find(|no| *no != reg_ext).unwrap();
    let scratch = X86Opnd::Reg(X86Reg { num_bits: 64, reg_no: scratch_no });

    push(cw, scratch);
    movabs(cw, scratch, rip.target);

    // Same instruction with rm = scratch, mod = 00 and the disp32 removed
    let mut patched = Vec::with_capacity(bytes.len());
    patched.extend_from_slice(&bytes[..rip.disp_offset as usize]);
    patched.extend_from_slice(&bytes[rip.disp_offset as usize + 4..]);
    patched[rip.modrm_offset as usize] = (modrm & 0x38) | scratch_no;
    if let Some(at) = rip.rex_offset {
        patched[at as usize] &= !0x01; // clear REX.B for the low scratch reg
    }
    cw.put_bytes(&patched);

    pop(cw, scratch);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relocate(code: &[u8]) -> (CodeWriter, Relocator) {
        let mut cw = CodeWriter::new_dummy(4096);
        let mut rl = Relocator::new();
        rl.reset(code.as_ptr());
        let insn = rl.read_one().unwrap();
        let _ = insn;
        rl.write_one(&mut cw);
        cw.flush().unwrap();
        (cw, rl)
    }

    #[test]
    fn plain_instructions_copy_verbatim() {
        let code = [0x48u8, 0x89, 0xd8, 0x90]; // mov rax, rbx; nop
        let (cw, mut rl) = relocate(&code);
        assert_eq!(format!("{:x}", cw), "4889d8");
        assert_eq!(rl.input_consumed(), 3);
        assert!(!rl.eob());

        rl.read_one().unwrap();
        assert_eq!(rl.input_consumed(), 4);
    }

    #[test]
    fn block_ends_at_control_transfer() {
        let code = [0x90u8, 0xc3];
        let mut rl = Relocator::new();
        rl.reset(code.as_ptr());
        rl.read_one().unwrap();
        assert!(!rl.eob());
        let insn = rl.read_one().unwrap();
        assert_eq!(insn.id, InsnId::Ret);
        assert!(rl.eob());
        assert!(rl.eoi());
    }

    #[test]
    fn call_keeps_fallthrough_semantics() {
        let code = [0xe8u8, 0x00, 0x00, 0x00, 0x00]; // call +0
        let mut rl = Relocator::new();
        rl.reset(code.as_ptr());
        rl.read_one().unwrap();
        assert!(rl.eob());
        assert!(!rl.eoi());
    }

    #[test]
    fn near_rip_operand_is_rebased() {
        // lea rax, [rip+0x10]: target = code + 7 + 0x10
        let code = [0x48u8, 0x8d, 0x05, 0x10, 0x00, 0x00, 0x00];
        let mut cw = CodeWriter::new_dummy(4096);
        let mut rl = Relocator::new();
        rl.reset(code.as_ptr());
        let insn = rl.read_one().unwrap();
        let target = insn.rip_operand.unwrap().target;

        rl.write_one(&mut cw);
        cw.flush().unwrap();

        // Same length, adjusted displacement pointing at the old target
        assert_eq!(cw.offset(), 7);
        let emitted = unsafe { std::slice::from_raw_parts(cw.base(), 7) };
        let disp = i32::from_le_bytes(emitted[3..7].try_into().unwrap());
        assert_eq!((cw.base() as u64 + 7).wrapping_add(disp as i64 as u64), target);
    }

    #[test]
    fn skip_one_consumes_without_emitting() {
        let code = [0x90u8, 0x90];
        let mut cw = CodeWriter::new_dummy(64);
        let mut rl = Relocator::new();
        rl.reset(code.as_ptr());
        rl.read_one().unwrap();
        rl.skip_one();
        assert_eq!(cw.offset(), 0);
        assert!(!rl.has_pending());
        let _ = &mut cw;
    }

    #[test]
    fn far_rip_operand_uses_scratch_rewrite() {
        // mov rcx, [rip+0] with a writer parked at an impossible distance
        let code = [0x48u8, 0x8b, 0x0d, 0x00, 0x00, 0x00, 0x00];
        let mut cw = CodeWriter::new_dummy(4096);
        let base = cw.base();
        cw.reset_with_pc(base, 4096, 0x7fff_0000_0000);

        let mut rl = Relocator::new();
        rl.reset(code.as_ptr());
        rl.read_one().unwrap();
        rl.write_one(&mut cw);
        cw.flush().unwrap();

        let emitted = unsafe { std::slice::from_raw_parts(base, cw.offset()) };
        // push rax; movabs rax, target; mov rcx, [rax]; pop rax
        assert_eq!(emitted[0], 0x50);
        assert_eq!(&emitted[1..3], &[0x48, 0xb8]);
        assert_eq!(&emitted[11..14], &[0x48, 0x8b, 0x08]);
        assert_eq!(emitted[14], 0x58);
        let literal = u64::from_le_bytes(emitted[3..11].try_into().unwrap());
        assert_eq!(literal, code.as_ptr() as u64 + 7);
    }
}
