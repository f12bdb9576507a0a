//! x86-64 instruction emitters used by the virtualizer and helper writers.
//! Only the encodings the engine emits are implemented; operands are 32- or
//! 64-bit (the translated sequences never manipulate smaller widths).

use crate::asm::{CodeWriter, Label};

/// General-purpose register operand
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct X86Reg
{
    // Size in bits
    pub num_bits: u8,

    // Register number (REX extension bit included)
    pub reg_no: u8,
}

/// Memory operand: [base + index * 2^scale_exp + disp]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct X86Mem
{
    pub num_bits: u8,

    pub base: Option<u8>,

    pub index: Option<u8>,

    pub scale_exp: u8,

    pub disp: i32,
}

/// Operand to an x86 instruction
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum X86Opnd
{
    // Dummy operand
    None,

    // General-purpose register
    Reg(X86Reg),

    // Memory location
    Mem(X86Mem),

    // Absolute address encoded RIP-relative. Only valid when the target is
    // within disp32 range of the emission PC, which the slab placement
    // guarantees for engine-owned data.
    IPRel(u64),

    // Signed immediate
    Imm(i64),

    // Unsigned immediate
    UImm(u64),
}

const fn reg64(reg_no: u8) -> X86Opnd { X86Opnd::Reg(X86Reg { num_bits: 64, reg_no }) }

pub const RAX: X86Opnd = reg64(0);
pub const RCX: X86Opnd = reg64(1);
pub const RDX: X86Opnd = reg64(2);
pub const RBX: X86Opnd = reg64(3);
pub const RSP: X86Opnd = reg64(4);
pub const RBP: X86Opnd = reg64(5);
pub const RSI: X86Opnd = reg64(6);
pub const RDI: X86Opnd = reg64(7);
pub const R8:  X86Opnd = reg64(8);
pub const R9:  X86Opnd = reg64(9);
pub const R10: X86Opnd = reg64(10);
pub const R11: X86Opnd = reg64(11);
pub const R12: X86Opnd = reg64(12);
pub const R13: X86Opnd = reg64(13);
pub const R14: X86Opnd = reg64(14);
pub const R15: X86Opnd = reg64(15);

/// System V argument registers, in order.
pub const C_ARG_REGS: [X86Opnd; 6] = [RDI, RSI, RDX, RCX, R8, R9];

pub fn mem_opnd(num_bits: u8, base: X86Opnd, disp: i32) -> X86Opnd
{
    let base_no = match base {
        X86Opnd::Reg(reg) => reg.reg_no,
        _ => unreachable!("memory base must be a register"),
    };
    X86Opnd::Mem(X86Mem { num_bits, base: Some(base_no), index: None, scale_exp: 0, disp })
}

pub fn mem_opnd_sib(num_bits: u8, base: X86Opnd, index: X86Opnd, scale: u8, disp: i32) -> X86Opnd
{
    let base_no = match base {
        X86Opnd::Reg(reg) => reg.reg_no,
        _ => unreachable!("memory base must be a register"),
    };
    let index_no = match index {
        X86Opnd::Reg(reg) => reg.reg_no,
        _ => unreachable!("memory index must be a register"),
    };
    let scale_exp = match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => unreachable!("invalid scale"),
    };
    X86Opnd::Mem(X86Mem { num_bits, base: Some(base_no), index: Some(index_no), scale_exp, disp })
}

/// Absolute [disp32] addressing (no base, no index).
pub fn mem_abs(num_bits: u8, address: u32) -> X86Opnd
{
    X86Opnd::Mem(X86Mem { num_bits, base: None, index: None, scale_exp: 0, disp: address as i32 })
}

pub fn ip_rel(address: u64) -> X86Opnd
{
    X86Opnd::IPRel(address)
}

pub fn imm_opnd(value: i64) -> X86Opnd
{
    X86Opnd::Imm(value)
}

pub fn uimm_opnd(value: u64) -> X86Opnd
{
    X86Opnd::UImm(value)
}

impl X86Opnd
{
    fn reg(self) -> X86Reg
    {
        match self {
            X86Opnd::Reg(reg) => reg,
            _ => unreachable!("register operand expected"),
        }
    }
}

/// Condition code nibble for jcc/setcc encodings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cc(pub u8);

impl Cc
{
    pub const O:  Cc = Cc(0x0);
    pub const NO: Cc = Cc(0x1);
    pub const B:  Cc = Cc(0x2);
    pub const AE: Cc = Cc(0x3);
    pub const E:  Cc = Cc(0x4);
    pub const NE: Cc = Cc(0x5);
    pub const BE: Cc = Cc(0x6);
    pub const A:  Cc = Cc(0x7);
    pub const S:  Cc = Cc(0x8);
    pub const NS: Cc = Cc(0x9);
    pub const P:  Cc = Cc(0xa);
    pub const NP: Cc = Cc(0xb);
    pub const L:  Cc = Cc(0xc);
    pub const GE: Cc = Cc(0xd);
    pub const LE: Cc = Cc(0xe);
    pub const G:  Cc = Cc(0xf);

    /// The inverse condition; the low bit of the nibble flips it.
    pub fn negate(self) -> Cc
    {
        Cc(self.0 ^ 1)
    }
}

// Write the REX byte if any extension bit is needed
fn write_rex(cw: &mut CodeWriter, w_flag: bool, reg_no: u8, idx_reg_no: u8, rm_reg_no: u8)
{
    let w = if w_flag { 1 } else { 0 };
    let r = (reg_no >> 3) & 1;
    let x = (idx_reg_no >> 3) & 1;
    let b = (rm_reg_no >> 3) & 1;

    if w | r | x | b != 0 {
        cw.put_u8(0x40 | (w << 3) | (r << 2) | (x << 1) | b);
    }
}

/// Write opcode bytes, a modrm/sib/disp sequence for `rm`, with the given
/// value in the modrm reg field. `trailing_imm` is the byte length of any
/// immediate the caller will append, needed to compute RIP-relative
/// displacements against the end of the instruction.
fn write_rm(cw: &mut CodeWriter, rex_w: bool, reg_field: u8, rm: X86Opnd, opcode: &[u8], trailing_imm: usize)
{
    let (idx_no, rm_no) = match rm {
        X86Opnd::Reg(reg) => (0, reg.reg_no),
        X86Opnd::Mem(mem) => (mem.index.unwrap_or(0), mem.base.unwrap_or(0)),
        X86Opnd::IPRel(_) => (0, 0),
        _ => unreachable!("not an r/m operand"),
    };

    write_rex(cw, rex_w, reg_field, idx_no, rm_no);
    cw.put_bytes(opcode);

    let reg_bits = (reg_field & 7) << 3;

    match rm {
        X86Opnd::Reg(reg) => {
            cw.put_u8(0xc0 | reg_bits | (reg.reg_no & 7));
        }

        X86Opnd::IPRel(target) => {
            cw.put_u8(reg_bits | 0x05);
            let next_pc = cw.pc() + 4 + trailing_imm as u64;
            let disp = target.wrapping_sub(next_pc) as i64;
            let disp: i32 = disp.try_into().expect("RIP-relative target out of disp32 range");
            cw.put_u32(disp as u32);
        }

        X86Opnd::Mem(mem) => {
            match (mem.base, mem.index) {
                // Absolute [disp32] goes through a SIB byte with no base;
                // plain mod=00/rm=101 would be RIP-relative in long mode.
                (None, None) => {
                    cw.put_u8(reg_bits | 0x04);
                    cw.put_u8(0x25);
                    cw.put_u32(mem.disp as u32);
                }

                (Some(base), index) => {
                    let base_low = base & 7;
                    let needs_sib = index.is_some() || base_low == 4;

                    // RBP/R13 as base cannot use mod=00
                    let (modbits, disp_size) = if mem.disp == 0 && base_low != 5 {
                        (0x00u8, 0)
                    } else if i8::try_from(mem.disp).is_ok() {
                        (0x40u8, 1)
                    } else {
                        (0x80u8, 4)
                    };

                    if needs_sib {
                        cw.put_u8(modbits | reg_bits | 0x04);
                        let index_bits = index.map_or(0x04, |idx| idx & 7);
                        cw.put_u8((mem.scale_exp << 6) | (index_bits << 3) | base_low);
                    } else {
                        cw.put_u8(modbits | reg_bits | base_low);
                    }

                    match disp_size {
                        0 => {}
                        1 => cw.put_u8(mem.disp as i8 as u8),
                        _ => cw.put_u32(mem.disp as u32),
                    }
                }

                (None, Some(_)) => unreachable!("index without base is not emitted"),
            }
        }

        _ => unreachable!(),
    }
}

fn opnd_num_bits(opnd: X86Opnd) -> u8
{
    match opnd {
        X86Opnd::Reg(reg) => reg.num_bits,
        X86Opnd::Mem(mem) => mem.num_bits,
        X86Opnd::IPRel(_) => 64,
        _ => 64,
    }
}

// Encode an ALU op in its reg/rm, rm/reg and rm/imm forms
// (add = 0, sub = 5, and = 4, cmp = 7)
fn write_alu(cw: &mut CodeWriter, op_ext: u8, opnd0: X86Opnd, opnd1: X86Opnd)
{
    let rex_w = opnd_num_bits(opnd0) == 64;

    match (opnd0, opnd1) {
        // op rm, reg
        (X86Opnd::Mem(_) | X86Opnd::IPRel(_), X86Opnd::Reg(reg)) => {
            write_rm(cw, rex_w, reg.reg_no, opnd0, &[(op_ext << 3) | 0x01], 0);
        }
        (X86Opnd::Reg(dst), X86Opnd::Reg(_)) => {
            write_rm(cw, rex_w, opnd1.reg().reg_no, X86Opnd::Reg(dst), &[(op_ext << 3) | 0x01], 0);
        }

        // op reg, rm
        (X86Opnd::Reg(reg), X86Opnd::Mem(_) | X86Opnd::IPRel(_)) => {
            write_rm(cw, rex_w, reg.reg_no, opnd1, &[(op_ext << 3) | 0x03], 0);
        }

        // op rm, imm
        (_, X86Opnd::Imm(value)) => {
            if let Ok(value) = i8::try_from(value) {
                write_rm(cw, rex_w, op_ext, opnd0, &[0x83], 1);
                cw.put_u8(value as u8);
            } else {
                let value = i32::try_from(value).expect("immediate too wide for ALU op");
                write_rm(cw, rex_w, op_ext, opnd0, &[0x81], 4);
                cw.put_u32(value as u32);
            }
        }
        (_, X86Opnd::UImm(value)) => {
            write_alu(cw, op_ext, opnd0, X86Opnd::Imm(i64::try_from(value).unwrap()));
        }

        _ => unreachable!("unsupported ALU operand combination"),
    }
}

pub fn add(cw: &mut CodeWriter, opnd0: X86Opnd, opnd1: X86Opnd) { write_alu(cw, 0, opnd0, opnd1); }
pub fn or(cw: &mut CodeWriter, opnd0: X86Opnd, opnd1: X86Opnd)  { write_alu(cw, 1, opnd0, opnd1); }
pub fn and(cw: &mut CodeWriter, opnd0: X86Opnd, opnd1: X86Opnd) { write_alu(cw, 4, opnd0, opnd1); }
pub fn sub(cw: &mut CodeWriter, opnd0: X86Opnd, opnd1: X86Opnd) { write_alu(cw, 5, opnd0, opnd1); }
pub fn xor(cw: &mut CodeWriter, opnd0: X86Opnd, opnd1: X86Opnd) { write_alu(cw, 6, opnd0, opnd1); }
pub fn cmp(cw: &mut CodeWriter, opnd0: X86Opnd, opnd1: X86Opnd) { write_alu(cw, 7, opnd0, opnd1); }

/// mov dword [slot], imm32 with the slot encoded RIP-relative.
pub fn mov_abs32(cw: &mut CodeWriter, slot: u64, value: u32)
{
    write_rm(cw, false, 0, X86Opnd::IPRel(slot), &[0xc7], 4);
    cw.put_u32(value);
}

pub fn mov(cw: &mut CodeWriter, dst: X86Opnd, src: X86Opnd)
{
    let rex_w = opnd_num_bits(dst) == 64;

    match (dst, src) {
        (X86Opnd::Reg(reg), X86Opnd::Mem(_) | X86Opnd::IPRel(_)) => {
            write_rm(cw, rex_w, reg.reg_no, src, &[0x8b], 0);
        }
        (X86Opnd::Mem(_) | X86Opnd::IPRel(_), X86Opnd::Reg(reg)) => {
            write_rm(cw, rex_w, reg.reg_no, dst, &[0x89], 0);
        }
        (X86Opnd::Reg(_), X86Opnd::Reg(src_reg)) => {
            write_rm(cw, rex_w, src_reg.reg_no, dst, &[0x89], 0);
        }
        (X86Opnd::Reg(reg), X86Opnd::Imm(value)) => {
            if let Ok(value) = i32::try_from(value) {
                write_rm(cw, rex_w, 0, dst, &[0xc7], 4);
                cw.put_u32(value as u32);
            } else {
                movabs(cw, X86Opnd::Reg(reg), value as u64);
            }
        }
        (X86Opnd::Reg(reg), X86Opnd::UImm(value)) => {
            match i32::try_from(value as i64) {
                Ok(value) => {
                    write_rm(cw, rex_w, 0, dst, &[0xc7], 4);
                    cw.put_u32(value as u32);
                }
                Err(_) => movabs(cw, X86Opnd::Reg(reg), value),
            }
        }
        (X86Opnd::Mem(_) | X86Opnd::IPRel(_), X86Opnd::Imm(value)) => {
            let value = i32::try_from(value).expect("store immediate too wide");
            write_rm(cw, rex_w, 0, dst, &[0xc7], 4);
            cw.put_u32(value as u32);
        }
        _ => unreachable!("unsupported mov operand combination"),
    }
}

/// mov reg, imm64
pub fn movabs(cw: &mut CodeWriter, dst: X86Opnd, value: u64)
{
    let reg = dst.reg();
    write_rex(cw, true, 0, 0, reg.reg_no);
    cw.put_u8(0xb8 | (reg.reg_no & 7));
    cw.put_u64(value);
}

pub fn lea(cw: &mut CodeWriter, dst: X86Opnd, src: X86Opnd)
{
    write_rm(cw, true, dst.reg().reg_no, src, &[0x8d], 0);
}

pub fn test(cw: &mut CodeWriter, opnd0: X86Opnd, opnd1: X86Opnd)
{
    match (opnd0, opnd1) {
        (_, X86Opnd::Reg(reg)) => {
            write_rm(cw, opnd_num_bits(opnd0) == 64, reg.reg_no, opnd0, &[0x85], 0);
        }
        (_, X86Opnd::UImm(value)) => {
            let value = u32::try_from(value).expect("test immediate too wide");
            write_rm(cw, opnd_num_bits(opnd0) == 64, 0, opnd0, &[0xf7], 4);
            cw.put_u32(value);
        }
        _ => unreachable!("unsupported test operand combination"),
    }
}

pub fn xchg(cw: &mut CodeWriter, rm_opnd: X86Opnd, r_opnd: X86Opnd)
{
    write_rm(cw, true, r_opnd.reg().reg_no, rm_opnd, &[0x87], 0);
}

pub fn push(cw: &mut CodeWriter, opnd: X86Opnd)
{
    match opnd {
        X86Opnd::Reg(reg) => {
            write_rex(cw, false, 0, 0, reg.reg_no);
            cw.put_u8(0x50 | (reg.reg_no & 7));
        }
        X86Opnd::Mem(_) | X86Opnd::IPRel(_) => {
            write_rm(cw, false, 6, opnd, &[0xff], 0);
        }
        _ => unreachable!("unsupported push operand"),
    }
}

pub fn pop(cw: &mut CodeWriter, opnd: X86Opnd)
{
    let reg = opnd.reg();
    write_rex(cw, false, 0, 0, reg.reg_no);
    cw.put_u8(0x58 | (reg.reg_no & 7));
}

pub fn pushfq(cw: &mut CodeWriter) { cw.put_u8(0x9c); }
pub fn popfq(cw: &mut CodeWriter)  { cw.put_u8(0x9d); }
pub fn ret(cw: &mut CodeWriter)    { cw.put_u8(0xc3); }
pub fn int3(cw: &mut CodeWriter)   { cw.put_u8(0xcc); }
pub fn nop(cw: &mut CodeWriter)    { cw.put_u8(0x90); }
pub fn cld(cw: &mut CodeWriter)    { cw.put_u8(0xfc); }

pub fn ud2(cw: &mut CodeWriter)
{
    cw.put_bytes(&[0x0f, 0x0b]);
}

/// inc dword [mem]
pub fn inc_mem32(cw: &mut CodeWriter, mem: X86Opnd)
{
    write_rm(cw, false, 0, mem, &[0xff], 0);
}

/// dec dword [mem]
pub fn dec_mem32(cw: &mut CodeWriter, mem: X86Opnd)
{
    write_rm(cw, false, 1, mem, &[0xff], 0);
}

pub fn call(cw: &mut CodeWriter, opnd: X86Opnd)
{
    write_rm(cw, false, 2, opnd, &[0xff], 0);
}

pub fn call_label(cw: &mut CodeWriter, label: Label)
{
    cw.put_u8(0xe8);
    cw.put_label_ref32(label);
}

/// Call an absolute address: `call rel32` when reachable, otherwise an
/// inline-literal indirect call.
pub fn call_abs(cw: &mut CodeWriter, target: u64)
{
    if CodeWriter::can_branch_directly_between(cw.pc(), target) {
        cw.put_u8(0xe8);
        let rel = target.wrapping_sub(cw.pc() + 4) as u32;
        cw.put_u32(rel);
    } else {
        // call [rip+2]; jmp short +8; dq target
        cw.put_bytes(&[0xff, 0x15, 0x02, 0x00, 0x00, 0x00]);
        cw.put_bytes(&[0xeb, 0x08]);
        cw.put_u64(target);
    }
}

pub fn jmp_abs(cw: &mut CodeWriter, target: u64)
{
    if CodeWriter::can_branch_directly_between(cw.pc(), target) {
        cw.put_u8(0xe9);
        let rel = target.wrapping_sub(cw.pc() + 4) as u32;
        cw.put_u32(rel);
    } else {
        // jmp [rip+0]; dq target
        cw.put_bytes(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
        cw.put_u64(target);
    }
}

/// jmp qword [address] with the slot encoded RIP-relative.
pub fn jmp_riprel(cw: &mut CodeWriter, slot_address: u64)
{
    write_rm(cw, false, 4, X86Opnd::IPRel(slot_address), &[0xff], 0);
}

pub fn jmp_rm(cw: &mut CodeWriter, opnd: X86Opnd)
{
    write_rm(cw, false, 4, opnd, &[0xff], 0);
}

pub fn jmp_label(cw: &mut CodeWriter, label: Label)
{
    cw.put_u8(0xe9);
    cw.put_label_ref32(label);
}

pub fn jmp_short_label(cw: &mut CodeWriter, label: Label)
{
    cw.put_u8(0xeb);
    cw.put_label_ref8(label);
}

pub fn jcc_label(cw: &mut CodeWriter, cc: Cc, label: Label)
{
    cw.put_bytes(&[0x0f, 0x80 | cc.0]);
    cw.put_label_ref32(label);
}

pub fn jcc_short_label(cw: &mut CodeWriter, cc: Cc, label: Label)
{
    cw.put_u8(0x70 | cc.0);
    cw.put_label_ref8(label);
}

/// jrcxz: only has a rel8 form.
pub fn jrcxz_label(cw: &mut CodeWriter, label: Label)
{
    cw.put_u8(0xe3);
    cw.put_label_ref8(label);
}

#[cfg(test)]
mod tests
{
    use super::*;

    /// Check that the bytes for an instruction sequence match a hex string
    fn check_bytes<R>(bytes: &str, run: R) where R: FnOnce(&mut CodeWriter) {
        let mut cw = CodeWriter::new_dummy(4096);
        run(&mut cw);
        cw.flush().unwrap();
        assert_eq!(format!("{:x}", cw), bytes);
    }

    #[test]
    fn test_push_pop()
    {
        check_bytes("50", |cw| push(cw, RAX));
        check_bytes("4150", |cw| push(cw, R8));
        check_bytes("59", |cw| pop(cw, RCX));
        check_bytes("415b", |cw| pop(cw, R11));
        check_bytes("ff3424", |cw| push(cw, mem_opnd(64, RSP, 0)));
        check_bytes("9c9d", |cw| { pushfq(cw); popfq(cw); });
        check_bytes("48810c2400010000", |cw| or(cw, mem_opnd(64, RSP, 0), imm_opnd(0x100)));
    }

    #[test]
    fn test_mov()
    {
        check_bytes("4889d8", |cw| mov(cw, RAX, RBX));
        check_bytes("488b442408", |cw| mov(cw, RAX, mem_opnd(64, RSP, 8)));
        check_bytes("48890b", |cw| mov(cw, mem_opnd(64, RBX, 0), RCX));
        check_bytes("48c7c011000000", |cw| mov(cw, RAX, imm_opnd(17)));
        check_bytes("48b88877665544332211", |cw| movabs(cw, RAX, 0x1122334455667788));
        check_bytes("48891c24", |cw| mov(cw, mem_opnd(64, RSP, 0), RBX));
        check_bytes("4d8b6500", |cw| mov(cw, R12, mem_opnd(64, R13, 0)));
    }

    #[test]
    fn test_mov_rip_relative()
    {
        // Slot 0x100 bytes past the start: disp = 0x100 - 7
        let mut cw = CodeWriter::new_dummy(4096);
        let slot = cw.pc() + 0x100;
        mov(&mut cw, RAX, ip_rel(slot));
        cw.flush().unwrap();
        assert_eq!(format!("{:x}", cw), "488b05f9000000");
    }

    #[test]
    fn test_alu()
    {
        check_bytes("4883c008", |cw| add(cw, RAX, imm_opnd(8)));
        check_bytes("4881ec00020000", |cw| sub(cw, RSP, imm_opnd(512)));
        check_bytes("4883e4f0", |cw| and(cw, RSP, imm_opnd(-16)));
        check_bytes("48394c2418", |cw| cmp(cw, mem_opnd(64, RSP, 0x18), RCX));
        check_bytes("4839d9", |cw| cmp(cw, RCX, RBX));
        check_bytes("4883f800", |cw| cmp(cw, RAX, imm_opnd(0)));
        check_bytes("4801d0", |cw| add(cw, RAX, RDX));
    }

    #[test]
    fn test_test_xchg()
    {
        check_bytes("4885c0", |cw| test(cw, RAX, RAX));
        check_bytes("48f7c0ff0f0000", |cw| test(cw, RAX, uimm_opnd(0xfff)));
        check_bytes("48873c24", |cw| xchg(cw, mem_opnd(64, RSP, 0), RDI));
    }

    #[test]
    fn test_lea()
    {
        check_bytes("488d642480", |cw| lea(cw, RSP, mem_opnd(64, RSP, -128)));
        check_bytes("488d8424f0000000", |cw| lea(cw, RAX, mem_opnd(64, RSP, 0xf0)));
    }

    #[test]
    fn test_inc_dec()
    {
        check_bytes("ff00", |cw| inc_mem32(cw, mem_opnd(32, RAX, 0)));
        check_bytes("ff08", |cw| dec_mem32(cw, mem_opnd(32, RAX, 0)));
    }

    #[test]
    fn test_calls_and_jumps()
    {
        check_bytes("ffd0", |cw| call(cw, RAX));
        check_bytes("ffe0", |cw| jmp_rm(cw, RAX));
        check_bytes("ff20", |cw| jmp_rm(cw, mem_opnd(64, RAX, 0)));

        // Direct call to a reachable address
        let mut cw = CodeWriter::new_dummy(4096);
        let target = cw.pc(); // rel32 = -5
        call_abs(&mut cw, target);
        assert_eq!(format!("{:x}", cw), "e8fbffffff");

        // Unreachable target takes the inline-literal form
        let mut cw = CodeWriter::new_dummy(4096);
        jmp_abs(&mut cw, u64::MAX / 2);
        assert!(format!("{:x}", cw).starts_with("ff2500000000"));
    }

    #[test]
    fn test_jcc()
    {
        check_bytes("0f84040000004883c008", |cw| {
            let skip = cw.new_label();
            jcc_label(cw, Cc::E, skip);
            add(cw, RAX, imm_opnd(8));
            cw.put_label(skip);
        });
        check_bytes("e3019c", |cw| {
            let taken = cw.new_label();
            jrcxz_label(cw, taken);
            pushfq(cw);
            cw.put_label(taken);
        });
        assert_eq!(Cc::E.negate(), Cc::NE);
        assert_eq!(Cc::L.negate(), Cc::GE);
    }

    #[test]
    fn test_sib_forms()
    {
        check_bytes("488b04c8", |cw| mov(cw, RAX, mem_opnd_sib(64, RAX, RCX, 8, 0)));
        check_bytes("488b042544332211", |cw| mov(cw, RAX, mem_abs(64, 0x11223344)));
    }
}
