//! Debug rendering of translated code. Only compiled with the `disasm`
//! feature since it pulls in capstone.

#![cfg_attr(not(feature = "disasm"), allow(dead_code))]

#[cfg(feature = "disasm")]
pub fn disasm_bytes(code: &[u8], address: u64) -> String {
    use capstone::prelude::*;

    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .expect("failed to construct capstone");

    let mut out = String::new();
    match cs.disasm_all(code, address) {
        Ok(insns) => {
            for insn in insns.as_ref() {
                out.push_str(&format!(
                    "  {:#18x}: {:<8} {}\n",
                    insn.address(),
                    insn.mnemonic().unwrap_or(""),
                    insn.op_str().unwrap_or(""),
                ));
            }
        }
        Err(err) => out.push_str(&format!("  <disassembly failed: {err}>\n")),
    }
    out
}

#[cfg(not(feature = "disasm"))]
pub fn disasm_bytes(code: &[u8], address: u64) -> String {
    let mut out = String::new();
    for (index, chunk) in code.chunks(16).enumerate() {
        out.push_str(&format!("  {:#18x}:", address + (index * 16) as u64));
        for byte in chunk {
            out.push_str(&format!(" {byte:02x}"));
        }
        out.push('\n');
    }
    out
}
