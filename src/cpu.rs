//! Architectural register snapshot shared between emitted prologs and Rust
//! callbacks.

/// Full GPR snapshot captured by the full prolog. The field order matches
/// the save sequence in the emitted helper exactly: the helper pushes `rax`
/// first and `r15` last, then reserves one slot for `rip`, so the lowest
/// stack address holds `rip` and the highest holds `rax`. Callbacks receive
/// a pointer to that frame cast to this struct; do not reorder fields.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuContext {
    pub rip: u64,

    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,

    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct CpuFeatures {
    pub avx2: bool,
}

impl CpuFeatures {
    pub fn detect() -> Self {
        CpuFeatures { avx2: std::arch::is_x86_feature_detected!("avx2") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn context_layout_matches_prolog_frame() {
        // 17 qword slots, rip at the bottom of the frame.
        assert_eq!(size_of::<CpuContext>(), 17 * 8);
        assert_eq!(offset_of!(CpuContext, rip), 0);
        assert_eq!(offset_of!(CpuContext, r15), 8);
        assert_eq!(offset_of!(CpuContext, rsp), 12 * 8);
        assert_eq!(offset_of!(CpuContext, rax), 16 * 8);
    }
}
