//! Bump-allocated slabs backing the translation cache. A slab is a single
//! mapping carrying its own header; code slabs hold emitted instructions
//! and block snapshots, data slabs hold [crate::block::ExecBlock] records
//! and auxiliary engine data.
//!
//! The layout is `#[repr(C)]` and must not change: the emitted return fast
//! path walks the slab chain with hardcoded field offsets to decide whether
//! a return target is already translated code.

use crate::utils::align_up;

#[repr(C)]
pub(crate) struct Slab {
    pub data: *mut u8,
    pub offset: u32,
    pub size: u32,
    pub next: *mut Slab,
}

#[repr(C)]
pub(crate) struct CodeSlab {
    pub slab: Slab,

    /// Invalidation trampoline shared by every block in this slab.
    pub invalidator: *mut u8,
}

#[repr(C)]
pub(crate) struct DataSlab {
    pub slab: Slab,
}

impl Slab {
    /// # Safety
    /// `header` must point at writable memory of at least `slab_size` bytes
    /// that outlives the slab.
    unsafe fn init(header: *mut Slab, slab_size: usize, header_size: usize) {
        (*header).data = (header as *mut u8).add(header_size);
        (*header).offset = 0;
        (*header).size = (slab_size - header_size) as u32;
        (*header).next = std::ptr::null_mut();
    }

    pub fn available(&self) -> usize {
        (self.size - self.offset) as usize
    }

    pub fn start(&self) -> *mut u8 {
        self.data
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.data.add(self.size as usize) }
    }

    pub fn cursor(&self) -> *mut u8 {
        unsafe { self.data.add(self.offset as usize) }
    }

    pub fn try_reserve(&mut self, size: usize) -> Option<*mut u8> {
        if self.available() < size {
            return None;
        }
        let cursor = self.cursor();
        self.offset += size as u32;
        Some(cursor)
    }

    pub fn reserve(&mut self, size: usize) -> *mut u8 {
        self.try_reserve(size).expect("slab capacity accounting is off")
    }

    pub fn contains(&self, address: *const u8) -> bool {
        address >= self.data as *const u8 && address < self.cursor() as *const u8
    }
}

impl CodeSlab {
    /// The header shares the mapping with emitted code but must keep its
    /// own pages: freezing the body would otherwise make the bump cursor
    /// read-only. Trading a little memory for skipping a thaw per update.
    pub unsafe fn init_at(header: *mut CodeSlab, slab_size: usize, page_size: usize) -> *mut CodeSlab {
        let header_size = align_up(std::mem::size_of::<CodeSlab>(), page_size);
        Slab::init(&mut (*header).slab, slab_size, header_size);
        (*header).invalidator = std::ptr::null_mut();
        header
    }

    /// Scratch slabs are never executed or frozen, so the header needs no
    /// page alignment.
    pub unsafe fn init_scratch_at(header: *mut CodeSlab, slab_size: usize) -> *mut CodeSlab {
        Slab::init(&mut (*header).slab, slab_size, std::mem::size_of::<CodeSlab>());
        (*header).invalidator = std::ptr::null_mut();
        header
    }
}

impl DataSlab {
    pub unsafe fn init_at(header: *mut DataSlab, slab_size: usize) -> *mut DataSlab {
        Slab::init(&mut (*header).slab, slab_size, std::mem::size_of::<DataSlab>());
        header
    }
}

/// Field offsets consumed by emitted code (see the stack-pop-and-go helper).
pub(crate) const SLAB_DATA_OFFSET: i32 = std::mem::offset_of!(Slab, data) as i32;
pub(crate) const SLAB_OFFSET_OFFSET: i32 = std::mem::offset_of!(Slab, offset) as i32;
pub(crate) const SLAB_NEXT_OFFSET: i32 = std::mem::offset_of!(Slab, next) as i32;

#[cfg(test)]
mod tests {
    use super::*;

    fn slab_buffer(size: usize) -> Box<[u8]> {
        vec![0u8; size].into_boxed_slice()
    }

    #[test]
    fn data_slab_bump_allocates_until_full() {
        let mut buf = slab_buffer(256);
        let slab = unsafe { DataSlab::init_at(buf.as_mut_ptr() as *mut DataSlab, 256) };
        let slab = unsafe { &mut (*slab).slab };

        let total = slab.available();
        assert_eq!(total, 256 - std::mem::size_of::<DataSlab>());

        let a = slab.try_reserve(64).unwrap();
        let b = slab.try_reserve(64).unwrap();
        assert_eq!(unsafe { a.add(64) }, b);
        assert_eq!(slab.available(), total - 128);
        assert!(slab.try_reserve(total).is_none());
    }

    #[test]
    fn code_slab_header_is_page_aligned() {
        let page = 4096;
        let mut buf = slab_buffer(page * 4);
        // Interior pointers are fine here: only offsets are checked.
        let slab = unsafe { CodeSlab::init_at(buf.as_mut_ptr() as *mut CodeSlab, page * 4, page) };
        let slab = unsafe { &(*slab).slab };
        assert_eq!(slab.data as usize - buf.as_ptr() as usize, page);
        assert_eq!(slab.size as usize, page * 3);
    }

    #[test]
    fn contains_tracks_the_cursor() {
        let mut buf = slab_buffer(512);
        let slab = unsafe { DataSlab::init_at(buf.as_mut_ptr() as *mut DataSlab, 512) };
        let slab = unsafe { &mut (*slab).slab };

        let chunk = slab.reserve(32);
        assert!(slab.contains(chunk));
        assert!(slab.contains(unsafe { chunk.add(31) }));
        assert!(!slab.contains(unsafe { chunk.add(32) }));
    }

    #[test]
    fn emitted_code_field_offsets() {
        assert_eq!(SLAB_DATA_OFFSET, 0);
        assert_eq!(SLAB_OFFSET_OFFSET, 8);
        assert_eq!(SLAB_NEXT_OFFSET, 16);
    }
}
