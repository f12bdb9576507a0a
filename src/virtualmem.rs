//! Memory management for the translation cache. Deals with virtual memory.
//!
//! Code slabs must be reachable from the owning context with signed 32-bit
//! displacements so helpers can be invoked with `call rel32`, which is why
//! allocation takes an [AddressSpec] rather than letting the kernel pick
//! freely. W^X hosts get explicit thaw (RW) / freeze (RX) transitions
//! around every emission burst; on hosts that tolerate RWX mappings both
//! become no-ops.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::os;

/// Placement constraint: the mapping must end up within `max_distance`
/// bytes of `near` in either direction.
#[derive(Copy, Clone, Debug)]
pub(crate) struct AddressSpec {
    pub near: usize,
    pub max_distance: usize,
}

impl AddressSpec {
    pub fn satisfied_by(&self, address: usize) -> bool {
        self.near.abs_diff(address) <= self.max_distance
    }
}

/// The two syscall groups the engine needs: getting pages and flipping
/// their protection. Split out as a trait so tests can run the full
/// compile/backpatch machinery against plain heap memory.
pub(crate) trait Pages: Send + Sync {
    fn allocate(&self, size: usize, spec: Option<&AddressSpec>) -> Result<NonNull<u8>>;

    fn free(&self, ptr: *mut u8, size: usize);

    #[must_use]
    fn mark_writable(&self, ptr: *const u8, size: usize) -> bool;

    #[must_use]
    fn mark_executable(&self, ptr: *const u8, size: usize) -> bool;

    /// Whether writable+executable mappings are tolerated, i.e. whether
    /// thaw/freeze may collapse to no-ops.
    fn rwx_supported(&self) -> bool;
}

pub(crate) struct SystemPages {
    rwx: bool,
}

impl SystemPages {
    pub fn new() -> Self {
        SystemPages { rwx: probe_rwx_support() }
    }
}

/// Some hardened kernels (PaX/SELinux deny-execmem) refuse PROT_EXEC on
/// writable anonymous mappings. Probe once at startup.
fn probe_rwx_support() -> bool {
    let page = os::page_size();
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            page,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return false;
    }
    unsafe { libc::munmap(ptr, page) };
    true
}

/// How far apart successive placement hints are when hunting for a slot
/// that satisfies the displacement bound.
const NEAR_PROBE_STRIDE: usize = 256 * 1024 * 1024;
const NEAR_PROBE_ATTEMPTS: usize = 15;

impl Pages for SystemPages {
    fn allocate(&self, size: usize, spec: Option<&AddressSpec>) -> Result<NonNull<u8>> {
        let prot = if self.rwx {
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let map_at = |hint: usize| -> Result<*mut u8> {
            let ptr = unsafe { libc::mmap(hint as *mut libc::c_void, size, prot, flags, -1, 0) };
            if ptr == libc::MAP_FAILED {
                return Err(Error::MemoryMap(os::last_os_error()));
            }
            Ok(ptr as *mut u8)
        };

        let spec = match spec {
            None => {
                let ptr = map_at(0)?;
                return Ok(NonNull::new(ptr).unwrap());
            }
            Some(spec) => spec,
        };

        // The kernel treats the address as a hint only, so walk outward
        // from the anchor until a mapping lands inside the bound.
        let page = os::page_size();
        let anchor = spec.near & !(page - 1);
        for attempt in 0..NEAR_PROBE_ATTEMPTS {
            let distance = ((attempt + 1) / 2) * NEAR_PROBE_STRIDE;
            let hint = if attempt % 2 == 0 {
                anchor.saturating_add(distance)
            } else {
                match anchor.checked_sub(distance + size) {
                    Some(hint) => hint,
                    None => continue,
                }
            };

            let ptr = map_at(hint)?;
            if spec.satisfied_by(ptr as usize) && spec.satisfied_by(ptr as usize + size) {
                return Ok(NonNull::new(ptr).unwrap());
            }
            unsafe { libc::munmap(ptr as *mut libc::c_void, size) };
        }

        Err(Error::NearAllocExhausted { near: spec.near })
    }

    fn free(&self, ptr: *mut u8, size: usize) {
        unsafe { libc::munmap(ptr as *mut libc::c_void, size) };
    }

    fn mark_writable(&self, ptr: *const u8, size: usize) -> bool {
        unsafe {
            libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) == 0
        }
    }

    fn mark_executable(&self, ptr: *const u8, size: usize) -> bool {
        unsafe {
            libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_EXEC) == 0
        }
    }

    fn rwx_supported(&self) -> bool {
        self.rwx
    }
}

/// RW-remap `len` bytes ahead of an emission burst. Page-aligns the span
/// because protection is page-granular.
pub(crate) fn thaw(pages: &dyn Pages, code: *const u8, len: usize) {
    if pages.rwx_supported() || len == 0 {
        return;
    }
    let (start, span) = page_span(code, len);
    let ok = pages.mark_writable(start, span);
    debug_assert!(ok, "thaw of {len} bytes at {code:p} failed");
}

/// Make the bytes executable again after emission. x86 keeps instruction
/// and data caches coherent, so no explicit flush is needed here.
pub(crate) fn freeze(pages: &dyn Pages, code: *const u8, len: usize) {
    if pages.rwx_supported() || len == 0 {
        return;
    }
    let (start, span) = page_span(code, len);
    let ok = pages.mark_executable(start, span);
    debug_assert!(ok, "freeze of {len} bytes at {code:p} failed");
}

fn page_span(ptr: *const u8, len: usize) -> (*const u8, usize) {
    let page = os::page_size();
    let start = (ptr as usize) & !(page - 1);
    let end = (ptr as usize + len).next_multiple_of(page);
    (start as *const u8, end - start)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq, Eq)]
    pub enum PageRequest {
        MarkWritable { offset: usize, len: usize },
        MarkExecutable { offset: usize, len: usize },
        Free,
    }

    /// Backs "executable" memory with leaked heap chunks and records every
    /// protection request. Emitted code is never run under test, so no
    /// actual mapping is involved.
    pub struct TestingPages {
        chunks: Mutex<Vec<(usize, usize)>>,
        pub requests: Mutex<Vec<PageRequest>>,
        rwx: bool,
    }

    impl TestingPages {
        pub fn new() -> Self {
            TestingPages { chunks: Mutex::new(Vec::new()), requests: Mutex::new(Vec::new()), rwx: false }
        }

        pub fn new_rwx() -> Self {
            TestingPages { chunks: Mutex::new(Vec::new()), requests: Mutex::new(Vec::new()), rwx: true }
        }

        fn chunk_offset(&self, ptr: *const u8) -> usize {
            let chunks = self.chunks.lock().unwrap();
            for &(base, size) in chunks.iter() {
                let addr = ptr as usize;
                if addr >= base && addr < base + size {
                    return addr - base;
                }
            }
            panic!("pointer {ptr:p} does not belong to any test chunk");
        }
    }

    impl Pages for TestingPages {
        fn allocate(&self, size: usize, _spec: Option<&AddressSpec>) -> Result<NonNull<u8>> {
            // Page-aligned so that thaw/freeze spans stay inside the chunk.
            let layout =
                std::alloc::Layout::from_size_align(size.max(1), crate::os::page_size()).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            self.chunks.lock().unwrap().push((ptr as usize, size));
            Ok(NonNull::new(ptr).unwrap())
        }

        fn free(&self, _ptr: *mut u8, _size: usize) {
            // Chunks are leaked; tests only care that free was requested.
            self.requests.lock().unwrap().push(PageRequest::Free);
        }

        fn mark_writable(&self, ptr: *const u8, size: usize) -> bool {
            let offset = self.chunk_offset(ptr);
            self.requests.lock().unwrap().push(PageRequest::MarkWritable { offset, len: size });
            true
        }

        fn mark_executable(&self, ptr: *const u8, size: usize) -> bool {
            let offset = self.chunk_offset(ptr);
            self.requests.lock().unwrap().push(PageRequest::MarkExecutable { offset, len: size });
            true
        }

        fn rwx_supported(&self) -> bool {
            self.rwx
        }
    }

    #[test]
    fn address_spec_bounds_are_inclusive() {
        let spec = AddressSpec { near: 0x10_0000, max_distance: 0x1000 };
        assert!(spec.satisfied_by(0x10_1000));
        assert!(spec.satisfied_by(0xff000));
        assert!(!spec.satisfied_by(0x10_1001));
    }

    #[test]
    fn system_allocation_without_spec() {
        let pages = SystemPages::new();
        let size = os::page_size();
        let ptr = pages.allocate(size, None).unwrap();
        assert!(pages.mark_writable(ptr.as_ptr(), size));
        unsafe { ptr.as_ptr().write(0xc3) };
        assert!(pages.mark_executable(ptr.as_ptr(), size));
        pages.free(ptr.as_ptr(), size);
    }

    #[test]
    fn near_allocation_lands_within_bound() {
        let pages = SystemPages::new();
        let size = os::page_size();
        let anchor = pages.allocate(size, None).unwrap();
        let spec = AddressSpec { near: anchor.as_ptr() as usize, max_distance: i32::MAX as usize };
        let near = pages.allocate(size, Some(&spec)).unwrap();
        assert!(spec.satisfied_by(near.as_ptr() as usize));
        pages.free(near.as_ptr(), size);
        pages.free(anchor.as_ptr(), size);
    }

    #[test]
    fn thaw_and_freeze_are_noops_on_rwx_hosts() {
        let pages = TestingPages::new_rwx();
        let ptr = pages.allocate(64, None).unwrap();
        thaw(&pages, ptr.as_ptr(), 64);
        freeze(&pages, ptr.as_ptr(), 64);
        assert!(pages.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn thaw_rounds_to_page_granularity() {
        let pages = TestingPages::new();
        let ptr = pages.allocate(os::page_size() * 2, None).unwrap();
        thaw(&pages, unsafe { ptr.as_ptr().add(1) } as *const u8, 16);
        let recorded = pages.requests.lock().unwrap();
        match &recorded[..] {
            [PageRequest::MarkWritable { len, .. }] => assert_eq!(*len % os::page_size(), 0),
            other => panic!("unexpected requests: {other:?}"),
        }
    }
}
