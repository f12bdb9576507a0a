//! Host primitives the engine depends on: page queries, thread identity,
//! and the suspend-and-modify capability used for foreign threads.

use std::io;

use crate::cpu::CpuContext;
use crate::error::{Error, Result};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(pub u64);

pub(crate) fn current_thread_id() -> ThreadId {
    // gettid(2) never fails
    ThreadId(unsafe { libc::syscall(libc::SYS_gettid) } as u64)
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Whether the thread still exists in this process.
pub(crate) fn has_thread(id: ThreadId) -> bool {
    std::path::Path::new(&format!("/proc/self/task/{}", id.0)).exists()
}

/// Check that `len` bytes at `addr` are mapped readable. msync(2) reports
/// ENOMEM for unmapped ranges without touching the pages.
pub(crate) fn ensure_readable(addr: *const u8, len: usize) -> Result<()> {
    let page = page_size();
    let start = (addr as usize) & !(page - 1);
    let span = (addr as usize + len).next_multiple_of(page) - start;
    let ret = unsafe { libc::msync(start as *mut libc::c_void, span, libc::MS_ASYNC) };
    if ret != 0 {
        return Err(Error::GuestUnreadable(addr as usize));
    }
    Ok(())
}

/// Suspend-and-modify primitive for threads other than the caller.
///
/// Following, unfollowing and invalidating a foreign thread all need to stop
/// that thread, inspect or rewrite its register state, and resume it. How
/// that is done is deeply platform-specific (ptrace from a helper process,
/// signals plus a handshake, a debugger transport), so the engine consumes
/// it as a collaborator. Operations on the current thread never use this.
pub trait ThreadControl: Send + Sync {
    /// Stop `thread`, hand its context to `f`, write any mutation back, and
    /// resume it. Returns false if the thread could not be stopped.
    fn modify_thread(&self, thread: ThreadId, f: &mut dyn FnMut(&mut CpuContext)) -> bool;
}

/// Placeholder used when the embedder supplies no [ThreadControl]. Remote
/// operations fail with [Error::Unsupported] instead of degrading silently.
pub(crate) struct NoThreadControl;

impl ThreadControl for NoThreadControl {
    fn modify_thread(&self, _thread: ThreadId, _f: &mut dyn FnMut(&mut CpuContext)) -> bool {
        false
    }
}

pub(crate) fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records modify_thread requests and replays a canned context, so the
    /// infect/disinfect paths are testable without stopping real threads.
    pub struct ScriptedThreads {
        pub contexts: Mutex<Vec<(ThreadId, CpuContext)>>,
    }

    impl ScriptedThreads {
        pub fn with_thread(id: ThreadId, ctx: CpuContext) -> Self {
            ScriptedThreads { contexts: Mutex::new(vec![(id, ctx)]) }
        }
    }

    impl ThreadControl for ScriptedThreads {
        fn modify_thread(&self, thread: ThreadId, f: &mut dyn FnMut(&mut CpuContext)) -> bool {
            let mut contexts = self.contexts.lock().unwrap();
            match contexts.iter_mut().find(|(id, _)| *id == thread) {
                Some((_, ctx)) => {
                    f(ctx);
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn current_thread_is_alive() {
        assert!(has_thread(current_thread_id()));
    }

    #[test]
    fn stack_memory_is_readable() {
        let local = 0u64;
        ensure_readable(&local as *const u64 as *const u8, 8).unwrap();
    }

    #[test]
    fn null_page_is_not_readable() {
        assert!(ensure_readable(8 as *const u8, 8).is_err());
    }
}
