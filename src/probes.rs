//! Call probes: user callbacks fired whenever translated code calls a
//! registered guest address. Registration from any thread; invocation on
//! the followed thread under a full prolog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cpu::CpuContext;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ProbeId(pub u32);

/// Snapshot of the intercepted call, handed to every probe callback.
pub struct CallDetails<'a> {
    pub target_address: usize,
    pub return_address: usize,
    /// Pointer to the return-address slot on the guest stack; probes may
    /// inspect the outgoing argument area through it.
    pub stack_data: *mut usize,
    pub cpu_context: &'a mut CpuContext,
}

pub type ProbeCallback = Box<dyn Fn(&mut CallDetails) + Send + Sync>;

pub(crate) struct CallProbe {
    pub id: ProbeId,
    pub callback: ProbeCallback,
}

#[derive(Default)]
struct ProbeTables {
    target_by_id: HashMap<ProbeId, usize>,
    probes_by_address: HashMap<usize, Vec<Arc<CallProbe>>>,
}

pub(crate) struct ProbeRegistry {
    tables: Mutex<ProbeTables>,
    /// Cheap gate consulted by every block compilation.
    any_attached: AtomicBool,
    last_id: AtomicU32,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        ProbeRegistry {
            tables: Mutex::new(ProbeTables::default()),
            any_attached: AtomicBool::new(false),
            last_id: AtomicU32::new(0),
        }
    }

    pub fn any_attached(&self) -> bool {
        self.any_attached.load(Ordering::Acquire)
    }

    /// Returns the new probe's id and whether it is the first one for this
    /// target (the caller must then invalidate existing translations).
    pub fn add(&self, target: usize, callback: ProbeCallback) -> (ProbeId, bool) {
        let id = ProbeId(self.last_id.fetch_add(1, Ordering::SeqCst) + 1);
        let probe = Arc::new(CallProbe { id, callback });

        let mut tables = self.tables.lock().unwrap();
        tables.target_by_id.insert(id, target);
        let probes = tables.probes_by_address.entry(target).or_default();
        let is_first_for_target = probes.is_empty();
        probes.push(probe);
        self.any_attached.store(true, Ordering::Release);

        (id, is_first_for_target)
    }

    /// Returns the removed probe's target and whether it was the last one
    /// there, or `None` for an unknown id.
    pub fn remove(&self, id: ProbeId) -> Option<(usize, bool)> {
        let mut tables = self.tables.lock().unwrap();
        let target = tables.target_by_id.remove(&id)?;

        let probes = tables.probes_by_address.get_mut(&target).expect("probe tables diverged");
        probes.retain(|probe| probe.id != id);
        let is_last_for_target = probes.is_empty();
        if is_last_for_target {
            tables.probes_by_address.remove(&target);
        }
        self.any_attached.store(!tables.probes_by_address.is_empty(), Ordering::Release);

        Some((target, is_last_for_target))
    }

    pub fn clear(&self) {
        let mut tables = self.tables.lock().unwrap();
        tables.target_by_id.clear();
        tables.probes_by_address.clear();
        self.any_attached.store(false, Ordering::Release);
    }

    pub fn has_probes_for(&self, target: usize) -> bool {
        self.tables.lock().unwrap().probes_by_address.contains_key(&target)
    }

    /// Snapshot the probe list for `target` so callbacks run outside the
    /// lock (a callback may itself add or remove probes).
    fn snapshot_for(&self, target: usize) -> Vec<Arc<CallProbe>> {
        self.tables
            .lock()
            .unwrap()
            .probes_by_address
            .get(&target)
            .map(|probes| probes.to_vec())
            .unwrap_or_default()
    }

    /// Fire every probe registered for `target`. The cpu context reflects
    /// the state at block entry; `rip` is pinned to the call target first.
    pub fn invoke(&self, target: usize, cpu_context: &mut CpuContext) {
        let probes = self.snapshot_for(target);
        if probes.is_empty() {
            return;
        }

        let return_address_slot = cpu_context.rsp as *mut usize;
        cpu_context.rip = target as u64;

        for probe in probes {
            let mut details = CallDetails {
                target_address: target,
                return_address: unsafe { *return_address_slot },
                stack_data: return_address_slot,
                cpu_context: &mut *cpu_context,
            };
            (probe.callback)(&mut details);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn add_and_remove_track_first_and_last() {
        let registry = ProbeRegistry::new();
        assert!(!registry.any_attached());

        let (a, first_a) = registry.add(0x1000, Box::new(|_| {}));
        assert!(first_a);
        let (b, first_b) = registry.add(0x1000, Box::new(|_| {}));
        assert!(!first_b);
        assert!(registry.any_attached());
        assert!(registry.has_probes_for(0x1000));

        assert_eq!(registry.remove(a), Some((0x1000, false)));
        assert_eq!(registry.remove(b), Some((0x1000, true)));
        assert!(!registry.any_attached());
        assert_eq!(registry.remove(b), None);
    }

    #[test]
    fn ids_are_never_reused() {
        let registry = ProbeRegistry::new();
        let (a, _) = registry.add(0x1000, Box::new(|_| {}));
        registry.remove(a);
        let (b, _) = registry.add(0x1000, Box::new(|_| {}));
        assert_ne!(a, b);
    }

    #[test]
    fn invoke_runs_probes_in_registration_order() {
        let registry = ProbeRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in [1usize, 2, 3] {
            let order = order.clone();
            registry.add(0x4000, Box::new(move |_| order.lock().unwrap().push(tag)));
        }

        let stack_slot: usize = 0xdead_0000;
        let mut cpu = CpuContext { rsp: &stack_slot as *const usize as u64, ..Default::default() };
        registry.invoke(0x4000, &mut cpu);

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(cpu.rip, 0x4000);
    }

    #[test]
    fn probes_see_the_return_address() {
        let registry = ProbeRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_probe = seen.clone();
        registry.add(
            0x4000,
            Box::new(move |details| {
                seen_in_probe.store(details.return_address, Ordering::SeqCst);
            }),
        );

        let stack_slot: usize = 0x1234_5678;
        let mut cpu = CpuContext { rsp: &stack_slot as *const usize as u64, ..Default::default() };
        registry.invoke(0x4000, &mut cpu);
        assert_eq!(seen.load(Ordering::SeqCst), 0x1234_5678);
    }
}
