// Clippy disagreements
#![allow(clippy::style)] // We are laid back about style
#![allow(clippy::too_many_arguments)]
#![allow(clippy::missing_safety_doc)] // Safety contracts live on the engine types

#[cfg(not(target_arch = "x86_64"))]
compile_error!("stride only supports x86-64 hosts");

pub mod asm;
mod backpatch;
mod block;
mod compile;
mod cpu;
mod decoder;
pub mod disasm;
mod engine;
mod error;
mod events;
mod exec_ctx;
mod helpers;
mod observer;
mod os;
mod probes;
mod relocator;
mod slab;
mod transform;
mod virtualize;
mod virtualmem;
mod utils;

pub use backpatch::Backpatch;
pub use compile::{BlockIterator, TransformOutput};
pub use cpu::CpuContext;
pub use decoder::{BranchKind, Insn, InsnId, RipOperand, Segment};
pub use engine::{MemoryRange, ProbeId, Stride};
pub use error::{Error, Result};
pub use events::{Event, EventMask, EventSink};
pub use observer::Observer;
pub use os::{ThreadControl, ThreadId};
pub use probes::{CallDetails, ProbeCallback};
pub use transform::{Callout, Transformer};
