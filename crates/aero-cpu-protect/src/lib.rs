//! Protection, exception delivery and virtualization intercepts of an x86 / x86-64 CPU core.
//!
//! This crate owns the architectural state that decides whether an operation is allowed and
//! where control goes when it is not:
//! - Register validators for CR0/CR3/CR4/CR8, EFER, XCR0/XSS and DR0-DR7 (see [`control`],
//!   [`xstate`], [`debug`]).
//! - The TSS I/O permission check ([`io`]).
//! - Exception preprocessing with `#DF` / triple-fault escalation and real, protected and long
//!   mode event delivery, including task gates and CET shadow stacks ([`interrupts`],
//!   [`tasking`], [`shadow_stack`]).
//! - The instruction-boundary scheduler for asynchronous events ([`scheduler`]).
//! - VMX and SVM intercepts of a nested hypervisor ([`intercept`]).
//!
//! Instruction decode, paging and devices live with the embedder, reached through
//! [`mem::CpuBus`] and [`apic::InterruptController`]. Every emulated operation returns
//! `Result<_, Fault>`; a fault is delivered to the guest with [`CpuCore::deliver_fault`].

#![forbid(unsafe_code)]

pub mod apic;
pub mod config;
pub mod control;
pub mod cpu;
pub mod debug;
pub mod descriptors;
pub mod events;
pub mod exceptions;
pub mod intercept;
pub mod interrupts;
pub mod io;
pub mod mem;
pub mod scheduler;
pub mod shadow_stack;
pub mod state;
pub mod tasking;
pub mod xstate;

#[cfg(test)]
mod test_support;

pub use apic::{FifoInterruptController, InterruptController, InterruptSource};
pub use config::{AllowMasks, ConfigError, CpuConfig, CpuLevel, IsaExtensions};
pub use control::WriteEffects;
pub use cpu::{CpuCore, ExceptionState, StackSnapshot};
pub use events::{ActivityState, DebugTrap, EventSignals, Events, Inhibit, SignalHandle};
pub use exceptions::{
    CpuExit, EventRecord, EventType, Exception, ExceptionClass, Fault, InternalError, ResetKind,
};
pub use intercept::{InterceptEvent, InterceptPolicy, SvmControls, VmExit, VmExitReason, VmxControls};
pub use interrupts::SoftwareInterrupt;
pub use io::{IoAccess, IoDirection};
pub use mem::{CpuBus, FlatTestBus, TlbFlush};
pub use scheduler::Boundary;
pub use state::{CpuMode, CpuState, SegReg};
