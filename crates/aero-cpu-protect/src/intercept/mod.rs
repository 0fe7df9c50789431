//! Nested-virtualization intercepts.
//!
//! Every privileged operation that a nested hypervisor may want to see is described as an
//! [`InterceptEvent`] and handed to the active [`InterceptPolicy`] before the operation has any
//! native effect. The policy is pure: it only decides whether (and how) the operation turns into
//! a VM exit. Raising the exit is up to the caller, see [`crate::cpu::CpuCore::intercept`].

mod svm;
mod vmx;

pub use svm::{SvmControls, SvmExitCode, SvmIntercepts, SVM_IOPM_SIZE};
pub use vmx::{
    ExitControls, PinControls, ProcControls, SecondaryControls, VmxControls, VmxExitReason,
    VMX_IO_BITMAPS_SIZE,
};

use crate::exceptions::{EventRecord, Exception};
use crate::io::IoAccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmExitReason {
    Vmx(VmxExitReason),
    Svm(SvmExitCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmExit {
    pub reason: VmExitReason,
    /// VMX exit qualification, SVM EXITINFO1.
    pub qualification: u64,
    /// VMX exit interruption information, SVM EXITINFO2.
    pub info: u64,
    /// VMX exit interruption error code.
    pub error_code: Option<u32>,
    /// Event whose delivery was in flight when the exit happened.
    pub idt_vectoring: Option<EventRecord>,
}

impl VmExit {
    pub(crate) fn vmx(reason: VmxExitReason, qualification: u64) -> Self {
        Self {
            reason: VmExitReason::Vmx(reason),
            qualification,
            info: 0,
            error_code: None,
            idt_vectoring: None,
        }
    }

    pub(crate) fn svm(code: SvmExitCode, exitinfo1: u64, exitinfo2: u64) -> Self {
        Self {
            reason: VmExitReason::Svm(code),
            qualification: exitinfo1,
            info: exitinfo2,
            error_code: None,
            idt_vectoring: None,
        }
    }

    /// Trap-like exits report the state after the instruction that caused them; every other
    /// exit rolls the guest back to the start of the instruction.
    pub fn is_trap_like(&self) -> bool {
        matches!(
            self.reason,
            VmExitReason::Vmx(
                VmxExitReason::TprBelowThreshold
                    | VmxExitReason::VirtualizedEoi
                    | VmxExitReason::ApicWrite
            )
        )
    }
}

/// An operation the intercept layer is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptEvent {
    CrRead { cr: u8, gpr: u8 },
    /// `new` is the value after CPU-level normalisation.
    CrWrite { cr: u8, gpr: u8, old: u64, new: u64 },
    Clts,
    Lmsw { msw: u16, old_cr0: u64 },
    DrRead { dr: u8, gpr: u8 },
    DrWrite { dr: u8, gpr: u8 },
    /// Exception or software interrupt about to be delivered. `aux` is CR2 for `#PF` and the
    /// pending debug conditions for `#DB`.
    Exception {
        record: EventRecord,
        exception: Option<Exception>,
        aux: u64,
    },
    /// Before acknowledging the interrupt controller (`None`) or after (`Some(vector)`).
    ExternalInterrupt { vector: Option<u8> },
    Nmi,
    Smi,
    Init,
    Sipi { vector: u8 },
    VirtualInterrupt,
    InterruptWindow,
    NmiWindow,
    PreemptionTimer,
    MonitorTrap,
    TprBelowThreshold,
    VirtualEoi { vector: u8 },
    ApicWrite { offset: u16 },
    TripleFault,
    /// Task switch through an IDT task gate.
    TaskSwitch { selector: u16, error_code: Option<u32> },
    Io(IoAccess),
    Xsetbv { ecx: u32 },
}

#[derive(Debug, Clone, Default)]
pub enum InterceptPolicy {
    /// Not running as a nested guest.
    #[default]
    None,
    Vmx(VmxControls),
    Svm(SvmControls),
}

impl InterceptPolicy {
    pub fn should_intercept(&self, event: &InterceptEvent) -> Option<VmExit> {
        match self {
            InterceptPolicy::None => None,
            InterceptPolicy::Vmx(controls) => controls.should_intercept(event),
            InterceptPolicy::Svm(controls) => controls.should_intercept(event),
        }
    }

    pub fn is_guest(&self) -> bool {
        !matches!(self, InterceptPolicy::None)
    }

    pub fn vmx(&self) -> Option<&VmxControls> {
        match self {
            InterceptPolicy::Vmx(controls) => Some(controls),
            _ => None,
        }
    }

    pub fn vmx_mut(&mut self) -> Option<&mut VmxControls> {
        match self {
            InterceptPolicy::Vmx(controls) => Some(controls),
            _ => None,
        }
    }

    pub fn svm(&self) -> Option<&SvmControls> {
        match self {
            InterceptPolicy::Svm(controls) => Some(controls),
            _ => None,
        }
    }

    pub fn svm_mut(&mut self) -> Option<&mut SvmControls> {
        match self {
            InterceptPolicy::Svm(controls) => Some(controls),
            _ => None,
        }
    }

    /// CRn as the guest reads it (VMX read shadows for host-owned bits).
    pub fn guest_cr_read(&self, cr: u8, actual: u64) -> u64 {
        match (self, cr) {
            (InterceptPolicy::Vmx(v), 0) => masked(actual, v.cr0_read_shadow, v.cr0_guest_host_mask),
            (InterceptPolicy::Vmx(v), 4) => masked(actual, v.cr4_read_shadow, v.cr4_guest_host_mask),
            _ => actual,
        }
    }

    /// Value a guest write to CRn commits: host-owned bits keep their current value.
    pub fn guest_cr_write(&self, cr: u8, current: u64, written: u64) -> u64 {
        match (self, cr) {
            (InterceptPolicy::Vmx(v), 0) => masked(written, current, v.cr0_guest_host_mask),
            (InterceptPolicy::Vmx(v), 4) => masked(written, current, v.cr4_guest_host_mask),
            _ => written,
        }
    }
}

fn masked(value: u64, owned: u64, mask: u64) -> u64 {
    (value & !mask) | (owned & mask)
}
