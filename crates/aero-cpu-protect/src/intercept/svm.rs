use bitflags::bitflags;

use super::{InterceptEvent, VmExit};
use crate::exceptions::{EventRecord, EventType, Exception};
use crate::io::{IoAccess, IoDirection};

/// Size of the I/O permission map.
pub const SVM_IOPM_SIZE: usize = 0x3000;

/// CR0 bits other than TS and MP; changing any of them triggers the selective CR0 intercept.
const CR0_SELECTIVE_MASK: u64 = 0xffff_fff5;

/// VMCB `EXITCODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SvmExitCode(pub u64);

impl SvmExitCode {
    pub const INTR: Self = Self(0x60);
    pub const NMI: Self = Self(0x61);
    pub const SMI: Self = Self(0x62);
    pub const INIT: Self = Self(0x63);
    pub const VINTR: Self = Self(0x64);
    pub const CR0_SEL_WRITE: Self = Self(0x65);
    pub const IOIO: Self = Self(0x7b);
    pub const TASK_SWITCH: Self = Self(0x7d);
    pub const SHUTDOWN: Self = Self(0x7f);
    pub const XSETBV: Self = Self(0x8d);

    pub const fn cr_read(cr: u8) -> Self {
        Self(cr as u64)
    }

    pub const fn cr_write(cr: u8) -> Self {
        Self(0x10 + cr as u64)
    }

    pub const fn dr_read(dr: u8) -> Self {
        Self(0x20 + dr as u64)
    }

    pub const fn dr_write(dr: u8) -> Self {
        Self(0x30 + dr as u64)
    }

    pub const fn exception(vector: u8) -> Self {
        Self(0x40 + vector as u64)
    }
}

bitflags! {
    /// Instruction/event intercept vectors (VMCB offsets 0x0c and 0x10, concatenated).
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct SvmIntercepts: u64 {
        const INTR = 1 << 0;
        const NMI = 1 << 1;
        const SMI = 1 << 2;
        const INIT = 1 << 3;
        const VINTR = 1 << 4;
        const CR0_SEL_WRITE = 1 << 5;
        const IOIO_PROT = 1 << 27;
        const TASK_SWITCH = 1 << 29;
        const SHUTDOWN = 1 << 31;
        const XSETBV = 1 << (32 + 13);
    }
}

/// The subset of the current VMCB the protection core consults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvmControls {
    pub intercepts: SvmIntercepts,
    pub cr_read: u16,
    pub cr_write: u16,
    pub dr_read: u16,
    pub dr_write: u16,
    pub exceptions: u32,
    pub iopm: Box<[u8]>,
    /// `V_TPR`, bits 3:0.
    pub v_tpr: u8,
    pub v_intr_masking: bool,
    pub v_intr_vector: u8,
    /// Report the GPR operand of MOV CRn in EXITINFO1.
    pub decode_assists: bool,
}

impl Default for SvmControls {
    fn default() -> Self {
        Self {
            intercepts: SvmIntercepts::empty(),
            cr_read: 0,
            cr_write: 0,
            dr_read: 0,
            dr_write: 0,
            exceptions: 0,
            iopm: vec![0; SVM_IOPM_SIZE].into_boxed_slice(),
            v_tpr: 0,
            v_intr_masking: false,
            v_intr_vector: 0,
            decode_assists: false,
        }
    }
}

fn bit(mask: u16, n: u8) -> bool {
    n < 16 && mask & (1 << n) != 0
}

impl SvmControls {
    pub(super) fn should_intercept(&self, event: &InterceptEvent) -> Option<VmExit> {
        let on = |flag: SvmIntercepts, code: SvmExitCode| {
            self.intercepts
                .contains(flag)
                .then(|| VmExit::svm(code, 0, 0))
        };

        match *event {
            InterceptEvent::CrRead { cr, gpr } => bit(self.cr_read, cr)
                .then(|| VmExit::svm(SvmExitCode::cr_read(cr), self.mov_cr_info(gpr), 0)),
            InterceptEvent::CrWrite { cr, gpr, old, new } => {
                if bit(self.cr_write, cr) {
                    return Some(VmExit::svm(
                        SvmExitCode::cr_write(cr),
                        self.mov_cr_info(gpr),
                        0,
                    ));
                }
                (cr == 0 && self.selective_cr0_write(old, new))
                    .then(|| VmExit::svm(SvmExitCode::CR0_SEL_WRITE, self.mov_cr_info(gpr), 0))
            }
            InterceptEvent::Clts => {
                bit(self.cr_write, 0).then(|| VmExit::svm(SvmExitCode::cr_write(0), 0, 0))
            }
            InterceptEvent::Lmsw { msw, old_cr0 } => {
                if bit(self.cr_write, 0) {
                    return Some(VmExit::svm(SvmExitCode::cr_write(0), 0, 0));
                }
                let new = (old_cr0 & !0xf) | u64::from(msw & 0xf) | (old_cr0 & 0x1);
                self.selective_cr0_write(old_cr0, new)
                    .then(|| VmExit::svm(SvmExitCode::CR0_SEL_WRITE, 0, 0))
            }
            InterceptEvent::DrRead { dr, gpr } => bit(self.dr_read, dr)
                .then(|| VmExit::svm(SvmExitCode::dr_read(dr), self.mov_cr_info(gpr), 0)),
            InterceptEvent::DrWrite { dr, gpr } => bit(self.dr_write, dr)
                .then(|| VmExit::svm(SvmExitCode::dr_write(dr), self.mov_cr_info(gpr), 0)),
            InterceptEvent::Exception {
                record,
                exception,
                aux,
            } => self.exception_exit(record, exception, aux),
            InterceptEvent::ExternalInterrupt { vector: None } => {
                on(SvmIntercepts::INTR, SvmExitCode::INTR)
            }
            InterceptEvent::Nmi => on(SvmIntercepts::NMI, SvmExitCode::NMI),
            InterceptEvent::Smi => on(SvmIntercepts::SMI, SvmExitCode::SMI),
            InterceptEvent::Init => on(SvmIntercepts::INIT, SvmExitCode::INIT),
            InterceptEvent::VirtualInterrupt => on(SvmIntercepts::VINTR, SvmExitCode::VINTR),
            InterceptEvent::TripleFault => on(SvmIntercepts::SHUTDOWN, SvmExitCode::SHUTDOWN),
            InterceptEvent::TaskSwitch {
                selector,
                error_code,
            } => self.intercepts.contains(SvmIntercepts::TASK_SWITCH).then(|| {
                let info2 = error_code.map_or(0, |ec| (1 << 44) | u64::from(ec));
                VmExit::svm(SvmExitCode::TASK_SWITCH, u64::from(selector), info2)
            }),
            InterceptEvent::Io(access) => (self.intercepts.contains(SvmIntercepts::IOIO_PROT)
                && self.io_intercepted(&access))
            .then(|| VmExit::svm(SvmExitCode::IOIO, io_exit_info(&access), access.next_rip)),
            InterceptEvent::Xsetbv { .. } => on(SvmIntercepts::XSETBV, SvmExitCode::XSETBV),
            InterceptEvent::ExternalInterrupt { vector: Some(_) }
            | InterceptEvent::Sipi { .. }
            | InterceptEvent::InterruptWindow
            | InterceptEvent::NmiWindow
            | InterceptEvent::PreemptionTimer
            | InterceptEvent::MonitorTrap
            | InterceptEvent::TprBelowThreshold
            | InterceptEvent::VirtualEoi { .. }
            | InterceptEvent::ApicWrite { .. } => None,
        }
    }

    fn mov_cr_info(&self, gpr: u8) -> u64 {
        if self.decode_assists {
            (1 << 63) | u64::from(gpr & 0xf)
        } else {
            0
        }
    }

    fn selective_cr0_write(&self, old: u64, new: u64) -> bool {
        self.intercepts.contains(SvmIntercepts::CR0_SEL_WRITE)
            && (old & CR0_SELECTIVE_MASK) != (new & CR0_SELECTIVE_MASK)
    }

    fn exception_exit(
        &self,
        record: EventRecord,
        exception: Option<Exception>,
        aux: u64,
    ) -> Option<VmExit> {
        let exception = exception.filter(|_| record.event_type != EventType::SoftwareInterrupt)?;
        if self.exceptions & (1 << exception.vector()) == 0 {
            return None;
        }
        let info2 = if exception == Exception::PageFault { aux } else { 0 };
        Some(VmExit::svm(
            SvmExitCode::exception(exception.vector()),
            u64::from(record.error_code.unwrap_or(0)),
            info2,
        ))
    }

    fn io_intercepted(&self, access: &IoAccess) -> bool {
        let idx = usize::from(access.port / 8);
        // Bits past the end of a truncated map intercept.
        let byte = |i: usize| self.iopm.get(i).copied().unwrap_or(0xff);
        let bits = u16::from_le_bytes([byte(idx), byte(idx + 1)]);
        bits & access.bitmap_mask() != 0
    }
}

fn io_exit_info(access: &IoAccess) -> u64 {
    let mut info = u64::from(access.port) << 16;
    if access.direction == IoDirection::In {
        info |= 1;
    }
    if access.string {
        info |= 1 << 2;
    }
    if access.rep {
        info |= 1 << 3;
    }
    info |= match access.len {
        1 => 1 << 4,
        2 => 1 << 5,
        _ => 1 << 6,
    };
    info |= match access.address_size {
        2 => 1 << 7,
        8 => 1 << 9,
        _ => 1 << 8,
    };
    info
}
