use bitflags::bitflags;

use super::{InterceptEvent, VmExit};
use crate::exceptions::{EventRecord, EventType, Exception};
use crate::io::{IoAccess, IoDirection};

/// I/O bitmaps A (ports 0-0x7fff) and B (0x8000-0xffff), back to back.
pub const VMX_IO_BITMAPS_SIZE: usize = 0x2000;

const CR3_TARGET_LIMIT: usize = 4;
const CR0_TS: u64 = 1 << 3;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmxExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    Init = 3,
    Sipi = 4,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    CrAccess = 28,
    DrAccess = 29,
    IoInstruction = 30,
    MonitorTrapFlag = 37,
    TprBelowThreshold = 43,
    VirtualizedEoi = 45,
    PreemptionTimer = 52,
    Xsetbv = 55,
    ApicWrite = 56,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PinControls: u32 {
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        const NMI_EXITING = 1 << 3;
        const VIRTUAL_NMIS = 1 << 5;
        const PREEMPTION_TIMER = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ProcControls: u32 {
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        const CR8_LOAD_EXITING = 1 << 19;
        const CR8_STORE_EXITING = 1 << 20;
        const TPR_SHADOW = 1 << 21;
        const NMI_WINDOW_EXITING = 1 << 22;
        const MOV_DR_EXITING = 1 << 23;
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        const USE_IO_BITMAPS = 1 << 25;
        const MONITOR_TRAP_FLAG = 1 << 27;
        const SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct SecondaryControls: u32 {
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        const UNRESTRICTED_GUEST = 1 << 7;
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ExitControls: u32 {
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
    }
}

/// The subset of the current VMCS the protection core consults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmxControls {
    pub pin: PinControls,
    pub proc: ProcControls,
    pub secondary: SecondaryControls,
    pub exit: ExitControls,
    pub exception_bitmap: u32,
    pub pf_error_code_mask: u32,
    pub pf_error_code_match: u32,
    pub cr0_guest_host_mask: u64,
    pub cr0_read_shadow: u64,
    pub cr4_guest_host_mask: u64,
    pub cr4_read_shadow: u64,
    /// At most four CR3-target values; loading one of them never exits.
    pub cr3_targets: Vec<u64>,
    pub io_bitmaps: Box<[u8]>,
    /// Guest-physical address of the virtual-APIC page.
    pub virtual_apic_page: u64,
    /// Bits 3:0 of the TPR threshold.
    pub tpr_threshold: u8,
    /// Guest interrupt status: requesting virtual interrupt.
    pub rvi: u8,
    /// Guest interrupt status: servicing virtual interrupt.
    pub svi: u8,
}

impl Default for VmxControls {
    fn default() -> Self {
        Self {
            pin: PinControls::empty(),
            proc: ProcControls::empty(),
            secondary: SecondaryControls::empty(),
            exit: ExitControls::empty(),
            exception_bitmap: 0,
            pf_error_code_mask: 0,
            pf_error_code_match: 0,
            cr0_guest_host_mask: 0,
            cr0_read_shadow: 0,
            cr4_guest_host_mask: 0,
            cr4_read_shadow: 0,
            cr3_targets: Vec::new(),
            io_bitmaps: vec![0; VMX_IO_BITMAPS_SIZE].into_boxed_slice(),
            virtual_apic_page: 0,
            tpr_threshold: 0,
            rvi: 0,
            svi: 0,
        }
    }
}

fn cr_qualification(cr: u8, access_type: u64, gpr: u8) -> u64 {
    u64::from(cr) | (access_type << 4) | (u64::from(gpr) << 8)
}

impl VmxControls {
    /// Secondary controls, honoured only when activated in the primary controls.
    pub fn secondary_controls(&self) -> SecondaryControls {
        if self.proc.contains(ProcControls::SECONDARY_CONTROLS) {
            self.secondary
        } else {
            SecondaryControls::empty()
        }
    }

    pub fn tpr_shadow(&self) -> bool {
        self.proc.contains(ProcControls::TPR_SHADOW)
    }

    pub(super) fn should_intercept(&self, event: &InterceptEvent) -> Option<VmExit> {
        use VmxExitReason as R;

        let exit = |reason, qualification| Some(VmExit::vmx(reason, qualification));

        match *event {
            InterceptEvent::CrRead { cr, gpr } => {
                let control = match cr {
                    3 => ProcControls::CR3_STORE_EXITING,
                    8 => ProcControls::CR8_STORE_EXITING,
                    _ => return None,
                };
                if self.proc.contains(control) {
                    return exit(R::CrAccess, cr_qualification(cr, 1, gpr));
                }
                None
            }
            InterceptEvent::CrWrite { cr, gpr, new, .. } => {
                let exits = match cr {
                    0 => self.cr0_guest_host_mask & self.cr0_read_shadow
                        != self.cr0_guest_host_mask & new,
                    4 => self.cr4_guest_host_mask & self.cr4_read_shadow
                        != self.cr4_guest_host_mask & new,
                    3 => {
                        self.proc.contains(ProcControls::CR3_LOAD_EXITING)
                            && !self
                                .cr3_targets
                                .iter()
                                .take(CR3_TARGET_LIMIT)
                                .any(|&target| target == new)
                    }
                    8 => self.proc.contains(ProcControls::CR8_LOAD_EXITING),
                    _ => false,
                };
                if exits {
                    return exit(R::CrAccess, cr_qualification(cr, 0, gpr));
                }
                None
            }
            InterceptEvent::Clts => {
                if self.cr0_guest_host_mask & self.cr0_read_shadow & CR0_TS != 0 {
                    return exit(R::CrAccess, cr_qualification(0, 2, 0));
                }
                None
            }
            InterceptEvent::Lmsw { msw, .. } => {
                let mask = self.cr0_guest_host_mask & 0xf;
                let shadow = self.cr0_read_shadow;
                let msw = u64::from(msw);
                let sets_owned_pe = mask & msw & 0x1 != 0 && shadow & 0x1 == 0;
                let changes_owned = mask & shadow & 0xe != mask & msw & 0xe;
                if sets_owned_pe || changes_owned {
                    return exit(R::CrAccess, cr_qualification(0, 3, 0) | (msw << 16));
                }
                None
            }
            InterceptEvent::DrRead { dr, gpr } | InterceptEvent::DrWrite { dr, gpr } => {
                if !self.proc.contains(ProcControls::MOV_DR_EXITING) {
                    return None;
                }
                let read = u64::from(matches!(event, InterceptEvent::DrRead { .. }));
                exit(
                    R::DrAccess,
                    u64::from(dr) | (read << 4) | (u64::from(gpr) << 8),
                )
            }
            InterceptEvent::Exception {
                record,
                exception,
                aux,
            } => self.exception_exit(record, exception, aux),
            InterceptEvent::ExternalInterrupt { vector } => {
                if !self.pin.contains(PinControls::EXTERNAL_INTERRUPT_EXITING) {
                    return None;
                }
                let ack_on_exit = self.exit.contains(ExitControls::ACK_INTERRUPT_ON_EXIT);
                match vector {
                    None if !ack_on_exit => exit(R::ExternalInterrupt, 0),
                    Some(vector) if ack_on_exit => {
                        let record = EventRecord {
                            vector,
                            event_type: EventType::ExternalInterrupt,
                            error_code: None,
                        };
                        Some(VmExit {
                            info: u64::from(record.interruption_info()),
                            ..VmExit::vmx(R::ExternalInterrupt, 0)
                        })
                    }
                    _ => None,
                }
            }
            InterceptEvent::Nmi => {
                if !self.pin.contains(PinControls::NMI_EXITING) {
                    return None;
                }
                let record = EventRecord {
                    vector: Exception::NonMaskableInterrupt.vector(),
                    event_type: EventType::Nmi,
                    error_code: None,
                };
                Some(VmExit {
                    info: u64::from(record.interruption_info()),
                    ..VmExit::vmx(R::ExceptionOrNmi, 0)
                })
            }
            InterceptEvent::Init => exit(R::Init, 0),
            InterceptEvent::Sipi { vector } => exit(R::Sipi, u64::from(vector)),
            InterceptEvent::InterruptWindow => exit(R::InterruptWindow, 0),
            InterceptEvent::NmiWindow => exit(R::NmiWindow, 0),
            InterceptEvent::PreemptionTimer => exit(R::PreemptionTimer, 0),
            InterceptEvent::MonitorTrap => exit(R::MonitorTrapFlag, 0),
            InterceptEvent::TprBelowThreshold => exit(R::TprBelowThreshold, 0),
            InterceptEvent::VirtualEoi { vector } => exit(R::VirtualizedEoi, u64::from(vector)),
            InterceptEvent::ApicWrite { offset } => exit(R::ApicWrite, u64::from(offset)),
            InterceptEvent::TripleFault => exit(R::TripleFault, 0),
            // Source 3: task gate in the IDT.
            InterceptEvent::TaskSwitch { selector, .. } => {
                exit(R::TaskSwitch, u64::from(selector) | (3 << 30))
            }
            InterceptEvent::Io(access) => {
                if self.io_intercepted(&access) {
                    return exit(R::IoInstruction, io_qualification(&access));
                }
                None
            }
            InterceptEvent::Xsetbv { .. } => exit(R::Xsetbv, 0),
            InterceptEvent::Smi | InterceptEvent::VirtualInterrupt => None,
        }
    }

    fn exception_exit(
        &self,
        record: EventRecord,
        exception: Option<Exception>,
        aux: u64,
    ) -> Option<VmExit> {
        // INT n is never subject to the exception bitmap.
        let exception = exception.filter(|_| record.event_type != EventType::SoftwareInterrupt)?;
        let bit = self.exception_bitmap & (1 << exception.vector()) != 0;
        let exits = if exception == Exception::PageFault {
            let ec = record.error_code.unwrap_or(0);
            (ec & self.pf_error_code_mask == self.pf_error_code_match) == bit
        } else {
            bit
        };
        if !exits {
            return None;
        }
        let qualification = match exception {
            Exception::PageFault | Exception::Debug => aux,
            _ => 0,
        };
        Some(VmExit {
            info: u64::from(record.interruption_info()),
            error_code: record.error_code,
            ..VmExit::vmx(VmxExitReason::ExceptionOrNmi, qualification)
        })
    }

    fn io_intercepted(&self, access: &IoAccess) -> bool {
        if !self.proc.contains(ProcControls::USE_IO_BITMAPS) {
            return self.proc.contains(ProcControls::UNCONDITIONAL_IO_EXITING);
        }
        let port = u32::from(access.port);
        if port + u32::from(access.len) > 0x10000 {
            return true;
        }
        let idx = (port / 8) as usize;
        let byte = |i: usize| self.io_bitmaps.get(i).copied().unwrap_or(0);
        let bits = u16::from_le_bytes([byte(idx), byte(idx + 1)]);
        bits & access.bitmap_mask() != 0
    }
}

fn io_qualification(access: &IoAccess) -> u64 {
    let mut qual = u64::from(access.len.saturating_sub(1)) | (u64::from(access.port) << 16);
    if access.direction == IoDirection::In {
        qual |= 1 << 3;
    }
    if access.string {
        qual |= 1 << 4;
    }
    if access.rep {
        qual |= 1 << 5;
    }
    if access.immediate {
        qual |= 1 << 6;
    }
    qual
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::VmExitReason;

    fn reason(exit: Option<VmExit>) -> Option<VmxExitReason> {
        exit.map(|e| match e.reason {
            VmExitReason::Vmx(r) => r,
            VmExitReason::Svm(_) => panic!("SVM exit from VMX controls"),
        })
    }

    #[test]
    fn cr0_write_exits_only_when_owned_bits_differ_from_shadow() {
        let controls = VmxControls {
            cr0_guest_host_mask: 0x8000_0001,
            cr0_read_shadow: 0x8000_0001,
            ..VmxControls::default()
        };
        let write = |new| InterceptEvent::CrWrite {
            cr: 0,
            gpr: 3,
            old: 0,
            new,
        };
        assert_eq!(controls.should_intercept(&write(0x8000_0031)), None);
        let exit = controls.should_intercept(&write(0x0000_0031));
        assert_eq!(reason(exit), Some(VmxExitReason::CrAccess));
        assert_eq!(exit.map(|e| e.qualification), Some(0x300));
    }

    #[test]
    fn cr3_target_list_suppresses_load_exit() {
        let controls = VmxControls {
            proc: ProcControls::CR3_LOAD_EXITING,
            cr3_targets: vec![0x5000],
            ..VmxControls::default()
        };
        let write = |new| InterceptEvent::CrWrite {
            cr: 3,
            gpr: 0,
            old: 0,
            new,
        };
        assert_eq!(controls.should_intercept(&write(0x5000)), None);
        assert_eq!(
            reason(controls.should_intercept(&write(0x6000))),
            Some(VmxExitReason::CrAccess)
        );
    }

    #[test]
    fn page_fault_error_code_filter() {
        let controls = VmxControls {
            exception_bitmap: 1 << 14,
            pf_error_code_mask: 0x1,
            pf_error_code_match: 0x1,
            ..VmxControls::default()
        };
        let pf = |ec| InterceptEvent::Exception {
            record: EventRecord {
                vector: 14,
                event_type: EventType::HardwareException,
                error_code: Some(ec),
            },
            exception: Some(Exception::PageFault),
            aux: 0xdead_0000,
        };
        // Present-bit fault matches, so the set bitmap bit means "exit".
        let exit = controls.should_intercept(&pf(0x3));
        assert_eq!(exit.map(|e| e.qualification), Some(0xdead_0000));
        assert_eq!(exit.and_then(|e| e.error_code), Some(0x3));
        assert_eq!(controls.should_intercept(&pf(0x2)), None);
    }

    #[test]
    fn io_bitmap_straddles_a_and_b() {
        let mut controls = VmxControls {
            proc: ProcControls::USE_IO_BITMAPS,
            ..VmxControls::default()
        };
        controls.io_bitmaps[0x1000] = 0x01; // port 0x8000
        let access = IoAccess::new(0x7fff, 2, IoDirection::Out);
        let exit = controls.should_intercept(&InterceptEvent::Io(access));
        assert_eq!(reason(exit), Some(VmxExitReason::IoInstruction));
        assert_eq!(exit.map(|e| e.qualification), Some(0x7fff_0001));

        let access = IoAccess::new(0x7ffe, 1, IoDirection::In);
        assert_eq!(controls.should_intercept(&InterceptEvent::Io(access)), None);

        let access = IoAccess::new(0xffff, 2, IoDirection::In);
        assert!(controls.should_intercept(&InterceptEvent::Io(access)).is_some());
    }

    #[test]
    fn lmsw_exit_rules() {
        let controls = VmxControls {
            cr0_guest_host_mask: 0x1,
            cr0_read_shadow: 0x0,
            ..VmxControls::default()
        };
        let lmsw = |msw| InterceptEvent::Lmsw { msw, old_cr0: 0 };
        assert_eq!(
            controls.should_intercept(&lmsw(0x1)).map(|e| e.qualification),
            Some(0x0001_0030)
        );
        assert_eq!(controls.should_intercept(&lmsw(0x8)), None);
    }

    #[test]
    fn external_interrupt_exit_respects_ack_on_exit() {
        let mut controls = VmxControls {
            pin: PinControls::EXTERNAL_INTERRUPT_EXITING,
            ..VmxControls::default()
        };
        let before = InterceptEvent::ExternalInterrupt { vector: None };
        let after = InterceptEvent::ExternalInterrupt { vector: Some(0x31) };
        assert!(controls.should_intercept(&before).is_some());
        assert_eq!(controls.should_intercept(&after), None);

        controls.exit = ExitControls::ACK_INTERRUPT_ON_EXIT;
        assert_eq!(controls.should_intercept(&before), None);
        assert_eq!(
            controls.should_intercept(&after).map(|e| e.info),
            Some(0x8000_0031)
        );
    }
}
