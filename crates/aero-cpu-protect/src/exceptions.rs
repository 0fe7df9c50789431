use thiserror::Error;

use crate::intercept::VmExit;

/// Architectural exception vectors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorSegmentOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    Reserved15 = 15,
    X87Fpu = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
    Virtualization = 20,
    ControlProtection = 21,
    Reserved22 = 22,
    Reserved23 = 23,
    Reserved24 = 24,
    Reserved25 = 25,
    Reserved26 = 26,
    Reserved27 = 27,
    HypervisorInjection = 28,
    VmmCommunication = 29,
    Security = 30,
    Reserved31 = 31,
}

/// Escalation class used by the double-fault rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExceptionClass {
    #[default]
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Reported with RIP pointing at the faulting instruction.
    Fault,
    /// Reported after the instruction completed.
    Trap,
    Abort,
}

/// What happens when `second` is raised while delivering an exception of class `first`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Deliver,
    DoubleFault,
    TripleFault,
}

// Indexed `[first][second]` by benign, contributory, page fault.
const DELIVERABLE: [[bool; 3]; 3] = [
    [true, true, true],
    [true, false, true],
    [true, false, false],
];

impl ExceptionClass {
    fn table_index(self) -> usize {
        match self {
            ExceptionClass::Benign => 0,
            ExceptionClass::Contributory => 1,
            ExceptionClass::PageFault => 2,
            // Only reachable as `second`, which is handled before the lookup.
            ExceptionClass::DoubleFault => 0,
        }
    }

    pub fn escalation(first: ExceptionClass, second: ExceptionClass) -> Escalation {
        if first == ExceptionClass::DoubleFault {
            return Escalation::TripleFault;
        }
        if second == ExceptionClass::DoubleFault
            || DELIVERABLE[first.table_index()][second.table_index()]
        {
            Escalation::Deliver
        } else {
            Escalation::DoubleFault
        }
    }
}

impl Exception {
    pub const fn vector(self) -> u8 {
        self as u8
    }

    pub const fn class(self) -> ExceptionClass {
        match self {
            Exception::DivideError
            | Exception::InvalidTss
            | Exception::SegmentNotPresent
            | Exception::StackFault
            | Exception::GeneralProtection
            | Exception::ControlProtection => ExceptionClass::Contributory,
            Exception::PageFault | Exception::Virtualization => ExceptionClass::PageFault,
            Exception::DoubleFault => ExceptionClass::DoubleFault,
            _ => ExceptionClass::Benign,
        }
    }

    pub const fn kind(self) -> ExceptionKind {
        match self {
            Exception::Breakpoint | Exception::Overflow => ExceptionKind::Trap,
            Exception::MachineCheck => ExceptionKind::Abort,
            _ => ExceptionKind::Fault,
        }
    }

    pub const fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::PageFault
                | Exception::AlignmentCheck
                | Exception::ControlProtection
        )
    }
}

impl TryFrom<u8> for Exception {
    type Error = InternalError;

    fn try_from(vector: u8) -> Result<Self, Self::Error> {
        Ok(match vector {
            0 => Exception::DivideError,
            1 => Exception::Debug,
            2 => Exception::NonMaskableInterrupt,
            3 => Exception::Breakpoint,
            4 => Exception::Overflow,
            5 => Exception::BoundRangeExceeded,
            6 => Exception::InvalidOpcode,
            7 => Exception::DeviceNotAvailable,
            8 => Exception::DoubleFault,
            9 => Exception::CoprocessorSegmentOverrun,
            10 => Exception::InvalidTss,
            11 => Exception::SegmentNotPresent,
            12 => Exception::StackFault,
            13 => Exception::GeneralProtection,
            14 => Exception::PageFault,
            15 => Exception::Reserved15,
            16 => Exception::X87Fpu,
            17 => Exception::AlignmentCheck,
            18 => Exception::MachineCheck,
            19 => Exception::SimdFloatingPoint,
            20 => Exception::Virtualization,
            21 => Exception::ControlProtection,
            22 => Exception::Reserved22,
            23 => Exception::Reserved23,
            24 => Exception::Reserved24,
            25 => Exception::Reserved25,
            26 => Exception::Reserved26,
            27 => Exception::Reserved27,
            28 => Exception::HypervisorInjection,
            29 => Exception::VmmCommunication,
            30 => Exception::Security,
            31 => Exception::Reserved31,
            _ => return Err(InternalError::BadVector(vector)),
        })
    }
}

/// Source of an event as the virtualization extensions encode it (interruption type).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ExternalInterrupt = 0,
    Nmi = 2,
    HardwareException = 3,
    /// `INT n`.
    SoftwareInterrupt = 4,
    /// `INT1` (ICEBP).
    PrivilegedSoftwareException = 5,
    /// `INT3` / `INTO`.
    SoftwareException = 6,
}

impl EventType {
    /// Events subject to the gate DPL check.
    pub fn is_software(self) -> bool {
        matches!(
            self,
            EventType::SoftwareInterrupt | EventType::SoftwareException
        )
    }
}

/// An event that was being delivered, as recorded in the IDT-vectoring information of a VM
/// exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub vector: u8,
    pub event_type: EventType,
    pub error_code: Option<u32>,
}

impl EventRecord {
    /// VMX interruption-information encoding (valid bit set).
    pub fn interruption_info(&self) -> u32 {
        u32::from(self.vector)
            | (u32::from(self.event_type as u8) << 8)
            | (u32::from(self.error_code.is_some()) << 11)
            | (1 << 31)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetKind {
    Hardware,
    /// INIT.
    Software,
}

/// Emulator-internal conditions. Never guest-visible; the embedder is expected to stop
/// emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("bad exception vector {0:#04x}")]
    BadVector(u8),
    #[error("gate type {gate_type:#x} reached delivery of vector {vector:#04x}")]
    UnexpectedGateType { vector: u8, gate_type: u8 },
    #[error("TR does not hold a TSS (type {0:#x})")]
    InvalidTaskRegister(u8),
}

/// Ways control leaves the core back to the embedder's decode loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuExit {
    #[error("VM exit {0:?}")]
    VmExit(VmExit),
    #[error("triple fault, processor reset ({0:?})")]
    Reset(ResetKind),
    #[error("triple fault, processor shut down")]
    Shutdown,
    #[error(transparent)]
    Internal(#[from] InternalError),
}

/// Error type of every emulated-instruction path.
///
/// Returning a `Fault` abandons the current instruction; the decode loop hands it to
/// [`crate::cpu::CpuCore::deliver_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("{exception:?} (error code {error_code:#x})")]
    Exception {
        exception: Exception,
        error_code: u32,
    },
    #[error("page fault at {address:#x} (error code {error_code:#x})")]
    PageFault { address: u64, error_code: u32 },
    #[error(transparent)]
    Exit(#[from] CpuExit),
}

impl Fault {
    pub const fn new(exception: Exception, error_code: u32) -> Self {
        Fault::Exception {
            exception,
            error_code,
        }
    }

    pub const fn gp(error_code: u16) -> Self {
        Self::new(Exception::GeneralProtection, error_code as u32)
    }

    pub const fn gp0() -> Self {
        Self::gp(0)
    }

    pub const fn ud() -> Self {
        Self::new(Exception::InvalidOpcode, 0)
    }

    pub const fn ts(error_code: u16) -> Self {
        Self::new(Exception::InvalidTss, error_code as u32)
    }

    pub const fn np(error_code: u16) -> Self {
        Self::new(Exception::SegmentNotPresent, error_code as u32)
    }

    pub const fn ss(error_code: u16) -> Self {
        Self::new(Exception::StackFault, error_code as u32)
    }

    pub const fn db() -> Self {
        Self::new(Exception::Debug, 0)
    }

    /// The exception this fault will deliver, if it is one.
    pub fn exception(&self) -> Option<Exception> {
        match self {
            Fault::Exception { exception, .. } => Some(*exception),
            Fault::PageFault { .. } => Some(Exception::PageFault),
            Fault::Exit(_) => None,
        }
    }
}

impl From<VmExit> for Fault {
    fn from(exit: VmExit) -> Self {
        Fault::Exit(CpuExit::VmExit(exit))
    }
}

impl From<InternalError> for Fault {
    fn from(err: InternalError) -> Self {
        Fault::Exit(CpuExit::Internal(err))
    }
}
