//! Pending asynchronous events, the debug-trap accumulator and interrupt shadows.
//!
//! [`EventState`] is owned by the vCPU. Other threads (devices, other vCPUs) never touch it;
//! they go through a [`SignalHandle`], whose atomics are folded into the pending set by the
//! owning vCPU at its next instruction boundary.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Events: u32 {
        const NMI = 1 << 0;
        const SMI = 1 << 1;
        const INIT = 1 << 2;
        const VMX_MONITOR_TRAP_FLAG = 1 << 4;
        const VMX_PREEMPTION_TIMER_EXPIRED = 1 << 5;
        const VMX_INTERRUPT_WINDOW_EXITING = 1 << 6;
        const VMX_VIRTUAL_NMI = 1 << 7;
        const SVM_VIRQ_PENDING = 1 << 8;
        const PENDING_VMX_VIRTUAL_INTR = 1 << 9;
        const PENDING_INTR = 1 << 10;
        const PENDING_LAPIC_INTR = 1 << 11;
        const VMX_VTPR_UPDATE = 1 << 12;
        const VMX_VEOI_UPDATE = 1 << 13;
        const VMX_VIRTUAL_APIC_WRITE = 1 << 14;

        const VMX_APIC_TRAPS = Self::VMX_VTPR_UPDATE.bits()
            | Self::VMX_VEOI_UPDATE.bits()
            | Self::VMX_VIRTUAL_APIC_WRITE.bits();

        /// Events that only exist while running a nested guest.
        const GUEST_ONLY = Self::VMX_MONITOR_TRAP_FLAG.bits()
            | Self::VMX_PREEMPTION_TIMER_EXPIRED.bits()
            | Self::VMX_INTERRUPT_WINDOW_EXITING.bits()
            | Self::VMX_VIRTUAL_NMI.bits()
            | Self::SVM_VIRQ_PENDING.bits()
            | Self::PENDING_VMX_VIRTUAL_INTR.bits()
            | Self::VMX_APIC_TRAPS.bits();
    }
}

bitflags! {
    /// Debug conditions accumulated during an instruction, reported as `#DB` at the next
    /// boundary. The low bits mirror DR6.B0-B3, the high nibble DR6.BD/BS/BT.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct DebugTrap: u32 {
        const B0 = 1 << 0;
        const B1 = 1 << 1;
        const B2 = 1 << 2;
        const B3 = 1 << 3;
        /// An enabled breakpoint matched.
        const HIT = 1 << 12;
        const DR_ACCESS = 1 << 13;
        const SINGLE_STEP = 1 << 14;
        const TASK_SWITCH = 1 << 15;

        /// Conditions that raise `#DB` at the boundary.
        const REPORTABLE = Self::HIT.bits()
            | Self::DR_ACCESS.bits()
            | Self::SINGLE_STEP.bits()
            | Self::TASK_SWITCH.bits();
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Inhibit: u8 {
        const INTERRUPTS = 1 << 0;
        const DEBUG = 1 << 1;
        /// MOV SS / POP SS.
        const BY_MOV_SS = Self::INTERRUPTS.bits() | Self::DEBUG.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ActivityState {
    #[default]
    Active,
    Halt,
    Shutdown,
    WaitForSipi,
    Mwait,
    /// MWAIT with "interrupts wake even when IF=0".
    MwaitIf,
}

impl ActivityState {
    pub fn is_sleeping(self) -> bool {
        self != ActivityState::Active
    }
}

const SIPI_VALID: u32 = 1 << 8;

const LINE_UNCHANGED: u8 = 0;
const LINE_LOW: u8 = 1;
const LINE_HIGH: u8 = 2;

fn line_state(level: bool) -> u8 {
    if level {
        LINE_HIGH
    } else {
        LINE_LOW
    }
}

/// Cross-thread mailbox of a vCPU. Each flag has one writer side (any thread) and one reader
/// (the owning vCPU).
#[derive(Debug, Default)]
pub struct EventSignals {
    raised: AtomicU32,
    intr: AtomicU8,
    lapic_intr: AtomicU8,
    sipi: AtomicU32,
    tlb_flush: AtomicBool,
    kill: AtomicBool,
}

/// Cloneable sender side of [`EventSignals`].
#[derive(Debug, Clone)]
pub struct SignalHandle(Arc<EventSignals>);

impl SignalHandle {
    pub fn raise_nmi(&self) {
        self.0.raised.fetch_or(Events::NMI.bits(), Ordering::AcqRel);
    }

    pub fn raise_smi(&self) {
        self.0.raised.fetch_or(Events::SMI.bits(), Ordering::AcqRel);
    }

    pub fn raise_init(&self) {
        self.0.raised.fetch_or(Events::INIT.bits(), Ordering::AcqRel);
    }

    pub fn send_sipi(&self, vector: u8) {
        self.0
            .sipi
            .store(SIPI_VALID | u32::from(vector), Ordering::Release);
    }

    /// Drives the PIC INTR line.
    pub fn set_intr(&self, level: bool) {
        self.0.intr.store(line_state(level), Ordering::Release);
    }

    /// Drives the local APIC interrupt line.
    pub fn set_lapic_intr(&self, level: bool) {
        self.0.lapic_intr.store(line_state(level), Ordering::Release);
    }

    /// Asks the vCPU to invalidate its whole TLB at its next boundary.
    pub fn request_tlb_flush(&self) {
        self.0.tlb_flush.store(true, Ordering::Release);
    }

    pub fn request_kill(&self) {
        self.0.kill.store(true, Ordering::Release);
    }
}

/// What a boundary pass picked up from [`EventSignals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Collected {
    pub sipi: Option<u8>,
    pub tlb_flush: bool,
}

#[derive(Debug)]
pub struct EventState {
    pending: Events,
    masked: Events,
    pub debug_trap: DebugTrap,
    inhibit: Inhibit,
    inhibit_icount: u64,
    icount: u64,
    pub activity: ActivityState,
    /// SVM global interrupt flag.
    pub gif: bool,
    /// Virtual-APIC register offset whose write awaits the APIC-write trap.
    pub apic_write_offset: u16,
    /// Vector reported by a virtualized EOI trap.
    pub eoi_vector: u8,
    signals: Arc<EventSignals>,
}

impl Default for EventState {
    fn default() -> Self {
        Self::new()
    }
}

impl EventState {
    pub fn new() -> Self {
        Self {
            pending: Events::empty(),
            masked: Events::empty(),
            debug_trap: DebugTrap::empty(),
            inhibit: Inhibit::empty(),
            inhibit_icount: 0,
            icount: 0,
            activity: ActivityState::Active,
            gif: true,
            apic_write_offset: 0,
            eoi_vector: 0,
            signals: Arc::new(EventSignals::default()),
        }
    }

    pub fn signal_handle(&self) -> SignalHandle {
        SignalHandle(Arc::clone(&self.signals))
    }

    pub fn pending(&self) -> Events {
        self.pending
    }

    pub fn signal(&mut self, events: Events) {
        self.pending |= events;
    }

    pub fn clear(&mut self, events: Events) {
        self.pending &= !events;
    }

    pub fn mask(&mut self, events: Events) {
        self.masked |= events;
    }

    pub fn unmask(&mut self, events: Events) {
        self.masked &= !events;
    }

    pub fn is_masked(&self, events: Events) -> bool {
        self.masked.intersects(events)
    }

    pub fn is_pending(&self, events: Events) -> bool {
        self.pending.intersects(events)
    }

    pub fn is_unmasked_pending(&self, events: Events) -> bool {
        (self.pending & !self.masked).intersects(events)
    }

    /// Folds cross-thread signals into the pending set. Edge-triggered sources are consumed;
    /// an interrupt line only changes the pending set when it was driven since the last pass.
    pub fn collect_signals(&mut self) -> Collected {
        let raised = self.signals.raised.swap(0, Ordering::AcqRel);
        self.pending |= Events::from_bits_truncate(raised);
        for (line, event) in [
            (&self.signals.intr, Events::PENDING_INTR),
            (&self.signals.lapic_intr, Events::PENDING_LAPIC_INTR),
        ] {
            match line.swap(LINE_UNCHANGED, Ordering::AcqRel) {
                LINE_HIGH => self.pending |= event,
                LINE_LOW => self.pending &= !event,
                _ => {}
            }
        }

        let sipi = self.signals.sipi.swap(0, Ordering::AcqRel);
        Collected {
            sipi: (sipi & SIPI_VALID != 0).then_some(sipi as u8),
            tlb_flush: self.signals.tlb_flush.swap(false, Ordering::AcqRel),
        }
    }

    pub fn kill_requested(&self) -> bool {
        self.signals.kill.load(Ordering::Acquire)
    }

    /// Opens an interrupt shadow covering the next instruction.
    ///
    /// A MOV SS shadow never extends one that is already open.
    pub fn inhibit_interrupts(&mut self, mask: Inhibit) {
        if mask == Inhibit::BY_MOV_SS && self.interrupts_inhibited(Inhibit::BY_MOV_SS) {
            return;
        }
        self.inhibit = mask;
        self.inhibit_icount = self.icount + 1;
    }

    pub fn interrupts_inhibited(&self, mask: Inhibit) -> bool {
        self.icount <= self.inhibit_icount && self.inhibit.contains(mask)
    }

    pub fn clear_inhibit(&mut self) {
        self.inhibit = Inhibit::empty();
    }

    pub fn retire_instruction(&mut self) {
        self.icount += 1;
    }

    pub fn icount(&self) -> u64 {
        self.icount
    }

    /// Drops every pending event and mask, keeping the cross-thread mailbox.
    pub(crate) fn reset(&mut self) {
        let signals = Arc::clone(&self.signals);
        *self = Self {
            signals,
            icount: self.icount,
            ..Self::new()
        };
    }
}
