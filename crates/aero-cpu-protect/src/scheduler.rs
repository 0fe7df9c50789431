//! The instruction-boundary event scheduler.
//!
//! [`CpuCore::handle_async_event`] runs between two instructions. It folds cross-thread
//! signals into the pending set, wakes or keeps a sleeping core idle, and then picks at most
//! one event to act on, in architectural priority order:
//!
//! 1. kill requests;
//! 2. the debug trap of a TSS with the T bit set;
//! 3. APIC-virtualisation traps;
//! 4. SMI, INIT and the VMX monitor trap flag;
//! 5. accumulated debug traps (single step, breakpoints);
//! 6. external events: preemption timer, virtual NMI, NMI, interrupt window, INTR, SVM
//!    virtual interrupts and DMA hold requests.
//!
//! Finally a set TF arms the single-step trap for the next boundary.

use tracing::{debug, info, trace};

use crate::apic::{InterruptController, InterruptSource};
use crate::cpu::CpuCore;
use crate::events::{ActivityState, DebugTrap, Events, Inhibit};
use crate::exceptions::{CpuExit, EventType, Exception, Fault, ResetKind};
use crate::intercept::{InterceptEvent, SecondaryControls};
use crate::mem::{CpuBus, TlbFlush};
use crate::state::{SegReg, RFLAGS_IF, RFLAGS_RF, RFLAGS_TF};

/// Virtual-APIC page offsets.
const VAPIC_PPR: u64 = 0xa0;
const VAPIC_ISR: u64 = 0x100;
const VAPIC_IRR: u64 = 0x200;

/// What the embedder does after a scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Boundary {
    /// Execute the next instruction.
    Continue,
    /// The core sleeps; yield or park, then poll again.
    Idle,
    /// A kill was requested.
    Killed,
    /// The core entered system-management mode; the embedder saves state and starts the
    /// SMI handler, then calls [`CpuCore::resume_from_smm`] on RSM.
    EnterSmm,
}

impl CpuCore {
    /// Runs one scheduler pass at an instruction boundary.
    pub fn handle_async_event<B, A>(&mut self, bus: &mut B, apic: &mut A) -> Result<Boundary, CpuExit>
    where
        B: CpuBus + ?Sized,
        A: InterruptController + ?Sized,
    {
        match self.async_event_pass(bus, apic) {
            Ok(boundary) => Ok(boundary),
            Err(fault) => {
                self.deliver_fault(bus, fault)?;
                Ok(Boundary::Continue)
            }
        }
    }

    fn async_event_pass<B, A>(&mut self, bus: &mut B, apic: &mut A) -> Result<Boundary, Fault>
    where
        B: CpuBus + ?Sized,
        A: InterruptController + ?Sized,
    {
        let collected = self.events.collect_signals();
        if collected.tlb_flush {
            bus.flush_tlb(TlbFlush::All);
        }
        if let Some(vector) = collected.sipi {
            self.deliver_sipi(vector)?;
        }

        if self.events.kill_requested() {
            debug!("kill requested");
            return Ok(Boundary::Killed);
        }

        if self.events.activity.is_sleeping() {
            if !self.wakeup_pending() {
                return Ok(Boundary::Idle);
            }
            debug!(from = ?self.events.activity, "waking up");
            self.events.activity = ActivityState::Active;
            self.events.clear_inhibit();
        }

        if self.events.debug_trap.contains(DebugTrap::TASK_SWITCH) {
            return Err(Fault::db());
        }

        if self.events.is_unmasked_pending(Events::VMX_APIC_TRAPS) {
            let traps = self.events.pending() & Events::VMX_APIC_TRAPS;
            self.events.clear(Events::VMX_APIC_TRAPS);
            let event = if traps.contains(Events::VMX_VTPR_UPDATE) {
                InterceptEvent::TprBelowThreshold
            } else if traps.contains(Events::VMX_VEOI_UPDATE) {
                InterceptEvent::VirtualEoi {
                    vector: self.events.eoi_vector,
                }
            } else {
                InterceptEvent::ApicWrite {
                    offset: self.events.apic_write_offset,
                }
            };
            self.intercept(event)?;
        }

        if self.events.is_unmasked_pending(Events::SMI) && self.events.gif {
            self.intercept(InterceptEvent::Smi)?;
            self.events.clear(Events::SMI);
            self.events.mask(Events::SMI | Events::NMI);
            self.state.in_smm = true;
            info!("entering system management mode");
            return Ok(Boundary::EnterSmm);
        }
        if self.events.is_unmasked_pending(Events::INIT) && self.events.gif {
            self.intercept(InterceptEvent::Init)?;
            self.reset(ResetKind::Software);
            return Ok(if self.events.activity.is_sleeping() {
                Boundary::Idle
            } else {
                Boundary::Continue
            });
        }
        if self.events.is_unmasked_pending(Events::VMX_MONITOR_TRAP_FLAG) {
            self.events.clear(Events::VMX_MONITOR_TRAP_FLAG);
            self.intercept(InterceptEvent::MonitorTrap)?;
        }

        // With GIF clear only a pending single step survives.
        if !self.events.gif {
            self.events.debug_trap &= DebugTrap::SINGLE_STEP;
        }
        if !self.events.interrupts_inhibited(Inhibit::DEBUG) {
            let hits = self.code_breakpoint_match(self.state.linear_rip());
            self.state.set_flag(RFLAGS_RF, false);
            self.events.debug_trap |= hits;
            if self.events.debug_trap.intersects(DebugTrap::REPORTABLE) {
                return Err(Fault::db());
            }
            self.events.debug_trap = DebugTrap::empty();
        }

        if !self.events.interrupts_inhibited(Inhibit::INTERRUPTS) && self.events.gif {
            self.external_event(bus, apic)?;
        }

        if self.state.flag(RFLAGS_TF) {
            self.events.debug_trap |= DebugTrap::SINGLE_STEP;
        }
        Ok(Boundary::Continue)
    }

    fn wakeup_pending(&self) -> bool {
        let interruptible =
            self.state.flag(RFLAGS_IF) || self.events.activity == ActivityState::MwaitIf;
        (interruptible
            && self
                .events
                .is_unmasked_pending(Events::PENDING_INTR | Events::PENDING_LAPIC_INTR))
            || self.events.is_unmasked_pending(
                Events::NMI
                    | Events::SMI
                    | Events::INIT
                    | Events::VMX_APIC_TRAPS
                    | Events::VMX_MONITOR_TRAP_FLAG
                    | Events::VMX_PREEMPTION_TIMER_EXPIRED
                    | Events::VMX_VIRTUAL_NMI,
            )
    }

    /// Delivers at most one external event.
    fn external_event<B, A>(&mut self, bus: &mut B, apic: &mut A) -> Result<(), Fault>
    where
        B: CpuBus + ?Sized,
        A: InterruptController + ?Sized,
    {
        let interrupts_enabled = self.state.flag(RFLAGS_IF);
        if self.events.is_pending(Events::VMX_PREEMPTION_TIMER_EXPIRED) {
            self.events.clear(Events::VMX_PREEMPTION_TIMER_EXPIRED);
            self.intercept(InterceptEvent::PreemptionTimer)?;
        } else if self.events.is_unmasked_pending(Events::VMX_VIRTUAL_NMI) {
            self.events.clear(Events::VMX_VIRTUAL_NMI);
            self.intercept(InterceptEvent::NmiWindow)?;
        } else if self.events.is_unmasked_pending(Events::NMI) {
            if self.intercept.svm().is_some() {
                self.intercept(InterceptEvent::Nmi)?;
            }
            self.events.clear(Events::NMI);
            self.events.mask(Events::NMI);
            self.exc.ext = true;
            if self.intercept.vmx().is_some() {
                self.intercept(InterceptEvent::Nmi)?;
            }
            debug!("delivering NMI");
            self.interrupt(
                bus,
                Exception::NonMaskableInterrupt.vector(),
                EventType::Nmi,
                None,
            )?;
        } else if self.events.is_unmasked_pending(Events::VMX_INTERRUPT_WINDOW_EXITING)
            && interrupts_enabled
        {
            self.events.clear(Events::VMX_INTERRUPT_WINDOW_EXITING);
            self.intercept(InterceptEvent::InterruptWindow)?;
        } else if self
            .events
            .is_unmasked_pending(Events::PENDING_INTR | Events::PENDING_LAPIC_INTR)
            && interrupts_enabled
        {
            self.interrupt_acknowledge(bus, apic)?;
        } else if self.events.is_unmasked_pending(Events::PENDING_VMX_VIRTUAL_INTR)
            && interrupts_enabled
        {
            self.vmx_deliver_virtual_interrupt(bus)?;
        } else if self.events.is_unmasked_pending(Events::SVM_VIRQ_PENDING) && interrupts_enabled {
            self.virtual_interrupt_acknowledge(bus)?;
        } else if apic.hold_request() {
            trace!("granting DMA hold");
            apic.acknowledge_hold();
        }
        Ok(())
    }

    /// INTA cycle on the PIC or the local APIC, then delivery of the returned vector.
    fn interrupt_acknowledge<B, A>(&mut self, bus: &mut B, apic: &mut A) -> Result<(), Fault>
    where
        B: CpuBus + ?Sized,
        A: InterruptController + ?Sized,
    {
        self.intercept(InterceptEvent::ExternalInterrupt { vector: None })?;
        let source = if self.events.is_pending(Events::PENDING_LAPIC_INTR) {
            InterruptSource::LocalApic
        } else {
            InterruptSource::Pic
        };
        let vector = apic.acknowledge_interrupt(source);
        self.exc.ext = true;
        self.intercept(InterceptEvent::ExternalInterrupt {
            vector: Some(vector),
        })?;
        debug!(vector, ?source, "delivering external interrupt");
        self.interrupt(bus, vector, EventType::ExternalInterrupt, None)
    }

    /// SVM `V_IRQ`: the virtual interrupt injected by the host.
    fn virtual_interrupt_acknowledge<B: CpuBus + ?Sized>(&mut self, bus: &mut B) -> Result<(), Fault> {
        self.intercept(InterceptEvent::VirtualInterrupt)?;
        self.events.clear(Events::SVM_VIRQ_PENDING);
        let Some(vector) = self.intercept.svm().map(|svm| svm.v_intr_vector) else {
            return Ok(());
        };
        self.exc.ext = true;
        debug!(vector, "delivering SVM virtual interrupt");
        self.interrupt(bus, vector, EventType::ExternalInterrupt, None)
    }

    /// VMX virtual-interrupt delivery: moves RVI from the virtual IRR into the virtual ISR
    /// and delivers it.
    fn vmx_deliver_virtual_interrupt<B: CpuBus + ?Sized>(&mut self, bus: &mut B) -> Result<(), Fault> {
        self.events.clear(Events::PENDING_VMX_VIRTUAL_INTR);
        let Some(vmx) = self.intercept.vmx_mut() else {
            return Ok(());
        };
        if !vmx
            .secondary_controls()
            .contains(SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY)
        {
            return Ok(());
        }
        let page = vmx.virtual_apic_page;
        let vector = vmx.rvi;
        let (reg, bit) = (u64::from(vector / 32) * 0x10, u32::from(vector % 32));

        let isr = bus.read_phys_u32(page + VAPIC_ISR + reg);
        bus.write_phys_u32(page + VAPIC_ISR + reg, isr | (1 << bit));
        let irr = bus.read_phys_u32(page + VAPIC_IRR + reg);
        bus.write_phys_u32(page + VAPIC_IRR + reg, irr & !(1 << bit));

        vmx.svi = vector;
        vmx.rvi = highest_vector(bus, page + VAPIC_IRR).unwrap_or(0);
        bus.write_phys_u32(page + VAPIC_PPR, u32::from(vector & 0xf0));
        self.evaluate_virtual_interrupts(bus);

        self.exc.ext = true;
        debug!(vector, "delivering VMX virtual interrupt");
        self.interrupt(bus, vector, EventType::ExternalInterrupt, None)
    }

    /// Recognises a pending virtual interrupt when RVI outranks the virtual PPR. Called by
    /// the embedder after VM entry and after guest writes to the virtual APIC.
    pub fn evaluate_virtual_interrupts<B: CpuBus + ?Sized>(&mut self, bus: &mut B) {
        let Some(vmx) = self.intercept.vmx() else {
            return;
        };
        if !vmx
            .secondary_controls()
            .contains(SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY)
        {
            return;
        }
        let vppr = bus.read_phys_u32(vmx.virtual_apic_page + VAPIC_PPR) as u8;
        if vmx.rvi >> 4 > vppr >> 4 {
            self.events.signal(Events::PENDING_VMX_VIRTUAL_INTR);
        }
    }

    /// RSM: leaves system-management mode.
    pub fn resume_from_smm(&mut self) {
        info!("leaving system management mode");
        self.state.in_smm = false;
        self.events.unmask(Events::SMI | Events::NMI);
    }

    /// Startup IPI: an application processor waiting for SIPI starts executing in real mode
    /// at `vector << 12`. Ignored in any other activity state.
    pub fn deliver_sipi(&mut self, vector: u8) -> Result<(), Fault> {
        if self.events.activity != ActivityState::WaitForSipi {
            debug!(vector, activity = ?self.events.activity, "SIPI ignored");
            return Ok(());
        }
        self.intercept(InterceptEvent::Sipi { vector })?;
        self.events.activity = ActivityState::Active;
        self.state.rip = 0;
        self.state.prev_rip = 0;
        self.state
            .load_real_mode_segment(SegReg::Cs, u16::from(vector) << 8);
        self.events.unmask(Events::INIT | Events::SMI | Events::NMI);
        info!(vector, "started by SIPI");
        Ok(())
    }
}

/// Highest vector set in a 256-bit virtual-APIC register array.
fn highest_vector<B: CpuBus + ?Sized>(bus: &mut B, base: u64) -> Option<u8> {
    (0..8u8).rev().find_map(|reg| {
        let bits = bus.read_phys_u32(base + u64::from(reg) * 0x10);
        (bits != 0).then(|| reg * 32 + (31 - bits.leading_zeros()) as u8)
    })
}
