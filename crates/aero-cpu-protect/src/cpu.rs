use tracing::{debug, info};

use crate::config::{AllowMasks, ConfigError, CpuConfig};
use crate::events::{ActivityState, EventState, Events, SignalHandle};
use crate::exceptions::{CpuExit, EventRecord, ExceptionClass, Fault, ResetKind};
use crate::intercept::{InterceptEvent, InterceptPolicy, VmExit};
use crate::state::{CpuState, RFLAGS_IF};

/// Stack pointers captured when an event delivery starts, restored if it faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSnapshot {
    pub rsp: u64,
    pub ssp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionState {
    /// Class of the exception currently being delivered; drives `#DF` escalation.
    pub last_exception_type: ExceptionClass,
    /// An event delivery is in progress.
    pub in_event: bool,
    /// Error codes get the EXT bit: the event did not originate in the running program.
    pub ext: bool,
    pub speculative: Option<StackSnapshot>,
    /// The event being delivered, reported as IDT-vectoring information by a VM exit.
    pub delivering: Option<EventRecord>,
}

/// Protection and event-delivery state of one vCPU.
///
/// Exclusively owned by the thread running that vCPU. Other threads talk to it through
/// [`CpuCore::signal_handle`].
#[derive(Debug)]
pub struct CpuCore {
    pub config: CpuConfig,
    pub masks: AllowMasks,
    pub state: CpuState,
    pub events: EventState,
    pub exc: ExceptionState,
    /// Intercepts of the nested hypervisor, swapped by the embedder on VM entry and exit.
    pub intercept: InterceptPolicy,
}

impl CpuCore {
    pub fn new(config: CpuConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let masks = config.allow_masks();
        let mut core = Self {
            config,
            masks,
            state: CpuState::at_reset(),
            events: EventState::new(),
            exc: ExceptionState::default(),
            intercept: InterceptPolicy::None,
        };
        core.reset(ResetKind::Hardware);
        Ok(core)
    }

    pub fn signal_handle(&self) -> SignalHandle {
        self.events.signal_handle()
    }

    /// Architectural reset. Leaves any nested-virtualization context; application processors
    /// then wait for SIPI.
    pub fn reset(&mut self, kind: ResetKind) {
        info!(?kind, bsp = self.config.bsp, "cpu reset");
        self.state = CpuState::at_reset();
        self.events.reset();
        self.exc = ExceptionState::default();
        self.intercept = InterceptPolicy::None;
        if !self.config.bsp {
            self.enter_sleep_state(ActivityState::WaitForSipi);
        }
    }

    pub fn enter_sleep_state(&mut self, activity: ActivityState) {
        match activity {
            ActivityState::WaitForSipi => {
                self.events
                    .mask(Events::INIT | Events::SMI | Events::NMI);
                self.state.set_flag(RFLAGS_IF, false);
            }
            ActivityState::Shutdown => self.state.set_flag(RFLAGS_IF, false),
            _ => {}
        }
        debug!(?activity, "entering sleep state");
        self.events.activity = activity;
    }

    /// Commits the instruction that just executed: its end becomes the new fault-rollback
    /// point and any one-instruction interrupt shadow expires.
    pub fn retire_instruction(&mut self) {
        self.state.prev_rip = self.state.rip;
        self.events.retire_instruction();
    }

    pub fn begin_speculative_rsp(&mut self) {
        self.exc.speculative = Some(StackSnapshot {
            rsp: self.state.rsp(),
            ssp: self.state.cet.ssp,
        });
    }

    pub fn commit_speculative_rsp(&mut self) {
        self.exc.speculative = None;
    }

    /// IRET unblocks NMIs.
    pub fn nmi_return(&mut self) {
        self.events.unmask(Events::NMI);
    }

    /// Offers `event` to the active intercept policy; an intercepted operation unwinds as a VM
    /// exit.
    pub fn intercept(&mut self, event: InterceptEvent) -> Result<(), Fault> {
        match self.intercept.should_intercept(&event) {
            None => Ok(()),
            Some(exit) => Err(self.vm_exit(exit)),
        }
    }

    /// Finishes a VM exit: attaches the in-flight event, rewinds fault-like exits and resets
    /// delivery bookkeeping.
    pub(crate) fn vm_exit(&mut self, mut exit: VmExit) -> Fault {
        if self.exc.in_event {
            exit.idt_vectoring = self.exc.delivering;
        }
        if !exit.is_trap_like() {
            self.state.rip = self.state.prev_rip;
            if let Some(snapshot) = self.exc.speculative {
                self.state.set_rsp(snapshot.rsp);
                self.state.cet.ssp = snapshot.ssp;
            }
        }
        self.exc = ExceptionState::default();
        self.events.clear(Events::GUEST_ONLY);
        debug!(
            reason = ?exit.reason,
            qualification = exit.qualification,
            info = exit.info,
            "VM exit"
        );
        Fault::Exit(CpuExit::VmExit(exit))
    }
}
