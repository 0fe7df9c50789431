//! Exception preprocessing and event delivery through the IVT (real mode) or the IDT
//! (protected and long mode).
//!
//! Every delivery path returns `Result<(), Fault>`. A fault raised while an event is being
//! delivered unwinds to [`CpuCore::deliver_fault`], which feeds it back into exception
//! preprocessing as the second exception of the pair, so escalation to `#DF` and triple fault
//! fall out of the same loop.

use tracing::{debug, error, trace, warn};

use crate::cpu::{CpuCore, ExceptionState};
use crate::descriptors::{read_descriptor, system_type, Descriptor, Gate, Selector};
use crate::events::{ActivityState, DebugTrap, Events};
use crate::exceptions::{
    CpuExit, Escalation, EventRecord, EventType, Exception, ExceptionClass, ExceptionKind, Fault,
    InternalError, ResetKind,
};
use crate::intercept::InterceptEvent;
use crate::mem::{is_canonical, CpuBus};
use crate::state::{
    Cr4, Dr7, SegReg, SegmentRegister, RFLAGS_AC, RFLAGS_IF, RFLAGS_IOPL_MASK, RFLAGS_NT,
    RFLAGS_RF, RFLAGS_TF, RFLAGS_VIF, RFLAGS_VM,
};

/// Pending debug conditions reported in a VMX `#DB` exit qualification.
const DEBUG_EXIT_QUALIFICATION: u32 = 0x600f;
/// DR6 bits an exception delivery updates: B0-B3, BD, BS, BT.
const DR6_EVENT_BITS: u32 = 0xe00f;

/// Interrupt-raising instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftwareInterrupt {
    /// `INT imm8`.
    Int(u8),
    Int3,
    Into,
    /// `INT1` / ICEBP.
    Int1,
}

impl SoftwareInterrupt {
    pub fn vector(self) -> u8 {
        match self {
            SoftwareInterrupt::Int(vector) => vector,
            SoftwareInterrupt::Int3 => Exception::Breakpoint.vector(),
            SoftwareInterrupt::Into => Exception::Overflow.vector(),
            SoftwareInterrupt::Int1 => Exception::Debug.vector(),
        }
    }

    pub fn event_type(self) -> EventType {
        match self {
            SoftwareInterrupt::Int(_) => EventType::SoftwareInterrupt,
            SoftwareInterrupt::Int3 | SoftwareInterrupt::Into => EventType::SoftwareException,
            SoftwareInterrupt::Int1 => EventType::PrivilegedSoftwareException,
        }
    }
}

fn write_sized<B: CpuBus + ?Sized>(
    bus: &mut B,
    addr: u64,
    value: u64,
    size: u32,
) -> Result<(), Fault> {
    match size {
        2 => bus.write_u16(addr, value as u16),
        4 => bus.write_u32(addr, value as u32),
        _ => bus.write_u64(addr, value),
    }
}

/// A legacy stack that is not SS yet: the inner stack of a privilege change.
struct NewStack {
    selector: Selector,
    cache: Descriptor,
    sp: u32,
}

impl NewStack {
    fn push<B: CpuBus + ?Sized>(&mut self, bus: &mut B, value: u64, size: u32) -> Result<(), Fault> {
        let mask = if self.cache.default_big { u32::MAX } else { 0xffff };
        let sp = self.sp.wrapping_sub(size) & mask;
        if !self.cache.contains(sp, size) {
            return Err(Fault::ss(self.selector.error_code()));
        }
        write_sized(bus, self.cache.base.wrapping_add(u64::from(sp)) & 0xffff_ffff, value, size)?;
        self.sp = sp;
        Ok(())
    }
}

impl CpuCore {
    /// Raises `exception` and delivers it, escalating to `#DF` or a triple fault as needed.
    ///
    /// `Ok` means the handler is now the current context. `Err` leaves the core: a VM exit,
    /// a reset or shutdown after a triple fault, or an internal error.
    pub fn exception<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        exception: Exception,
        error_code: u32,
    ) -> Result<(), CpuExit> {
        self.deliver_fault(bus, Fault::new(exception, error_code))
    }

    /// Delivers the fault an emulated instruction (or a delivery) returned.
    pub fn deliver_fault<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        fault: Fault,
    ) -> Result<(), CpuExit> {
        let mut fault = fault;
        loop {
            let result = match fault {
                Fault::Exception {
                    exception,
                    error_code,
                } => self.raise(bus, exception, error_code, 0),
                Fault::PageFault {
                    address,
                    error_code,
                } => self.raise(bus, Exception::PageFault, error_code, address),
                Fault::Exit(exit) => return Err(exit),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(next) => fault = next,
            }
        }
    }

    fn raise<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        exception: Exception,
        error_code: u32,
        fault_address: u64,
    ) -> Result<(), Fault> {
        let push_error = exception.pushes_error_code();
        let mut error_code = if push_error { error_code } else { 0 };
        if !matches!(
            exception,
            Exception::PageFault | Exception::DoubleFault | Exception::ControlProtection
        ) {
            error_code = (error_code & 0xfffe) | u32::from(self.exc.ext);
        }
        debug!(?exception, error_code, rip = self.state.prev_rip, "exception");

        let record = EventRecord {
            vector: exception.vector(),
            event_type: EventType::HardwareException,
            error_code: push_error.then_some(error_code),
        };
        let aux = match exception {
            Exception::PageFault => fault_address,
            Exception::Debug => u64::from(self.events.debug_trap.bits() & DEBUG_EXIT_QUALIFICATION),
            _ => 0,
        };
        let event = InterceptEvent::Exception {
            record,
            exception: Some(exception),
            aux,
        };
        if let Some(exit) = self.intercept.should_intercept(&event) {
            if exception == Exception::DoubleFault {
                self.exc.in_event = false;
            }
            return Err(self.vm_exit(exit));
        }

        if exception == Exception::PageFault {
            self.state.control.cr2 = fault_address;
        }
        if exception.kind() == ExceptionKind::Fault {
            self.state.rip = self.state.prev_rip;
            if let Some(snapshot) = self.exc.speculative.take() {
                self.state.set_rsp(snapshot.rsp);
                self.state.cet.ssp = snapshot.ssp;
            }
            if exception != Exception::Debug {
                self.state.set_flag(RFLAGS_RF, true);
            }
        }
        if exception == Exception::Debug {
            let dr6 = self.state.debug.dr6;
            let bits = self.events.debug_trap.bits() & DR6_EVENT_BITS;
            self.state.debug.dr6 = (dr6 & 0xffff_6ff0) | bits;
            self.state.debug.dr7.0 &= !Dr7::GD;
        }

        self.exc.ext = true;
        let first = self.exc.last_exception_type;
        match ExceptionClass::escalation(first, exception.class()) {
            Escalation::Deliver => {}
            Escalation::DoubleFault => {
                warn!(?first, ?exception, "exception during delivery, raising #DF");
                return Err(Fault::new(Exception::DoubleFault, 0));
            }
            Escalation::TripleFault => return Err(self.triple_fault()),
        }
        self.exc.last_exception_type = exception.class();

        let error_code = record.error_code.filter(|_| !self.state.real_mode());
        self.interrupt(bus, exception.vector(), EventType::HardwareException, error_code)?;
        self.exc.last_exception_type = ExceptionClass::Benign;
        Ok(())
    }

    /// Executes `INT n`, `INT3`, `INTO` or `INT1`.
    ///
    /// `rip` must already point past the instruction and `prev_rip` at it, so that a fault
    /// during delivery reports the interrupting instruction.
    pub fn software_interrupt<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        int: SoftwareInterrupt,
    ) -> Result<(), CpuExit> {
        match self.deliver_software_interrupt(bus, int) {
            Ok(()) => Ok(()),
            Err(fault) => self.deliver_fault(bus, fault),
        }
    }

    fn deliver_software_interrupt<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        int: SoftwareInterrupt,
    ) -> Result<(), Fault> {
        let vector = int.vector();
        let event_type = int.event_type();
        if int == SoftwareInterrupt::Int1 {
            self.exc.ext = true;
        }
        self.intercept(InterceptEvent::Exception {
            record: EventRecord {
                vector,
                event_type,
                error_code: None,
            },
            exception: Exception::try_from(vector).ok(),
            aux: 0,
        })?;
        self.interrupt(bus, vector, event_type, None)
    }

    /// Transfers control to the handler of `vector` in the current operating mode.
    pub(crate) fn interrupt<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
        event_type: EventType,
        error_code: Option<u32>,
    ) -> Result<(), Fault> {
        debug!(
            vector,
            ?event_type,
            error_code,
            mode = ?self.state.mode(),
            cpl = self.state.cpl(),
            "delivering event"
        );
        // Traps and shadows of the interrupted context do not carry into the handler.
        self.events.debug_trap = DebugTrap::empty();
        self.events.clear_inhibit();

        self.exc.in_event = true;
        self.exc.delivering = Some(EventRecord {
            vector,
            event_type,
            error_code,
        });
        self.begin_speculative_rsp();

        let redirected = event_type == EventType::SoftwareInterrupt
            && self.state.v8086_mode()
            && self.v86_redirect_interrupt(bus, vector)?;
        if !redirected {
            if self.state.real_mode() {
                self.real_mode_int(bus, vector)?;
            } else if self.state.long_mode() {
                self.long_mode_int(bus, vector, event_type, error_code)?;
            } else {
                self.protected_mode_int(bus, vector, event_type, error_code)?;
            }
        }

        self.commit_speculative_rsp();
        self.exc.in_event = false;
        self.exc.delivering = None;
        self.events.unmask(Events::VMX_MONITOR_TRAP_FLAG);
        self.exc.ext = false;
        self.state.prev_rip = self.state.rip;
        Ok(())
    }

    /// Pushes `size` bytes on the current stack.
    pub(crate) fn push_value<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        value: u64,
        size: u32,
    ) -> Result<(), Fault> {
        let rsp = self.state.rsp();
        if self.state.long64_mode() {
            let new_rsp = rsp.wrapping_sub(u64::from(size));
            if !is_canonical(new_rsp) {
                return Err(Fault::ss(0));
            }
            write_sized(bus, new_rsp, value, size)?;
            self.state.set_rsp(new_rsp);
            return Ok(());
        }

        let ss = self.state.seg(SegReg::Ss).cache;
        let mask: u64 = if ss.default_big { 0xffff_ffff } else { 0xffff };
        let new_sp = (rsp.wrapping_sub(u64::from(size)) & mask) as u32;
        if !ss.contains(new_sp, size) {
            return Err(Fault::ss(0));
        }
        write_sized(bus, ss.base.wrapping_add(u64::from(new_sp)) & 0xffff_ffff, value, size)?;
        if ss.default_big {
            self.state.set_rsp(u64::from(new_sp));
        } else {
            self.state.set_rsp((rsp & !0xffff) | u64::from(new_sp));
        }
        Ok(())
    }

    fn real_mode_int<B: CpuBus + ?Sized>(&mut self, bus: &mut B, vector: u8) -> Result<(), Fault> {
        let idtr = self.state.idtr;
        let entry = u32::from(vector) * 4;
        if entry + 3 > u32::from(idtr.limit) {
            debug!(vector, limit = idtr.limit, "vector outside IVT limit");
            return Err(Fault::gp0());
        }

        let flags = self.state.rflags & 0xffff;
        let cs = self.state.seg(SegReg::Cs).selector;
        let ip = self.state.rip & 0xffff;
        self.push_value(bus, flags, 2)?;
        self.push_value(bus, u64::from(cs), 2)?;
        self.push_value(bus, ip, 2)?;

        let entry = idtr.base.wrapping_add(u64::from(entry));
        let new_ip = bus.read_u16(entry)?;
        if u32::from(new_ip) > self.state.seg(SegReg::Cs).cache.limit {
            return Err(Fault::gp0());
        }
        let new_cs = bus.read_u16(entry.wrapping_add(2))?;
        self.state.load_real_mode_segment(SegReg::Cs, new_cs);
        self.state.rip = u64::from(new_ip);
        self.state.rflags &= !(RFLAGS_IF | RFLAGS_TF | RFLAGS_AC | RFLAGS_RF);
        Ok(())
    }

    /// `INT n` in virtual-8086 mode. Returns `true` when the interrupt was redirected to the
    /// real-mode handler in the IVT, `false` when protected-mode delivery should proceed.
    fn v86_redirect_interrupt<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
    ) -> Result<bool, Fault> {
        let iopl = self.state.iopl();
        if self.state.control.cr4.contains(Cr4::VME) {
            let tr = self.state.tr.cache;
            if tr.limit < 103 {
                return Err(Fault::gp0());
            }
            let io_base = bus.read_u16(tr.base.wrapping_add(102))?;
            // The redirection bitmap sits in the 32 bytes below the I/O permission bitmap.
            let offset = u32::from(io_base)
                .wrapping_sub(32)
                .wrapping_add(u32::from(vector / 8));
            if offset > tr.limit {
                debug!(vector, offset, "redirection bitmap outside TSS limit");
                return Err(Fault::gp0());
            }
            let bitmap = bus.read_u8(tr.base.wrapping_add(u64::from(offset)))?;
            if bitmap & (1 << (vector & 7)) == 0 {
                let mut flags = self.state.rflags & 0xffff;
                if iopl < 3 {
                    flags |= RFLAGS_IOPL_MASK;
                    if self.state.flag(RFLAGS_VIF) {
                        flags |= RFLAGS_IF;
                    } else {
                        flags &= !RFLAGS_IF;
                    }
                }
                let entry = u64::from(vector) * 4;
                let ip = bus.read_u16(entry)?;
                let cs = bus.read_u16(entry + 2)?;

                let old_cs = self.state.seg(SegReg::Cs).selector;
                let old_ip = self.state.rip & 0xffff;
                self.push_value(bus, flags, 2)?;
                self.push_value(bus, u64::from(old_cs), 2)?;
                self.push_value(bus, old_ip, 2)?;

                self.state.load_real_mode_segment(SegReg::Cs, cs);
                self.state.rip = u64::from(ip);
                self.state.rflags &= !(RFLAGS_TF | RFLAGS_RF);
                if iopl == 3 {
                    self.state.set_flag(RFLAGS_IF, false);
                } else {
                    self.state.set_flag(RFLAGS_VIF, false);
                }
                trace!(vector, cs, ip, "virtual-8086 interrupt redirected");
                return Ok(true);
            }
        }
        if iopl < 3 {
            return Err(Fault::gp0());
        }
        Ok(false)
    }

    fn protected_mode_int<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
        event_type: EventType,
        error_code: Option<u32>,
    ) -> Result<(), Fault> {
        let gate_error = u16::from(vector) * 8 + 2;
        let idtr = self.state.idtr;
        if u32::from(vector) * 8 + 7 > u32::from(idtr.limit) {
            debug!(vector, limit = idtr.limit, "vector outside IDT limit");
            return Err(Fault::gp(gate_error));
        }
        let raw = bus.read_u64(idtr.base.wrapping_add(u64::from(vector) * 8))?;
        let gate = Gate::parse(raw);
        if !gate.is_valid() || gate.segment {
            return Err(Fault::gp(gate_error));
        }
        if !matches!(
            gate.typ,
            system_type::TASK_GATE
                | system_type::INTERRUPT_GATE_286
                | system_type::TRAP_GATE_286
                | system_type::INTERRUPT_GATE_386
                | system_type::TRAP_GATE_386
        ) {
            debug!(vector, typ = gate.typ, "bad IDT gate type");
            return Err(Fault::gp(gate_error));
        }
        if event_type.is_software() && gate.dpl < self.state.cpl() {
            return Err(Fault::gp(gate_error));
        }
        if !gate.present {
            return Err(Fault::np(gate_error));
        }

        match gate.typ {
            system_type::TASK_GATE => self.task_gate_int(bus, gate.selector, error_code),
            system_type::INTERRUPT_GATE_286
            | system_type::TRAP_GATE_286
            | system_type::INTERRUPT_GATE_386
            | system_type::TRAP_GATE_386 => self.int_trap_gate(bus, gate, error_code),
            gate_type => Err(InternalError::UnexpectedGateType { vector, gate_type }.into()),
        }
    }

    fn task_gate_int<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
        error_code: Option<u32>,
    ) -> Result<(), Fault> {
        if selector.ti() {
            return Err(Fault::gp(selector.error_code()));
        }
        let Some(raw) = read_descriptor(bus, &self.state, selector)? else {
            return Err(Fault::gp(selector.error_code()));
        };
        let tss = Descriptor::parse(raw);
        if !tss.valid
            || tss.segment
            || !matches!(tss.typ, system_type::AVAIL_286_TSS | system_type::AVAIL_386_TSS)
        {
            return Err(Fault::gp(selector.error_code()));
        }
        if !tss.present {
            return Err(Fault::np(selector.error_code()));
        }
        self.task_switch_from_interrupt(bus, selector, tss, error_code)
    }

    /// Validates the code segment an interrupt or trap gate points at.
    fn gate_code_segment<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
    ) -> Result<Descriptor, Fault> {
        if selector.is_null() {
            return Err(Fault::gp0());
        }
        let Some(raw) = read_descriptor(bus, &self.state, selector)? else {
            return Err(Fault::gp(selector.error_code()));
        };
        let cs = Descriptor::parse(raw);
        if !cs.valid || !cs.is_code() || cs.dpl > self.state.cpl() {
            return Err(Fault::gp(selector.error_code()));
        }
        Ok(cs)
    }

    fn int_trap_gate<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        gate: Gate,
        error_code: Option<u32>,
    ) -> Result<(), Fault> {
        let cs_selector = gate.selector;
        let cs = self.gate_code_segment(bus, cs_selector)?;
        if !cs.present {
            return Err(Fault::np(cs_selector.error_code()));
        }

        let cpl = self.state.cpl();
        let v8086 = self.state.v8086_mode();
        let size = if gate.is_386() { 4 } else { 2 };
        let old_cs = self.state.seg(SegReg::Cs).selector;
        let old_eip = self.state.rip & 0xffff_ffff;
        let old_lip = self.state.linear_rip();
        let old_flags = self.state.rflags & 0xffff_ffff;

        if !cs.is_conforming_code() && cs.dpl < cpl {
            let new_cpl = cs.dpl;
            let (ss_raw, esp) = self.stack_from_tss(bus, new_cpl)?;
            if v8086 && new_cpl != 0 {
                return Err(Fault::gp(cs_selector.error_code()));
            }
            let ss_selector = Selector(ss_raw);
            if ss_selector.is_null() {
                return Err(Fault::ts(0));
            }
            let Some(raw) = read_descriptor(bus, &self.state, ss_selector)? else {
                return Err(Fault::ts(ss_selector.error_code()));
            };
            if ss_selector.rpl() != new_cpl {
                return Err(Fault::ts(ss_selector.error_code()));
            }
            let ss = Descriptor::parse(raw);
            if !ss.valid || ss.dpl != new_cpl || !ss.is_writable_data() {
                return Err(Fault::ts(ss_selector.error_code()));
            }
            if !ss.present {
                return Err(Fault::ss(ss_selector.error_code()));
            }
            if gate.offset > u64::from(cs.limit) {
                return Err(Fault::gp0());
            }

            let mut stack = NewStack {
                selector: ss_selector,
                cache: ss,
                sp: esp,
            };
            if v8086 {
                for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                    stack.push(bus, u64::from(self.state.seg(seg).selector), size)?;
                }
            }
            let old_ss = self.state.seg(SegReg::Ss).selector;
            let old_esp = self.state.rsp() & 0xffff_ffff;
            for value in [u64::from(old_ss), old_esp, old_flags, u64::from(old_cs), old_eip] {
                stack.push(bus, value, size)?;
            }
            if let Some(ec) = error_code {
                stack.push(bus, u64::from(ec), size)?;
            }

            self.shadow_stack_transfer(bus, cpl, new_cpl, true, 0, old_cs, old_lip)?;

            *self.state.seg_mut(SegReg::Ss) = SegmentRegister {
                selector: (ss_selector.0 & 0xfffc) | u16::from(new_cpl),
                cache: ss,
            };
            if ss.default_big {
                self.state.set_rsp(u64::from(stack.sp));
            } else {
                let rsp = self.state.rsp();
                self.state.set_rsp((rsp & !0xffff) | u64::from(stack.sp));
            }
            *self.state.seg_mut(SegReg::Cs) = SegmentRegister {
                selector: (cs_selector.0 & 0xfffc) | u16::from(new_cpl),
                cache: cs,
            };
            if v8086 {
                for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                    self.state.load_null_selector(seg, 0);
                }
            }
        } else {
            if v8086 && (cs.is_conforming_code() || cs.dpl != 0) {
                return Err(Fault::gp(cs_selector.error_code()));
            }
            if gate.offset > u64::from(cs.limit) {
                return Err(Fault::gp0());
            }
            self.push_value(bus, old_flags, size)?;
            self.push_value(bus, u64::from(old_cs), size)?;
            self.push_value(bus, old_eip, size)?;
            if let Some(ec) = error_code {
                self.push_value(bus, u64::from(ec), size)?;
            }

            self.shadow_stack_transfer(bus, cpl, cpl, false, 0, old_cs, old_lip)?;

            *self.state.seg_mut(SegReg::Cs) = SegmentRegister {
                selector: (cs_selector.0 & 0xfffc) | u16::from(cpl),
                cache: cs,
            };
        }

        self.state.rip = gate.offset;
        if gate.is_interrupt_gate() {
            self.state.set_flag(RFLAGS_IF, false);
        }
        self.state.rflags &= !(RFLAGS_TF | RFLAGS_NT | RFLAGS_VM | RFLAGS_RF);
        Ok(())
    }

    /// SS:ESP for privilege level `pl` from the current 286 or 386 TSS.
    fn stack_from_tss<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        pl: u8,
    ) -> Result<(u16, u32), Fault> {
        let tr = self.state.tr;
        let invalid_tss = Fault::ts(Selector(tr.selector).error_code());
        match tr.cache.typ {
            system_type::AVAIL_386_TSS | system_type::BUSY_386_TSS => {
                let offset = 8 * u32::from(pl) + 4;
                if offset + 7 > tr.cache.limit {
                    return Err(invalid_tss);
                }
                let addr = tr.cache.base.wrapping_add(u64::from(offset));
                let esp = bus.read_u32(addr)?;
                let ss = bus.read_u16(addr.wrapping_add(4))?;
                Ok((ss, esp))
            }
            system_type::AVAIL_286_TSS | system_type::BUSY_286_TSS => {
                let offset = 4 * u32::from(pl) + 2;
                if offset + 3 > tr.cache.limit {
                    return Err(invalid_tss);
                }
                let addr = tr.cache.base.wrapping_add(u64::from(offset));
                let sp = bus.read_u16(addr)?;
                let ss = bus.read_u16(addr.wrapping_add(2))?;
                Ok((ss, u32::from(sp)))
            }
            typ => {
                error!(typ, "TR does not hold a TSS");
                Err(InternalError::InvalidTaskRegister(typ).into())
            }
        }
    }

    /// RSP0-2 (`n` < 3) or IST1-7 (`n` = 3 + index) from the 64-bit TSS.
    fn rsp_from_tss<B: CpuBus + ?Sized>(&mut self, bus: &mut B, n: u8) -> Result<u64, Fault> {
        let tr = self.state.tr;
        if !tr.cache.is_386_tss() {
            error!(typ = tr.cache.typ, "TR does not hold a 64-bit TSS");
            return Err(InternalError::InvalidTaskRegister(tr.cache.typ).into());
        }
        let offset = 8 * u32::from(n) + 4;
        if offset + 7 > tr.cache.limit {
            return Err(Fault::ts(Selector(tr.selector).error_code()));
        }
        let rsp = bus.read_u64(tr.cache.base.wrapping_add(u64::from(offset)))?;
        if !is_canonical(rsp) {
            return Err(Fault::ss(0));
        }
        Ok(rsp)
    }

    fn long_mode_int<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        vector: u8,
        event_type: EventType,
        error_code: Option<u32>,
    ) -> Result<(), Fault> {
        let gate_error = u16::from(vector) * 8 + 2;
        let idtr = self.state.idtr;
        if u32::from(vector) * 16 + 15 > u32::from(idtr.limit) {
            debug!(vector, limit = idtr.limit, "vector outside IDT limit");
            return Err(Fault::gp(gate_error));
        }
        let entry = idtr.base.wrapping_add(u64::from(vector) * 16);
        let lo = bus.read_u64(entry)?;
        let hi = bus.read_u64(entry.wrapping_add(8))?;
        if hi & 0x1f00_0000_0000 != 0 {
            return Err(Fault::gp(gate_error));
        }
        let gate = Gate::parse_long(lo, hi);
        if !gate.is_valid() || gate.segment {
            return Err(Fault::gp(gate_error));
        }
        if !matches!(
            gate.typ,
            system_type::INTERRUPT_GATE_386 | system_type::TRAP_GATE_386
        ) {
            debug!(vector, typ = gate.typ, "bad 64-bit IDT gate type");
            return Err(Fault::gp(gate_error));
        }
        let cpl = self.state.cpl();
        if event_type.is_software() && gate.dpl < cpl {
            return Err(Fault::gp(gate_error));
        }
        if !gate.present {
            return Err(Fault::np(gate_error));
        }

        let cs_selector = gate.selector;
        let cs = self.gate_code_segment(bus, cs_selector)?;
        if !cs.long || cs.default_big {
            return Err(Fault::gp(cs_selector.error_code()));
        }
        if !cs.present {
            return Err(Fault::np(cs_selector.error_code()));
        }

        let (new_cpl, rsp) = if !cs.is_conforming_code() && cs.dpl < cpl {
            let entry = if gate.ist > 0 { gate.ist + 3 } else { cs.dpl };
            (cs.dpl, self.rsp_from_tss(bus, entry)?)
        } else if gate.ist > 0 {
            (cpl, self.rsp_from_tss(bus, gate.ist + 3)?)
        } else {
            (cpl, self.state.rsp())
        };

        let old_cs = self.state.seg(SegReg::Cs).selector;
        let old_lip = self.state.linear_rip();
        let frame = [
            u64::from(self.state.seg(SegReg::Ss).selector),
            self.state.rsp(),
            self.state.rflags,
            u64::from(old_cs),
            self.state.rip,
        ];
        let mut sp = rsp & !0xf;
        for value in frame.into_iter().chain(error_code.map(u64::from)) {
            sp = sp.wrapping_sub(8);
            if !is_canonical(sp) {
                return Err(Fault::ss(0));
            }
            bus.write_u64(sp, value)?;
        }
        if !is_canonical(gate.offset) {
            return Err(Fault::gp0());
        }

        let switch = new_cpl != cpl || gate.ist > 0;
        self.shadow_stack_transfer(bus, cpl, new_cpl, switch, gate.ist, old_cs, old_lip)?;

        *self.state.seg_mut(SegReg::Cs) = SegmentRegister {
            selector: (cs_selector.0 & 0xfffc) | u16::from(new_cpl),
            cache: cs,
        };
        if new_cpl != cpl {
            self.state.load_null_selector(SegReg::Ss, u16::from(new_cpl));
        }
        self.state.set_rsp(sp);
        self.state.rip = gate.offset;
        if gate.is_interrupt_gate() {
            self.state.set_flag(RFLAGS_IF, false);
        }
        self.state.rflags &= !(RFLAGS_TF | RFLAGS_RF | RFLAGS_NT);
        Ok(())
    }

    /// Shadow-stack side of a gate transfer. `switch` selects a new shadow stack: PLn_SSP, or
    /// the interrupt SSP table entry when `ist` is non-zero.
    #[allow(clippy::too_many_arguments)]
    fn shadow_stack_transfer<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        old_cpl: u8,
        new_cpl: u8,
        switch: bool,
        ist: u8,
        old_cs: u16,
        old_lip: u64,
    ) -> Result<(), Fault> {
        let old_ssp = self.state.cet.ssp;
        if switch {
            self.save_user_ssp(old_cpl);
            if self.shadow_stack_enabled(new_cpl) {
                let new_ssp = if ist > 0 {
                    let table = self.state.cet.interrupt_ssp_table;
                    bus.read_u64(table.wrapping_add(u64::from(ist) * 8))?
                } else {
                    self.state.cet.pl_ssp[usize::from(new_cpl)]
                };
                self.shadow_stack_switch(bus, new_ssp)?;
            }
        }
        if self.shadow_stack_enabled(new_cpl) && old_cpl != 3 {
            self.call_far_shadow_stack_push(bus, old_cs, old_lip, old_ssp)?;
        }
        Ok(())
    }

    /// Third exception while delivering a `#DF`, or an unrecoverable delivery failure.
    pub(crate) fn triple_fault(&mut self) -> Fault {
        error!(
            rip = self.state.prev_rip,
            cs = self.state.seg(SegReg::Cs).selector,
            "triple fault"
        );
        if let Some(exit) = self.intercept.should_intercept(&InterceptEvent::TripleFault) {
            self.exc.in_event = false;
            return self.vm_exit(exit);
        }
        if self.config.reset_on_triple_fault {
            self.reset(ResetKind::Hardware);
            return Fault::Exit(CpuExit::Reset(ResetKind::Hardware));
        }
        self.shutdown()
    }

    fn shutdown(&mut self) -> Fault {
        self.exc = ExceptionState::default();
        self.enter_sleep_state(ActivityState::Shutdown);
        Fault::Exit(CpuExit::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use crate::descriptors::encode;
    use crate::intercept::{InterceptPolicy, VmExitReason, VmxControls, VmxExitReason};
    use crate::mem::FlatTestBus;
    use crate::state::{Cr0, CET_SH_STK_EN, RFLAGS_RESERVED1};
    use crate::test_support::*;

    #[test]
    fn user_fault_switches_to_kernel_stack() {
        let (mut core, mut bus) = protected_mode();
        set_gate(&mut bus, 13, 0x5000, system_type::INTERRUPT_GATE_386, 0);
        // Faulting mid-instruction: RIP already advanced.
        core.state.rip = 0x4003;

        core.exception(&mut bus, Exception::GeneralProtection, 0x10)
            .unwrap();

        assert_eq!(core.state.seg(SegReg::Cs).selector, KERNEL_CS);
        assert_eq!(core.state.seg(SegReg::Ss).selector, KERNEL_DS);
        assert_eq!(core.state.cpl(), 0);
        assert_eq!(core.state.rip, 0x5000);
        assert_eq!(core.state.rsp(), KERNEL_STACK - 24);
        assert!(!core.state.flag(RFLAGS_IF));
        assert!(!core.state.flag(RFLAGS_RF));

        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 1), u32::from(USER_DS));
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 2), 0x6000);
        // RF is set in the saved image of a fault.
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 3), 0x1_0202);
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 4), u32::from(USER_CS));
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 5), 0x4000);
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 6), 0x10);

        assert_eq!(core.exc, ExceptionState::default());
    }

    #[test]
    fn int_n_checks_gate_dpl() {
        let (mut core, mut bus) = protected_mode();
        set_gate(&mut bus, 13, 0x5000, system_type::INTERRUPT_GATE_386, 0);
        set_gate(&mut bus, 0x80, 0x5800, system_type::TRAP_GATE_386, 0);
        core.state.rip = 0x4002;

        core.software_interrupt(&mut bus, SoftwareInterrupt::Int(0x80))
            .unwrap();

        assert_eq!(core.state.rip, 0x5000);
        // #GP(IDT index) without EXT, reported at the INT instruction.
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 6), 0x80 * 8 + 2);
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 5), 0x4000);
    }

    #[test]
    fn int_n_through_user_trap_gate_keeps_if() {
        let (mut core, mut bus) = protected_mode();
        set_gate(&mut bus, 0x80, 0x5800, system_type::TRAP_GATE_386, 3);
        core.state.rip = 0x4002;

        core.software_interrupt(&mut bus, SoftwareInterrupt::Int(0x80))
            .unwrap();

        assert_eq!(core.state.rip, 0x5800);
        assert!(core.state.flag(RFLAGS_IF));
        assert_eq!(core.state.rsp(), KERNEL_STACK - 20);
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 5), 0x4002);
    }

    #[test]
    fn real_mode_uses_ivt_and_three_word_frame() {
        let mut core = CpuCore::new(CpuConfig::i486()).unwrap();
        let mut bus = FlatTestBus::new(0x20000);
        bus.write_u16(0x20 * 4, 0x5678).unwrap();
        bus.write_u16(0x20 * 4 + 2, 0x1234).unwrap();
        core.state.set_rsp(0x100);
        core.state.rflags = RFLAGS_RESERVED1 | RFLAGS_IF | RFLAGS_TF;

        core.interrupt(&mut bus, 0x20, EventType::ExternalInterrupt, None)
            .unwrap();

        assert_eq!(core.state.seg(SegReg::Cs).selector, 0x1234);
        assert_eq!(core.state.seg(SegReg::Cs).cache.base, 0x12340);
        assert_eq!(core.state.rip, 0x5678);
        assert_eq!(core.state.rsp(), 0xfa);
        assert_eq!(bus.read_u16(0xfa).unwrap(), 0xfff0);
        assert_eq!(bus.read_u16(0xfc).unwrap(), 0xf000);
        assert_eq!(bus.read_u16(0xfe).unwrap(), 0x0302);
        assert!(!core.state.flag(RFLAGS_IF | RFLAGS_TF));
    }

    #[test]
    fn real_mode_ivt_limit_escalates() {
        let mut core = CpuCore::new(CpuConfig::i486()).unwrap();
        let mut bus = FlatTestBus::new(0x20000);
        core.state.set_rsp(0x100);
        core.state.idtr.limit = 0;

        // #GP during #GP delivery becomes #DF, whose delivery fails again.
        assert_eq!(
            core.exception(&mut bus, Exception::GeneralProtection, 0),
            Err(CpuExit::Reset(ResetKind::Hardware))
        );
        assert_eq!(core.state.rip, 0xfff0);
        assert_eq!(core.exc.last_exception_type, ExceptionClass::Benign);
    }

    #[test]
    fn triple_fault_without_reset_shuts_down() {
        let mut config = CpuConfig::i486();
        config.reset_on_triple_fault = false;
        let mut core = CpuCore::new(config).unwrap();
        let mut bus = FlatTestBus::new(0x20000);
        core.state.idtr.limit = 0;
        core.state.rflags |= RFLAGS_IF;

        assert_eq!(
            core.exception(&mut bus, Exception::StackFault, 0),
            Err(CpuExit::Shutdown)
        );
        assert_eq!(core.events.activity, ActivityState::Shutdown);
        assert!(!core.state.flag(RFLAGS_IF));
    }

    #[test]
    fn page_fault_loads_cr2() {
        let (mut core, mut bus) = protected_mode();
        set_gate(&mut bus, 14, 0x5400, system_type::INTERRUPT_GATE_386, 0);

        core.deliver_fault(
            &mut bus,
            Fault::PageFault {
                address: 0xdead_b000,
                error_code: 0x6,
            },
        )
        .unwrap();

        assert_eq!(core.state.control.cr2, 0xdead_b000);
        // #PF error codes never get the EXT bit.
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 6), 0x6);
    }

    #[test]
    fn debug_exception_updates_dr6_and_clears_gd() {
        let mut core = CpuCore::new(CpuConfig::i486()).unwrap();
        let mut bus = FlatTestBus::new(0x20000);
        core.state.set_rsp(0x100);
        core.state.debug.dr7 = Dr7(Dr7::GD | 0x400);
        core.events.debug_trap = DebugTrap::DR_ACCESS | DebugTrap::B1;

        core.exception(&mut bus, Exception::Debug, 0).unwrap();

        assert_eq!(core.state.debug.dr6, 0xffff_2ff2);
        assert!(!core.state.debug.dr7.general_detect());
        assert!(core.events.debug_trap.is_empty());
    }

    #[test]
    fn debug_exception_keeps_sticky_bs_and_bd() {
        let mut core = CpuCore::new(CpuConfig::i486()).unwrap();
        let mut bus = FlatTestBus::new(0x20000);
        core.state.set_rsp(0x100);
        core.state.debug.dr6 = 0xffff_0ff0 | (1 << 13) | (1 << 14);
        core.events.debug_trap = DebugTrap::B0 | DebugTrap::HIT;

        core.exception(&mut bus, Exception::Debug, 0).unwrap();

        assert_eq!(core.state.debug.dr6, 0xffff_6ff1);
    }

    #[test]
    fn contributory_pair_delivers_double_fault() {
        let (mut core, mut bus) = protected_mode();
        set_gate(&mut bus, 8, 0x5100, system_type::INTERRUPT_GATE_386, 0);
        // #NP handler is not present.
        let missing = encode::gate(0x5200, KERNEL_CS, system_type::INTERRUPT_GATE_386, 0);
        bus.write_u64(IDT + 11 * 8, missing & !(1 << 47)).unwrap();
        bus.write_u64(IDT + 13 * 8, missing & !(1 << 47)).unwrap();

        core.exception(&mut bus, Exception::SegmentNotPresent, 0x18)
            .unwrap();

        assert_eq!(core.state.rip, 0x5100);
        assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 6), 0);
        assert_eq!(core.exc.last_exception_type, ExceptionClass::Benign);
    }

    #[test]
    fn vmx_exit_during_delivery_reports_idt_vectoring() {
        let (mut core, mut bus) = protected_mode();
        core.intercept = InterceptPolicy::Vmx(VmxControls {
            exception_bitmap: 1 << 13,
            ..VmxControls::default()
        });
        core.state.idtr.limit = 0xff;
        core.exc.ext = true;

        let fault = core
            .interrupt(&mut bus, 0x20, EventType::ExternalInterrupt, None)
            .unwrap_err();
        let Err(CpuExit::VmExit(exit)) = core.deliver_fault(&mut bus, fault) else {
            panic!("expected a VM exit");
        };

        assert_eq!(exit.reason, VmExitReason::Vmx(VmxExitReason::ExceptionOrNmi));
        assert_eq!(exit.error_code, Some(0x20 * 8 + 2 + 1));
        assert_eq!(
            exit.idt_vectoring,
            Some(EventRecord {
                vector: 0x20,
                event_type: EventType::ExternalInterrupt,
                error_code: None,
            })
        );
        assert_eq!(core.state.rsp(), 0x6000);
        assert!(!core.exc.in_event);
    }

    fn v86_mode() -> (CpuCore, FlatTestBus) {
        let (mut core, mut bus) = protected_mode();
        core.state.rflags = RFLAGS_RESERVED1 | RFLAGS_VM | RFLAGS_IF | RFLAGS_VIF;
        for (seg, selector) in [
            (SegReg::Cs, 0x0100),
            (SegReg::Ss, 0x0800),
            (SegReg::Ds, 0x0200),
            (SegReg::Es, 0x0300),
            (SegReg::Fs, 0x0400),
            (SegReg::Gs, 0x0500),
        ] {
            core.state.load_real_mode_segment(seg, selector);
        }
        core.state.set_rsp(0x100);
        core.state.rip = 0x12;
        core.state.prev_rip = 0x10;
        // I/O bitmap at 0x88, redirection bitmap just below it.
        bus.write_u16(TSS + 102, 0x88).unwrap();
        (core, bus)
    }

    #[test]
    fn v86_int_redirected_through_ivt() {
        let (mut core, mut bus) = v86_mode();
        core.state.control.cr4 |= Cr4::VME;
        bus.write_u16(0x21 * 4, 0x1111).unwrap();
        bus.write_u16(0x21 * 4 + 2, 0x0200).unwrap();

        core.software_interrupt(&mut bus, SoftwareInterrupt::Int(0x21))
            .unwrap();

        assert!(core.state.v8086_mode());
        assert_eq!(core.state.seg(SegReg::Cs).selector, 0x0200);
        assert_eq!(core.state.rip, 0x1111);
        assert!(!core.state.flag(RFLAGS_VIF));
        assert!(core.state.flag(RFLAGS_IF));
        let frame = 0x8000 + 0x100 - 6;
        assert_eq!(bus.read_u16(frame).unwrap(), 0x12);
        assert_eq!(bus.read_u16(frame + 2).unwrap(), 0x0100);
        // IOPL reads as 3 and IF mirrors VIF.
        assert_eq!(bus.read_u16(frame + 4).unwrap(), 0x3202);
    }

    #[test]
    fn v86_int_with_low_iopl_faults_into_ring_zero() {
        let (mut core, mut bus) = v86_mode();
        set_gate(&mut bus, 13, 0x5000, system_type::INTERRUPT_GATE_386, 0);

        core.software_interrupt(&mut bus, SoftwareInterrupt::Int(0x21))
            .unwrap();

        assert!(!core.state.v8086_mode());
        assert_eq!(core.state.cpl(), 0);
        assert_eq!(core.state.rsp(), KERNEL_STACK - 40);
        let pushed: Vec<u32> = (1..=10).map(|n| stack_u32(&mut bus, KERNEL_STACK, n)).collect();
        assert_eq!(
            pushed,
            [0x0500, 0x0400, 0x0200, 0x0300, 0x0800, 0x100, 0xb_0202, 0x0100, 0x10, 0]
        );
        for seg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
            assert_eq!(core.state.seg(seg).selector, 0);
        }
    }


    #[test]
    fn long_mode_inner_privilege_frame() {
        let (mut core, mut bus) = long_mode();
        assert!(core.state.long64_mode());
        set_gate64(&mut bus, 14, 0xffff_8000_0000_1000, 0);

        core.deliver_fault(
            &mut bus,
            Fault::PageFault {
                address: 0x1234,
                error_code: 4,
            },
        )
        .unwrap();

        assert_eq!(core.state.rip, 0xffff_8000_0000_1000);
        assert_eq!(core.state.cpl(), 0);
        assert_eq!(core.state.seg(SegReg::Ss).selector, 0);
        assert_eq!(core.state.rsp(), 0x9000 - 48);
        let frame: Vec<u64> = (1..=6)
            .map(|n| bus.read_u64(0x9000 - 8 * n).unwrap())
            .collect();
        assert_eq!(
            frame,
            [u64::from(USER_DS), 0x7ff8, 0x1_0202, u64::from(USER_CS), 0x4000, 4]
        );
    }

    #[test]
    fn long_mode_ist_aligns_stack() {
        let (mut core, mut bus) = long_mode();
        load_segment(&mut core, &mut bus, SegReg::Cs, KERNEL_CS);
        set_gate64(&mut bus, 2, 0xffff_8000_0000_2000, 1);

        core.interrupt(&mut bus, 2, EventType::Nmi, None).unwrap();

        assert_eq!(core.state.rsp(), 0xa000 - 40);
        assert_eq!(bus.read_u64(0xa000 - 16).unwrap(), 0x7ff8);
        // Same privilege: SS is kept.
        assert_eq!(core.state.seg(SegReg::Ss).selector, USER_DS);
    }

    #[test]
    fn long_mode_gate_checks() {
        let (mut core, mut bus) = long_mode();
        set_gate64(&mut bus, 0x40, 0x1000, 0);
        let (lo, hi) = encode::gate64(0x1000, KERNEL_DS, system_type::INTERRUPT_GATE_386, 0, 0);
        bus.write_u64(IDT + 0x41 * 16, lo).unwrap();
        bus.write_u64(IDT + 0x41 * 16 + 8, hi).unwrap();

        assert_eq!(
            core.interrupt(&mut bus, 0x41, EventType::ExternalInterrupt, None),
            Err(Fault::gp(KERNEL_DS))
        );
        // Non-zero type bits in the upper quadword.
        bus.write_u64(IDT + 0x40 * 16 + 8, 1 << 40).unwrap();
        assert_eq!(
            core.interrupt(&mut bus, 0x40, EventType::ExternalInterrupt, None),
            Err(Fault::gp(0x40 * 8 + 2))
        );
    }

    #[test]
    fn shadow_stack_switch_on_privilege_change() {
        let (mut core, mut bus) = long_mode();
        core.state.control.cr0 |= Cr0::WP;
        core.state.control.cr4 |= Cr4::CET;
        core.state.cet.s_cet = CET_SH_STK_EN;
        core.state.cet.pl_ssp[0] = 0xc000;
        core.state.cet.ssp = 0xb000;
        bus.write_u64(0xc000, 0xc000).unwrap();
        set_gate64(&mut bus, 0x30, 0xffff_8000_0000_3000, 0);

        core.interrupt(&mut bus, 0x30, EventType::ExternalInterrupt, None)
            .unwrap();

        // Coming from CPL 3: nothing is pushed on the supervisor shadow stack.
        assert_eq!(core.state.cet.ssp, 0xc000);
        assert_eq!(bus.read_u64(0xc000).unwrap(), 0xc001);
        assert_eq!(core.state.cet.pl_ssp[3], 0);
    }
}
