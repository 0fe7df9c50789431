//! Hardware task switch, as started by an event delivered through an IDT task gate.
//!
//! Everything that can fault in the context of the outgoing task (TSS limits, reads of the
//! incoming TSS, stores into the outgoing one) happens before the first register is replaced.
//! Faults raised after that point are taken by the incoming task.

use tracing::{debug, trace};

use crate::cpu::CpuCore;
use crate::descriptors::{read_descriptor, system_type, Descriptor, Selector};
use crate::events::DebugTrap;
use crate::exceptions::Fault;
use crate::intercept::InterceptEvent;
use crate::mem::CpuBus;
use crate::state::{Cr0, Dr7, SegReg, SegmentRegister, RFLAGS_NT, RFLAGS_RESERVED1, RFLAGS_VM};

/// Smallest TSS limit holding the full register image.
const TSS_286_MIN_LIMIT: u32 = 0x2b;
const TSS_386_MIN_LIMIT: u32 = 0x67;
/// The outgoing TSS only needs room for the dynamic fields.
const TSS_286_SAVE_LIMIT: u32 = 0x29;
const TSS_386_SAVE_LIMIT: u32 = 0x5f;

/// EFLAGS bits a task switch loads.
const TASK_EFLAGS_MASK: u32 = 0x3f_7fd5;

/// Segment registers in TSS order.
const TSS_SEGMENTS: [SegReg; 6] = [
    SegReg::Es,
    SegReg::Cs,
    SegReg::Ss,
    SegReg::Ds,
    SegReg::Fs,
    SegReg::Gs,
];

/// Register image of the incoming task.
#[derive(Debug)]
struct TaskImage {
    cr3: Option<u32>,
    eip: u32,
    eflags: u32,
    gpr: [u32; 8],
    sregs: [u16; 6],
    ldt: u16,
    trap: bool,
}

impl TaskImage {
    fn read_386<B: CpuBus + ?Sized>(bus: &mut B, base: u64, paging: bool) -> Result<Self, Fault> {
        let cr3 = if paging {
            Some(bus.read_u32(base + 0x1c)?)
        } else {
            None
        };
        let mut gpr = [0; 8];
        for (n, reg) in gpr.iter_mut().enumerate() {
            *reg = bus.read_u32(base + 0x28 + 4 * n as u64)?;
        }
        let mut sregs = [0; 6];
        for (n, sel) in sregs.iter_mut().enumerate() {
            *sel = bus.read_u16(base + 0x48 + 4 * n as u64)?;
        }
        Ok(Self {
            cr3,
            eip: bus.read_u32(base + 0x20)?,
            eflags: bus.read_u32(base + 0x24)?,
            gpr,
            sregs,
            ldt: bus.read_u16(base + 0x60)?,
            trap: bus.read_u16(base + 0x64)? & 1 != 0,
        })
    }

    fn read_286<B: CpuBus + ?Sized>(bus: &mut B, base: u64) -> Result<Self, Fault> {
        let mut gpr = [0; 8];
        for (n, reg) in gpr.iter_mut().enumerate() {
            *reg = 0xffff_0000 | u32::from(bus.read_u16(base + 18 + 2 * n as u64)?);
        }
        let mut sregs = [0; 6];
        for (n, sel) in sregs.iter_mut().take(4).enumerate() {
            *sel = bus.read_u16(base + 34 + 2 * n as u64)?;
        }
        Ok(Self {
            cr3: None,
            eip: u32::from(bus.read_u16(base + 14)?),
            eflags: u32::from(bus.read_u16(base + 16)?),
            gpr,
            sregs,
            ldt: bus.read_u16(base + 42)?,
            trap: false,
        })
    }
}

impl CpuCore {
    /// Switches to the task described by `tss`, an available and present TSS descriptor
    /// referenced through an IDT task gate. The outgoing task is linked as the back link of
    /// the incoming one and `error_code` lands on the incoming task's stack.
    pub(crate) fn task_switch_from_interrupt<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
        tss: Descriptor,
        error_code: Option<u32>,
    ) -> Result<(), Fault> {
        self.events.debug_trap = DebugTrap::empty();
        self.events.clear_inhibit();
        self.intercept(InterceptEvent::TaskSwitch {
            selector: selector.0,
            error_code,
        })?;

        let new_386 = tss.is_386_tss();
        let new_min = if new_386 {
            TSS_386_MIN_LIMIT
        } else {
            TSS_286_MIN_LIMIT
        };
        if selector.ti() || !tss.valid || tss.limit < new_min {
            return Err(Fault::ts(selector.error_code()));
        }

        let old_tr = self.state.tr;
        let old_386 = old_tr.cache.is_386_tss();
        let old_min = if old_386 {
            TSS_386_SAVE_LIMIT
        } else {
            TSS_286_SAVE_LIMIT
        };
        if old_tr.cache.limit < old_min {
            return Err(Fault::ts(old_tr.selector & 0xfffc));
        }

        let nbase = tss.base & 0xffff_ffff;
        let obase = old_tr.cache.base & 0xffff_ffff;
        debug!(
            from = old_tr.selector,
            to = selector.0,
            error_code,
            "task switch through task gate"
        );

        // Both ends of the incoming TSS must be readable before anything is written.
        bus.read_u8(nbase)?;
        bus.read_u8(nbase + u64::from(new_min))?;

        // The outgoing task keeps NT: it is nested underneath the incoming one.
        if old_386 {
            self.save_386_task(bus, obase)?;
        } else {
            self.save_286_task(bus, obase)?;
        }
        bus.write_u16(nbase, old_tr.selector)?;

        let paging = self.state.control.cr0.contains(Cr0::PG);
        let image = if new_386 {
            TaskImage::read_386(bus, nbase, paging)?
        } else {
            TaskImage::read_286(bus, nbase)?
        };
        trace!(?image, "incoming task image");

        let entry = self.state.gdtr.base + u64::from(selector.index()) * 8 + 4;
        let dword2 = bus.read_u32(entry)?;
        bus.write_u32(entry, dword2 | (u32::from(system_type::TSS_BUSY_BIT) << 8))?;

        self.commit_task(bus, selector, tss, &image)?;
        self.load_task_segments(bus, &image)?;

        if image.trap {
            self.events.debug_trap |= DebugTrap::TASK_SWITCH;
        }
        if let Some(code) = error_code {
            let size = if new_386 { 4 } else { 2 };
            self.push_value(bus, u64::from(code), size)?;
        }
        if self.state.rip > u64::from(self.state.seg(SegReg::Cs).cache.limit) {
            return Err(Fault::gp0());
        }
        Ok(())
    }

    fn save_386_task<B: CpuBus + ?Sized>(&self, bus: &mut B, base: u64) -> Result<(), Fault> {
        bus.write_u32(base + 0x20, self.state.rip as u32)?;
        bus.write_u32(base + 0x24, self.state.rflags as u32)?;
        for (n, &reg) in self.state.gpr[..8].iter().enumerate() {
            bus.write_u32(base + 0x28 + 4 * n as u64, reg as u32)?;
        }
        for (n, seg) in TSS_SEGMENTS.into_iter().enumerate() {
            bus.write_u16(base + 0x48 + 4 * n as u64, self.state.seg(seg).selector)?;
        }
        Ok(())
    }

    fn save_286_task<B: CpuBus + ?Sized>(&self, bus: &mut B, base: u64) -> Result<(), Fault> {
        bus.write_u16(base + 14, self.state.rip as u16)?;
        bus.write_u16(base + 16, self.state.rflags as u16)?;
        for (n, &reg) in self.state.gpr[..8].iter().enumerate() {
            bus.write_u16(base + 18 + 2 * n as u64, reg as u16)?;
        }
        for (n, seg) in TSS_SEGMENTS[..4].iter().enumerate() {
            bus.write_u16(base + 34 + 2 * n as u64, self.state.seg(*seg).selector)?;
        }
        Ok(())
    }

    /// Point of no return: replaces TR, CR3 and the register file. Segment caches are left
    /// invalid until [`Self::load_task_segments`] fills them.
    fn commit_task<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
        tss: Descriptor,
        image: &TaskImage,
    ) -> Result<(), Fault> {
        self.state.tr = SegmentRegister {
            selector: selector.0,
            cache: Descriptor {
                typ: tss.typ | system_type::TSS_BUSY_BIT,
                ..tss
            },
        };
        self.state.control.cr0 |= Cr0::TS;
        self.state.debug.dr7 = Dr7(self.state.debug.dr7.0 & !Dr7::LOCAL_ENABLES);

        if let Some(cr3) = image.cr3 {
            if u64::from(cr3) != self.state.control.cr3 {
                self.set_cr3(bus, u64::from(cr3))?;
            }
        }

        self.state.prev_rip = u64::from(image.eip);
        self.state.rip = u64::from(image.eip);
        for (reg, &value) in self.state.gpr[..8].iter_mut().zip(&image.gpr) {
            *reg = u64::from(value);
        }
        // A fault from here on restores the incoming task's stack, not the outgoing one.
        self.begin_speculative_rsp();
        self.state.rflags =
            u64::from((image.eflags | RFLAGS_NT as u32) & TASK_EFLAGS_MASK) | RFLAGS_RESERVED1;

        for (seg, &sel) in TSS_SEGMENTS.iter().zip(&image.sregs) {
            *self.state.seg_mut(*seg) = SegmentRegister {
                selector: sel,
                cache: Descriptor::default(),
            };
        }
        self.state.ldtr = SegmentRegister {
            selector: image.ldt,
            cache: Descriptor::default(),
        };
        Ok(())
    }

    fn load_task_segments<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        image: &TaskImage,
    ) -> Result<(), Fault> {
        let ldt = Selector(image.ldt);
        if ldt.ti() {
            return Err(Fault::ts(ldt.error_code()));
        }
        if !ldt.is_null() {
            let Some(raw) = read_descriptor(bus, &self.state, ldt)? else {
                return Err(Fault::ts(ldt.error_code()));
            };
            let cache = Descriptor::parse(raw);
            if !cache.valid || cache.segment || cache.typ != system_type::LDT || !cache.present {
                return Err(Fault::ts(ldt.error_code()));
            }
            self.state.ldtr.cache = cache;
        }

        if self.state.rflags & RFLAGS_VM != 0 {
            for (seg, &sel) in TSS_SEGMENTS.iter().zip(&image.sregs) {
                self.state.load_real_mode_segment(*seg, sel);
            }
            return Ok(());
        }

        let cs = Selector(image.sregs[SegReg::Cs as usize]);
        self.load_task_stack_segment(bus, Selector(image.sregs[SegReg::Ss as usize]), cs.rpl())?;
        for seg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
            self.load_task_data_segment(bus, seg, Selector(image.sregs[seg as usize]), cs.rpl())?;
        }
        self.load_task_code_segment(bus, cs)
    }

    fn fetch_for_task<B: CpuBus + ?Sized>(
        &self,
        bus: &mut B,
        selector: Selector,
    ) -> Result<Descriptor, Fault> {
        match read_descriptor(bus, &self.state, selector)? {
            Some(raw) => Ok(Descriptor::parse(raw)),
            None => Err(Fault::ts(selector.error_code())),
        }
    }

    fn load_task_stack_segment<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
        cs_rpl: u8,
    ) -> Result<(), Fault> {
        if selector.is_null() {
            return Err(Fault::ts(selector.error_code()));
        }
        let cache = self.fetch_for_task(bus, selector)?;
        if !cache.valid || !cache.is_writable_data() {
            return Err(Fault::ts(selector.error_code()));
        }
        if !cache.present {
            return Err(Fault::ss(selector.error_code()));
        }
        if cache.dpl != cs_rpl || cache.dpl != selector.rpl() {
            return Err(Fault::ts(selector.error_code()));
        }
        *self.state.seg_mut(SegReg::Ss) = SegmentRegister {
            selector: selector.0,
            cache,
        };
        Ok(())
    }

    fn load_task_data_segment<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        selector: Selector,
        cs_rpl: u8,
    ) -> Result<(), Fault> {
        if selector.is_null() {
            self.state.load_null_selector(seg, selector.0);
            return Ok(());
        }
        let cache = self.fetch_for_task(bus, selector)?;
        if !cache.valid || !cache.segment || (cache.is_code() && !cache.is_readable_code()) {
            return Err(Fault::ts(selector.error_code()));
        }
        if (cache.is_data() || !cache.is_conforming_code())
            && (selector.rpl() > cache.dpl || cs_rpl > cache.dpl)
        {
            return Err(Fault::ts(selector.error_code()));
        }
        if !cache.present {
            return Err(Fault::np(selector.error_code()));
        }
        *self.state.seg_mut(seg) = SegmentRegister {
            selector: selector.0,
            cache,
        };
        Ok(())
    }

    fn load_task_code_segment<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        selector: Selector,
    ) -> Result<(), Fault> {
        if selector.is_null() {
            return Err(Fault::ts(selector.error_code()));
        }
        let cache = self.fetch_for_task(bus, selector)?;
        if !cache.valid || !cache.is_code() {
            return Err(Fault::ts(selector.error_code()));
        }
        let privilege_ok = if cache.is_conforming_code() {
            cache.dpl <= selector.rpl()
        } else {
            cache.dpl == selector.rpl()
        };
        if !privilege_ok {
            return Err(Fault::ts(selector.error_code()));
        }
        if !cache.present {
            return Err(Fault::np(selector.error_code()));
        }
        *self.state.seg_mut(SegReg::Cs) = SegmentRegister {
            selector: selector.0,
            cache,
        };
        Ok(())
    }
}
