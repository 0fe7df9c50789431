//! Control registers: CR0, CR2, CR3, CR4, CR8 and EFER.
//!
//! The `set_*` methods are the validators. They accept or reject a value on architectural
//! grounds only, perform the side effects of an accepted write (TLB invalidation, EFER.LMA,
//! PDPTE cache) and report them in [`WriteEffects`]. The instruction entry points
//! ([`CpuCore::mov_to_cr`], [`CpuCore::mov_from_cr`], [`CpuCore::clts`], [`CpuCore::lmsw`])
//! layer privilege checks and intercepts on top.

use tracing::debug;

use crate::apic::InterruptController;
use crate::config::CpuLevel;
use crate::cpu::CpuCore;
use crate::descriptors::system_type;
use crate::events::Events;
use crate::exceptions::Fault;
use crate::intercept::{InterceptEvent, InterceptPolicy};
use crate::mem::{CpuBus, TlbFlush};
use crate::state::{Cr0, Cr4, Efer, SegReg};

const CR0_FLUSH_BITS: Cr0 = Cr0::from_bits_retain(0x8001_0001);
const CR0_EXEC_MODE_BITS: Cr0 = Cr0::from_bits_retain(0x0004_000e);
const CR4_FLUSH_BITS: Cr4 = Cr4::from_bits_retain(0x0012_00b0);
const CR4_EXEC_MODE_BITS: Cr4 = Cr4::from_bits_retain(0x0004_0600);

const PDPTE_RESERVED: u64 = 0x1e6;
const PCID_NO_FLUSH: u64 = 1 << 63;

/// Virtual-APIC page offset of the TPR.
const VAPIC_TPR: u64 = 0x80;

/// Side effects of an accepted register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteEffects {
    /// Invalidation already performed on the bus.
    pub tlb_flush: Option<TlbFlush>,
    /// The operating mode (real, protected, long...) changed.
    pub mode_changed: bool,
    /// Bits that gate SSE/AVX availability or alignment checking changed.
    pub exec_mode_changed: bool,
}

fn normalize_cr0(level: CpuLevel, value: u32) -> u32 {
    match level {
        CpuLevel::I386 => value | 0x7fff_fff0,
        CpuLevel::I486 | CpuLevel::P6 => (value | 0x10) & 0xe005_003f,
        CpuLevel::Pentium => value | 0x10,
    }
}

impl CpuCore {
    pub fn check_cr0(&self, value: u64) -> bool {
        if value >> 32 != 0 {
            return false;
        }
        let cr0 = Cr0::from_bits_retain(value as u32);
        let svm_guest = matches!(self.intercept, InterceptPolicy::Svm(_));
        if cr0.contains(Cr0::PG) && !cr0.contains(Cr0::PE) && !svm_guest {
            return false;
        }
        if self.config.level >= CpuLevel::I486 && cr0.contains(Cr0::NW) && !cr0.contains(Cr0::CD) {
            return false;
        }
        if self.state.in_vmx {
            if !cr0.contains(Cr0::NE) {
                return false;
            }
            let vmx_root = self.intercept.vmx().is_none();
            if vmx_root && !cr0.contains(Cr0::PE | Cr0::PG) {
                return false;
            }
        }
        true
    }

    pub fn set_cr0<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        value: u64,
    ) -> Result<WriteEffects, Fault> {
        if !self.check_cr0(value) {
            debug!(value, "CR0 write rejected");
            return Err(Fault::gp0());
        }
        let requested = Cr0::from_bits_retain(value as u32);
        let control = self.state.control;
        let old = control.cr0;

        if !requested.contains(Cr0::WP) && control.cr4.contains(Cr4::CET) {
            debug!("CR0.WP cannot be cleared while CR4.CET is set");
            return Err(Fault::gp0());
        }

        let mut efer = control.efer;
        let enabling_paging = requested.contains(Cr0::PG) && !old.contains(Cr0::PG);
        let disabling_paging = !requested.contains(Cr0::PG) && old.contains(Cr0::PG);
        if enabling_paging && efer.contains(Efer::LME) {
            if !control.cr4.contains(Cr4::PAE) {
                debug!("long mode activation without CR4.PAE");
                return Err(Fault::gp0());
            }
            if self.state.seg(SegReg::Cs).cache.long {
                debug!("long mode activation with CS.L set");
                return Err(Fault::gp0());
            }
            if self.state.tr.cache.typ <= system_type::BUSY_286_TSS {
                debug!("long mode activation with a 16-bit TSS");
                return Err(Fault::gp0());
            }
            efer |= Efer::LMA;
        } else if disabling_paging {
            if self.state.long64_mode() {
                debug!("paging cannot be disabled in 64-bit mode");
                return Err(Fault::gp0());
            }
            if efer.contains(Efer::LMA) {
                if control.cr4.contains(Cr4::PCIDE) {
                    return Err(Fault::gp0());
                }
                efer.remove(Efer::LMA);
            }
        }

        let new = Cr0::from_bits_retain(normalize_cr0(self.config.level, requested.bits()));
        if new.contains(Cr0::PG)
            && control.cr4.contains(Cr4::PAE)
            && !efer.contains(Efer::LMA)
            && !self.check_pdptrs(bus, control.cr3)
        {
            return Err(Fault::gp0());
        }

        let mode_before = self.state.mode();
        self.state.control.cr0 = new;
        self.state.control.efer = efer;

        let tlb_flush = (old ^ new).intersects(CR0_FLUSH_BITS).then_some(TlbFlush::All);
        if let Some(scope) = tlb_flush {
            bus.flush_tlb(scope);
        }
        let mode_changed = self.state.mode() != mode_before;
        if mode_changed {
            debug!(mode = ?self.state.mode(), "operating mode changed");
        }
        Ok(WriteEffects {
            tlb_flush,
            mode_changed,
            exec_mode_changed: mode_changed || (old ^ new).intersects(CR0_EXEC_MODE_BITS),
        })
    }

    /// Validates the four PAE page-directory-pointer entries `cr3` points at and, if they
    /// are all acceptable, loads them into the PDPTE cache.
    pub fn check_pdptrs<B: CpuBus + ?Sized>(&mut self, bus: &mut B, cr3: u64) -> bool {
        let base = cr3 & 0xffff_ffe0;
        let reserved = PDPTE_RESERVED | (u64::MAX << self.config.physical_address_bits);
        let mut entries = [0u64; 4];
        for (n, entry) in entries.iter_mut().enumerate() {
            *entry = bus.read_phys_u64(base + n as u64 * 8);
            if *entry & 1 != 0 && *entry & reserved != 0 {
                debug!(index = n, entry = *entry, "PDPTE has reserved bits set");
                return false;
            }
        }
        self.state.pdptrs = entries;
        true
    }

    /// With CR4.PCIDE set, bit 63 of `value` requests that the TLB is left alone.
    pub fn set_cr3<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        value: u64,
    ) -> Result<WriteEffects, Fault> {
        let control = self.state.control;
        let mut value = value;
        let mut flush = true;
        if control.cr4.contains(Cr4::PCIDE) {
            flush = value & PCID_NO_FLUSH == 0;
            value &= !PCID_NO_FLUSH;
        }

        if self.state.long_mode() && value >> self.config.physical_address_bits != 0 {
            debug!(value, "CR3 beyond physical address width");
            return Err(Fault::gp0());
        }
        if control.cr0.contains(Cr0::PG)
            && control.cr4.contains(Cr4::PAE)
            && !self.state.long_mode()
            && !self.check_pdptrs(bus, value)
        {
            return Err(Fault::gp0());
        }

        self.state.control.cr3 = value;
        let tlb_flush = flush.then_some(if control.cr4.contains(Cr4::PGE) {
            TlbFlush::NonGlobal
        } else {
            TlbFlush::All
        });
        if let Some(scope) = tlb_flush {
            bus.flush_tlb(scope);
        }
        Ok(WriteEffects {
            tlb_flush,
            ..WriteEffects::default()
        })
    }

    pub fn check_cr4(&self, value: u64) -> bool {
        if value & !u64::from(self.masks.cr4.bits()) != 0 {
            return false;
        }
        let cr4 = Cr4::from_bits_retain(value as u32);
        if self.state.long_mode() {
            if !cr4.contains(Cr4::PAE) {
                return false;
            }
        } else if cr4.contains(Cr4::PCIDE) {
            return false;
        }
        if cr4.contains(Cr4::VMXE) {
            if self.state.in_smm {
                return false;
            }
        } else if self.state.in_vmx {
            return false;
        }
        true
    }

    pub fn set_cr4<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        value: u64,
    ) -> Result<WriteEffects, Fault> {
        if !self.check_cr4(value) {
            debug!(value, "CR4 write rejected");
            return Err(Fault::gp0());
        }
        let control = self.state.control;
        let old = control.cr4;
        let new = Cr4::from_bits_retain(value as u32);

        if new.contains(Cr4::CET) && !control.cr0.contains(Cr0::WP) {
            debug!("CR4.CET requires CR0.WP");
            return Err(Fault::gp0());
        }

        let mut tlb_flush = None;
        if (old ^ new).intersects(CR4_FLUSH_BITS) {
            if control.cr0.contains(Cr0::PG) && new.contains(Cr4::PAE) && !self.state.long_mode() {
                if !self.check_pdptrs(bus, control.cr3) {
                    return Err(Fault::gp0());
                }
            } else if new.contains(Cr4::PCIDE)
                && !old.contains(Cr4::PCIDE)
                && control.cr3 & 0xfff != 0
            {
                debug!("CR4.PCIDE enabled with a non-zero PCID");
                return Err(Fault::gp0());
            }
            tlb_flush = Some(TlbFlush::All);
        }

        self.state.control.cr4 = new;
        if let Some(scope) = tlb_flush {
            bus.flush_tlb(scope);
        }
        Ok(WriteEffects {
            tlb_flush,
            mode_changed: false,
            exec_mode_changed: (old ^ new).intersects(CR4_EXEC_MODE_BITS),
        })
    }

    /// `WRMSR IA32_EFER`. LMA is read-only: it keeps the value paging activation gave it.
    pub fn set_efer(&mut self, value: u64) -> Result<(), Fault> {
        let allowed = self.masks.efer;
        if value & !u64::from(allowed.bits()) != 0 {
            debug!(value, "EFER reserved bits");
            return Err(Fault::gp0());
        }
        let old = self.state.control.efer;
        let new = Efer::from_bits_retain(value as u32);
        if (old ^ new).contains(Efer::LME) && self.state.control.cr0.contains(Cr0::PG) {
            debug!("EFER.LME changed with paging enabled");
            return Err(Fault::gp0());
        }
        self.state.control.efer = (new & allowed & !Efer::LMA) | (old & Efer::LMA);
        Ok(())
    }

    /// `MOV CRn, reg`.
    pub fn mov_to_cr<B, A>(
        &mut self,
        bus: &mut B,
        apic: &mut A,
        cr: u8,
        value: u64,
        gpr: u8,
    ) -> Result<(), Fault>
    where
        B: CpuBus + ?Sized,
        A: InterruptController + ?Sized,
    {
        if !matches!(cr, 0 | 2 | 3 | 4 | 8) {
            return Err(Fault::ud());
        }
        if self.state.cpl() != 0 {
            return Err(Fault::gp0());
        }
        let control = self.state.control;
        match cr {
            0 => {
                let old = u64::from(control.cr0.bits());
                let normalized = if value >> 32 == 0 {
                    u64::from(normalize_cr0(self.config.level, value as u32))
                } else {
                    value
                };
                self.intercept(InterceptEvent::CrWrite {
                    cr,
                    gpr,
                    old,
                    new: normalized,
                })?;
                let value = self.intercept.guest_cr_write(0, old, value);
                self.set_cr0(bus, value)?;
            }
            2 => {
                self.intercept(InterceptEvent::CrWrite {
                    cr,
                    gpr,
                    old: control.cr2,
                    new: value,
                })?;
                self.state.control.cr2 = value;
            }
            3 => {
                self.intercept(InterceptEvent::CrWrite {
                    cr,
                    gpr,
                    old: control.cr3,
                    new: value,
                })?;
                self.set_cr3(bus, value)?;
            }
            4 => {
                let old = u64::from(control.cr4.bits());
                self.intercept(InterceptEvent::CrWrite {
                    cr,
                    gpr,
                    old,
                    new: value,
                })?;
                let value = self.intercept.guest_cr_write(4, old, value);
                self.set_cr4(bus, value)?;
            }
            _ => self.write_cr8(bus, apic, value, gpr)?,
        }
        Ok(())
    }

    /// `MOV reg, CRn`.
    pub fn mov_from_cr<B, A>(
        &mut self,
        bus: &mut B,
        apic: &mut A,
        cr: u8,
        gpr: u8,
    ) -> Result<u64, Fault>
    where
        B: CpuBus + ?Sized,
        A: InterruptController + ?Sized,
    {
        if !matches!(cr, 0 | 2 | 3 | 4 | 8) {
            return Err(Fault::ud());
        }
        if self.state.cpl() != 0 {
            return Err(Fault::gp0());
        }
        if cr == 8 {
            return self.read_cr8(bus, apic, gpr);
        }
        self.intercept(InterceptEvent::CrRead { cr, gpr })?;
        let control = self.state.control;
        Ok(match cr {
            0 => self.intercept.guest_cr_read(0, u64::from(control.cr0.bits())),
            2 => control.cr2,
            3 => control.cr3,
            _ => self.intercept.guest_cr_read(4, u64::from(control.cr4.bits())),
        })
    }

    pub fn write_cr8<B, A>(
        &mut self,
        bus: &mut B,
        apic: &mut A,
        value: u64,
        gpr: u8,
    ) -> Result<(), Fault>
    where
        B: CpuBus + ?Sized,
        A: InterruptController + ?Sized,
    {
        self.intercept(InterceptEvent::CrWrite {
            cr: 8,
            gpr,
            old: u64::from(apic.task_priority() >> 4),
            new: value,
        })?;
        if value & !0xf != 0 {
            return Err(Fault::gp0());
        }
        let tpr = ((value & 0xf) << 4) as u8;

        if let Some(svm) = self.intercept.svm_mut() {
            svm.v_tpr = (value & 0xf) as u8;
            if svm.v_intr_masking {
                return Ok(());
            }
        }
        if let Some(page) = self.vmx_tpr_shadow_page() {
            bus.write_phys_u32(page + VAPIC_TPR, u32::from(tpr));
            self.vmx_tpr_virtualization(bus);
            return Ok(());
        }
        apic.set_task_priority(tpr);
        Ok(())
    }

    pub fn read_cr8<B, A>(&mut self, bus: &mut B, apic: &mut A, gpr: u8) -> Result<u64, Fault>
    where
        B: CpuBus + ?Sized,
        A: InterruptController + ?Sized,
    {
        self.intercept(InterceptEvent::CrRead { cr: 8, gpr })?;
        if let Some(svm) = self.intercept.svm() {
            if svm.v_intr_masking {
                return Ok(u64::from(svm.v_tpr & 0xf));
            }
        }
        if let Some(page) = self.vmx_tpr_shadow_page() {
            return Ok(u64::from((bus.read_phys_u32(page + VAPIC_TPR) >> 4) & 0xf));
        }
        Ok(u64::from(apic.task_priority() >> 4))
    }

    fn vmx_tpr_shadow_page(&self) -> Option<u64> {
        self.intercept
            .vmx()
            .filter(|vmx| vmx.tpr_shadow())
            .map(|vmx| vmx.virtual_apic_page)
    }

    /// A virtual TPR below the threshold traps at the next boundary.
    fn vmx_tpr_virtualization<B: CpuBus + ?Sized>(&mut self, bus: &mut B) {
        let Some(vmx) = self.intercept.vmx() else {
            return;
        };
        let vtpr = (bus.read_phys_u32(vmx.virtual_apic_page + VAPIC_TPR) >> 4) & 0xf;
        if vtpr < u32::from(vmx.tpr_threshold & 0xf) {
            self.events.signal(Events::VMX_VTPR_UPDATE);
        }
    }

    pub fn clts(&mut self) -> Result<(), Fault> {
        if self.state.cpl() != 0 {
            return Err(Fault::gp0());
        }
        self.intercept(InterceptEvent::Clts)?;
        let host_owns_ts = self
            .intercept
            .vmx()
            .is_some_and(|vmx| vmx.cr0_guest_host_mask & u64::from(Cr0::TS.bits()) != 0);
        if !host_owns_ts {
            self.state.control.cr0.remove(Cr0::TS);
        }
        Ok(())
    }

    /// `LMSW`: loads CR0[3:0]. PE can be set but never cleared this way.
    pub fn lmsw<B: CpuBus + ?Sized>(&mut self, bus: &mut B, msw: u16) -> Result<(), Fault> {
        if self.state.cpl() != 0 {
            return Err(Fault::gp0());
        }
        let old = u64::from(self.state.control.cr0.bits());
        self.intercept(InterceptEvent::Lmsw { msw, old_cr0: old })?;

        let mut msw = u64::from(msw);
        if let Some(vmx) = self.intercept.vmx() {
            let owned = vmx.cr0_guest_host_mask & 0xf;
            msw = (old & owned) | (msw & !owned);
        }
        msw = (msw | (old & u64::from(Cr0::PE.bits()))) & 0xf;
        self.set_cr0(bus, (old & 0xffff_fff0) | msw)?;
        Ok(())
    }
}
