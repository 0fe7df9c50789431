//! Architectural register state owned by a single vCPU.
//!
//! Everything in here is plain data. The rules for *changing* the protected bits live in
//! [`crate::control`], [`crate::debug`] and [`crate::xstate`]; the state structs themselves never
//! validate anything.

use bitflags::bitflags;

use crate::descriptors::{system_type, Descriptor};

pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_RESERVED1: u64 = 1 << 1;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_IOPL_MASK: u64 = 3 << 12;
pub const RFLAGS_NT: u64 = 1 << 14;
pub const RFLAGS_RF: u64 = 1 << 16;
pub const RFLAGS_VM: u64 = 1 << 17;
pub const RFLAGS_AC: u64 = 1 << 18;
pub const RFLAGS_VIF: u64 = 1 << 19;
pub const RFLAGS_VIP: u64 = 1 << 20;

pub const GPR_RAX: usize = 0;
pub const GPR_RCX: usize = 1;
pub const GPR_RDX: usize = 2;
pub const GPR_RBX: usize = 3;
pub const GPR_RSP: usize = 4;
pub const GPR_RBP: usize = 5;
pub const GPR_RSI: usize = 6;
pub const GPR_RDI: usize = 7;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Cr4: u32 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
        const PCE = 1 << 8;
        const OSFXSR = 1 << 9;
        const OSXMMEXCPT = 1 << 10;
        const UMIP = 1 << 11;
        const VMXE = 1 << 13;
        const SMXE = 1 << 14;
        const FSGSBASE = 1 << 16;
        const PCIDE = 1 << 17;
        const OSXSAVE = 1 << 18;
        const SMEP = 1 << 20;
        const SMAP = 1 << 21;
        const PKE = 1 << 22;
        const CET = 1 << 23;
        const PKS = 1 << 24;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Efer: u32 {
        const SCE = 1 << 0;
        const LME = 1 << 8;
        const LMA = 1 << 10;
        const NXE = 1 << 11;
        const SVME = 1 << 12;
        const FFXSR = 1 << 14;
        const TCE = 1 << 15;
    }
}

bitflags! {
    /// XSAVE feature components, shared by XCR0 (user) and IA32_XSS (supervisor).
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct XFeatures: u32 {
        const X87 = 1 << 0;
        const SSE = 1 << 1;
        const YMM = 1 << 2;
        const OPMASK = 1 << 5;
        const ZMM_HI256 = 1 << 6;
        const HI16_ZMM = 1 << 7;
        const PKRU = 1 << 9;
        const CET_U = 1 << 11;
        const CET_S = 1 << 12;

        const AVX512 = Self::OPMASK.bits() | Self::ZMM_HI256.bits() | Self::HI16_ZMM.bits();
    }
}

/// Enables shadow stacks in `IA32_U_CET` / `IA32_S_CET`.
pub const CET_SH_STK_EN: u64 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegs {
    pub cr0: Cr0,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: Cr4,
    pub efer: Efer,
    pub xcr0: XFeatures,
    pub xss: XFeatures,
}

impl ControlRegs {
    pub const CR0_RESET: Cr0 = Cr0::from_bits_retain(0x6000_0010);

    fn at_reset() -> Self {
        Self {
            cr0: Self::CR0_RESET,
            cr2: 0,
            cr3: 0,
            cr4: Cr4::empty(),
            efer: Efer::empty(),
            xcr0: XFeatures::X87,
            xss: XFeatures::empty(),
        }
    }
}

/// DR7 viewed as its per-breakpoint fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dr7(pub u32);

impl Dr7 {
    pub const GD: u32 = 1 << 13;
    /// L0-L3 and LE; cleared by a hardware task switch.
    pub const LOCAL_ENABLES: u32 = 0x155;

    /// L or G enable for breakpoint `n`.
    pub fn enabled(self, n: usize) -> bool {
        (self.0 >> (n * 2)) & 3 != 0
    }

    pub fn any_enabled(self) -> bool {
        self.0 & 0xff != 0
    }

    /// R/W field: 0 execute, 1 write, 2 I/O, 3 read/write.
    pub fn rw(self, n: usize) -> u8 {
        ((self.0 >> (16 + n * 4)) & 3) as u8
    }

    pub fn len_code(self, n: usize) -> u8 {
        ((self.0 >> (18 + n * 4)) & 3) as u8
    }

    pub fn general_detect(self) -> bool {
        self.0 & Self::GD != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRegs {
    pub dr: [u64; 4],
    pub dr6: u32,
    pub dr7: Dr7,
}

impl DebugRegs {
    pub const DR6_RESET: u32 = 0xffff_0ff0;
    pub const DR7_RESET: u32 = 0x0000_0400;
}

impl Default for DebugRegs {
    fn default() -> Self {
        Self {
            dr: [0; 4],
            dr6: Self::DR6_RESET,
            dr7: Dr7(Self::DR7_RESET),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRegister {
    pub selector: u16,
    pub cache: Descriptor,
}

impl SegmentRegister {
    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// CET shadow-stack registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CetState {
    pub ssp: u64,
    /// `IA32_PL0_SSP` .. `IA32_PL3_SSP`.
    pub pl_ssp: [u64; 4],
    pub interrupt_ssp_table: u64,
    pub u_cet: u64,
    pub s_cet: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    V8086,
    Protected,
    Compatibility,
    Long64,
}

impl CpuMode {
    pub fn is_long(self) -> bool {
        matches!(self, CpuMode::Compatibility | CpuMode::Long64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub gpr: [u64; 16],
    pub rip: u64,
    /// RIP of the instruction currently executing; faults roll back to it.
    pub prev_rip: u64,
    pub rflags: u64,
    pub sregs: [SegmentRegister; 6],
    pub ldtr: SegmentRegister,
    pub tr: SegmentRegister,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub control: ControlRegs,
    pub debug: DebugRegs,
    pub cet: CetState,
    pub pdptrs: [u64; 4],
    pub in_smm: bool,
    /// VMXON has been executed (root or non-root operation).
    pub in_vmx: bool,
}

impl CpuState {
    /// Architectural power-on state: real mode, executing at `F000:FFF0`.
    pub fn at_reset() -> Self {
        let data = Descriptor::real_mode(0);
        let mut cs = Descriptor::real_mode(0xf000);
        cs.base = 0xffff_0000;
        cs.typ = 0xb;

        let mut sregs = [SegmentRegister {
            selector: 0,
            cache: data,
        }; 6];
        sregs[SegReg::Cs as usize] = SegmentRegister {
            selector: 0xf000,
            cache: cs,
        };

        let system = |typ| SegmentRegister {
            selector: 0,
            cache: Descriptor {
                limit: 0xffff,
                typ,
                present: true,
                valid: true,
                ..Descriptor::default()
            },
        };

        Self {
            gpr: [0; 16],
            rip: 0xfff0,
            prev_rip: 0xfff0,
            rflags: RFLAGS_RESERVED1,
            sregs,
            ldtr: system(system_type::LDT),
            tr: system(system_type::BUSY_386_TSS),
            gdtr: DescriptorTable {
                base: 0,
                limit: 0xffff,
            },
            idtr: DescriptorTable {
                base: 0,
                limit: 0x3ff,
            },
            control: ControlRegs::at_reset(),
            debug: DebugRegs::default(),
            cet: CetState::default(),
            pdptrs: [0; 4],
            in_smm: false,
            in_vmx: false,
        }
    }

    pub fn seg(&self, seg: SegReg) -> &SegmentRegister {
        &self.sregs[seg as usize]
    }

    pub fn seg_mut(&mut self, seg: SegReg) -> &mut SegmentRegister {
        &mut self.sregs[seg as usize]
    }

    pub fn mode(&self) -> CpuMode {
        if self.control.efer.contains(Efer::LMA) {
            if self.seg(SegReg::Cs).cache.long {
                CpuMode::Long64
            } else {
                CpuMode::Compatibility
            }
        } else if !self.control.cr0.contains(Cr0::PE) {
            CpuMode::Real
        } else if self.rflags & RFLAGS_VM != 0 {
            CpuMode::V8086
        } else {
            CpuMode::Protected
        }
    }

    pub fn long_mode(&self) -> bool {
        self.control.efer.contains(Efer::LMA)
    }

    pub fn long64_mode(&self) -> bool {
        self.mode() == CpuMode::Long64
    }

    pub fn real_mode(&self) -> bool {
        self.mode() == CpuMode::Real
    }

    pub fn v8086_mode(&self) -> bool {
        self.mode() == CpuMode::V8086
    }

    /// Protected, compatibility or 64-bit mode (not real, not virtual-8086).
    pub fn protected_mode(&self) -> bool {
        matches!(
            self.mode(),
            CpuMode::Protected | CpuMode::Compatibility | CpuMode::Long64
        )
    }

    pub fn cpl(&self) -> u8 {
        match self.mode() {
            CpuMode::Real => 0,
            CpuMode::V8086 => 3,
            _ => self.seg(SegReg::Cs).rpl(),
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.rflags & RFLAGS_IOPL_MASK) >> 12) as u8
    }

    pub fn flag(&self, mask: u64) -> bool {
        self.rflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u64, value: bool) {
        if value {
            self.rflags |= mask;
        } else {
            self.rflags &= !mask;
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.flag(RFLAGS_IF)
    }

    pub fn rsp(&self) -> u64 {
        self.gpr[GPR_RSP]
    }

    pub fn set_rsp(&mut self, rsp: u64) {
        self.gpr[GPR_RSP] = rsp;
    }

    /// Linear address of the instruction pointer.
    pub fn linear_rip(&self) -> u64 {
        if self.long64_mode() {
            self.rip
        } else {
            self.seg(SegReg::Cs).cache.base.wrapping_add(self.rip) & 0xffff_ffff
        }
    }

    /// Loads a segment register the way real mode (and virtual-8086 mode) does: base is
    /// `selector << 4`, 64 KiB limit.
    pub fn load_real_mode_segment(&mut self, seg: SegReg, selector: u16) {
        let dpl = if self.v8086_mode() { 3 } else { 0 };
        let mut cache = Descriptor::real_mode(selector);
        cache.dpl = dpl;
        if seg == SegReg::Cs {
            cache.typ = 0xb;
        }
        *self.seg_mut(seg) = SegmentRegister { selector, cache };
    }

    /// Marks a data segment register as holding the null selector.
    pub fn load_null_selector(&mut self, seg: SegReg, selector: u16) {
        *self.seg_mut(seg) = SegmentRegister {
            selector,
            cache: Descriptor::default(),
        };
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::at_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_state_is_real_mode_at_reset_vector() {
        let state = CpuState::at_reset();
        assert_eq!(state.mode(), CpuMode::Real);
        assert_eq!(state.cpl(), 0);
        assert_eq!(state.linear_rip(), 0xffff_fff0);
        assert_eq!(state.control.cr0.bits(), 0x6000_0010);
        assert_eq!(state.debug.dr7.0, 0x400);
    }

    #[test]
    fn mode_tracks_pe_vm_lma_and_cs_l() {
        let mut state = CpuState::at_reset();
        state.control.cr0 |= Cr0::PE;
        assert_eq!(state.mode(), CpuMode::Protected);

        state.rflags |= RFLAGS_VM;
        assert_eq!(state.mode(), CpuMode::V8086);
        assert_eq!(state.cpl(), 3);

        state.rflags &= !RFLAGS_VM;
        state.control.efer |= Efer::LMA;
        assert_eq!(state.mode(), CpuMode::Compatibility);

        state.seg_mut(SegReg::Cs).cache.long = true;
        assert_eq!(state.mode(), CpuMode::Long64);
        assert!(state.protected_mode());
    }

    #[test]
    fn dr7_fields() {
        // L1 enabled, R/W1 = write, LEN1 = 4 bytes.
        let dr7 = Dr7((1 << 2) | (0b01 << 20) | (0b11 << 22));
        assert!(dr7.enabled(1));
        assert!(!dr7.enabled(0));
        assert_eq!(dr7.rw(1), 1);
        assert_eq!(dr7.len_code(1), 3);
    }
}
