//! Segment, system and gate descriptors as they appear in the GDT, LDT and IDT.

use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::state::CpuState;

pub mod system_type {
    pub const AVAIL_286_TSS: u8 = 0x1;
    pub const LDT: u8 = 0x2;
    pub const BUSY_286_TSS: u8 = 0x3;
    pub const CALL_GATE_286: u8 = 0x4;
    pub const TASK_GATE: u8 = 0x5;
    pub const INTERRUPT_GATE_286: u8 = 0x6;
    pub const TRAP_GATE_286: u8 = 0x7;
    pub const AVAIL_386_TSS: u8 = 0x9;
    pub const BUSY_386_TSS: u8 = 0xb;
    pub const CALL_GATE_386: u8 = 0xc;
    pub const INTERRUPT_GATE_386: u8 = 0xe;
    pub const TRAP_GATE_386: u8 = 0xf;

    /// Bit that distinguishes a busy TSS from an available one.
    pub const TSS_BUSY_BIT: u8 = 0x2;

    pub fn is_valid(typ: u8) -> bool {
        !matches!(typ, 0x0 | 0x8 | 0xa | 0xd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Selector(pub u16);

impl Selector {
    pub fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Table indicator: set for the LDT.
    pub fn ti(self) -> bool {
        self.0 & 4 != 0
    }

    pub fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }

    pub fn is_null(self) -> bool {
        self.0 & 0xfffc == 0
    }

    /// Selector error code: index and TI, RPL dropped.
    pub fn error_code(self) -> u16 {
        self.0 & 0xfffc
    }
}

/// Decoded segment or system descriptor (the hidden part of a segment register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub base: u64,
    /// Limit in bytes, granularity already applied.
    pub limit: u32,
    pub typ: u8,
    /// S bit: code/data rather than system.
    pub segment: bool,
    pub dpl: u8,
    pub present: bool,
    pub avl: bool,
    pub long: bool,
    pub default_big: bool,
    pub granularity: bool,
    pub valid: bool,
}

impl Descriptor {
    pub fn parse(raw: u64) -> Self {
        let raw_limit = ((raw & 0xffff) | ((raw >> 32) & 0xf_0000)) as u32;
        let base = ((raw >> 16) & 0xff_ffff) | (((raw >> 56) & 0xff) << 24);
        let typ = ((raw >> 40) & 0xf) as u8;
        let segment = raw & (1 << 44) != 0;
        let granularity = raw & (1 << 55) != 0;

        Self {
            base,
            limit: if granularity {
                (raw_limit << 12) | 0xfff
            } else {
                raw_limit
            },
            typ,
            segment,
            dpl: ((raw >> 45) & 3) as u8,
            present: raw & (1 << 47) != 0,
            avl: raw & (1 << 52) != 0,
            long: raw & (1 << 53) != 0,
            default_big: raw & (1 << 54) != 0,
            granularity,
            valid: segment || system_type::is_valid(typ),
        }
    }

    /// Read/write, accessed data segment with a 64 KiB limit based at `selector << 4`.
    pub fn real_mode(selector: u16) -> Self {
        Self {
            base: u64::from(selector) << 4,
            limit: 0xffff,
            typ: 0x3,
            segment: true,
            dpl: 0,
            present: true,
            valid: true,
            ..Self::default()
        }
    }

    pub fn is_code(&self) -> bool {
        self.segment && self.typ & 0x8 != 0
    }

    pub fn is_data(&self) -> bool {
        self.segment && self.typ & 0x8 == 0
    }

    pub fn is_conforming_code(&self) -> bool {
        self.is_code() && self.typ & 0x4 != 0
    }

    pub fn is_readable_code(&self) -> bool {
        self.is_code() && self.typ & 0x2 != 0
    }

    pub fn is_writable_data(&self) -> bool {
        self.is_data() && self.typ & 0x2 != 0
    }

    pub fn is_expand_down(&self) -> bool {
        self.is_data() && self.typ & 0x4 != 0
    }

    pub fn is_tss(&self) -> bool {
        !self.segment
            && matches!(
                self.typ,
                system_type::AVAIL_286_TSS
                    | system_type::BUSY_286_TSS
                    | system_type::AVAIL_386_TSS
                    | system_type::BUSY_386_TSS
            )
    }

    pub fn is_386_tss(&self) -> bool {
        !self.segment
            && matches!(
                self.typ,
                system_type::AVAIL_386_TSS | system_type::BUSY_386_TSS
            )
    }

    /// Whether `len` bytes at `offset` fit inside the segment limit, honouring expand-down data
    /// segments.
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        let last = offset.wrapping_add(len - 1);
        if self.is_expand_down() {
            let upper = if self.default_big { u32::MAX } else { 0xffff };
            offset > self.limit && last >= offset && last <= upper
        } else {
            last >= offset && last <= self.limit
        }
    }
}

/// IDT gate descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    pub offset: u64,
    pub selector: Selector,
    pub typ: u8,
    pub dpl: u8,
    pub present: bool,
    pub segment: bool,
    /// Interrupt stack table index (64-bit gates only).
    pub ist: u8,
}

impl Gate {
    pub fn parse(raw: u64) -> Self {
        let typ = ((raw >> 40) & 0xf) as u8;
        let mut offset = (raw & 0xffff) | ((raw >> 32) & 0xffff_0000);
        if matches!(
            typ,
            system_type::INTERRUPT_GATE_286 | system_type::TRAP_GATE_286
        ) {
            offset &= 0xffff;
        }
        Self {
            offset,
            selector: Selector((raw >> 16) as u16),
            typ,
            dpl: ((raw >> 45) & 3) as u8,
            present: raw & (1 << 47) != 0,
            segment: raw & (1 << 44) != 0,
            ist: ((raw >> 32) & 0x7) as u8,
        }
    }

    /// 16-byte long-mode gate.
    pub fn parse_long(lo: u64, hi: u64) -> Self {
        let mut gate = Self::parse(lo);
        gate.offset = (lo & 0xffff) | ((lo >> 32) & 0xffff_0000) | ((hi & 0xffff_ffff) << 32);
        gate
    }

    pub fn is_valid(&self) -> bool {
        system_type::is_valid(self.typ)
    }

    /// Interrupt gates clear IF; trap gates leave it alone.
    pub fn is_interrupt_gate(&self) -> bool {
        self.typ & 1 == 0
    }

    pub fn is_386(&self) -> bool {
        self.typ & 0x8 != 0
    }
}

/// Builders for raw descriptor-table entries, the inverse of [`Descriptor::parse`] and
/// [`Gate::parse`]. Every entry they produce is present.
pub mod encode {
    /// Flag nibble bits (descriptor bits 52-55).
    pub const AVL: u8 = 0x1;
    pub const LONG: u8 = 0x2;
    pub const BIG: u8 = 0x4;
    pub const GRANULARITY: u8 = 0x8;

    fn raw(base: u32, limit: u32, typ: u8, s: bool, dpl: u8, flags: u8) -> u64 {
        u64::from(limit & 0xffff)
            | (u64::from(base & 0xff_ffff) << 16)
            | (u64::from(typ & 0xf) << 40)
            | (u64::from(s) << 44)
            | (u64::from(dpl & 3) << 45)
            | (1 << 47)
            | (u64::from((limit >> 16) & 0xf) << 48)
            | (u64::from(flags & 0xf) << 52)
            | (u64::from(base >> 24) << 56)
    }

    /// Code or data segment. `limit` is the raw 20-bit field.
    pub fn segment(base: u32, limit: u32, typ: u8, dpl: u8, flags: u8) -> u64 {
        raw(base, limit, typ, true, dpl, flags)
    }

    /// TSS or LDT descriptor.
    pub fn system(base: u32, limit: u32, typ: u8) -> u64 {
        raw(base, limit, typ, false, 0, 0)
    }

    /// Legacy 8-byte gate.
    pub fn gate(offset: u32, selector: u16, typ: u8, dpl: u8) -> u64 {
        u64::from(offset & 0xffff)
            | (u64::from(selector) << 16)
            | (u64::from(typ & 0xf) << 40)
            | (u64::from(dpl & 3) << 45)
            | (1 << 47)
            | (u64::from(offset >> 16) << 48)
    }

    /// 16-byte long-mode gate, as its low and high quadwords.
    pub fn gate64(offset: u64, selector: u16, typ: u8, dpl: u8, ist: u8) -> (u64, u64) {
        let lo = gate(offset as u32, selector, typ, dpl) | (u64::from(ist & 7) << 32);
        (lo, offset >> 32)
    }
}

/// Reads the raw 8-byte descriptor `selector` refers to.
///
/// Returns `Ok(None)` when the selector points outside its table (or into an unusable LDT); the
/// caller picks the exception that implies.
pub fn read_descriptor<B: CpuBus + ?Sized>(
    bus: &mut B,
    state: &CpuState,
    selector: Selector,
) -> Result<Option<u64>, Fault> {
    let (base, limit) = if selector.ti() {
        if !state.ldtr.cache.valid || Selector(state.ldtr.selector).is_null() {
            return Ok(None);
        }
        (state.ldtr.cache.base, state.ldtr.cache.limit)
    } else {
        (state.gdtr.base, u32::from(state.gdtr.limit))
    };

    let offset = u32::from(selector.index()) * 8;
    if offset + 7 > limit {
        return Ok(None);
    }
    bus.read_u64(base.wrapping_add(u64::from(offset))).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_code_segment() {
        let desc = Descriptor::parse(0x00cf_9a00_0000_ffff);
        assert_eq!(desc.base, 0);
        assert_eq!(desc.limit, 0xffff_ffff);
        assert!(desc.is_code());
        assert!(!desc.is_conforming_code());
        assert!(desc.default_big);
        assert!(desc.present);
        assert_eq!(desc.dpl, 0);
    }

    #[test]
    fn parses_long_mode_code_and_tss() {
        let code = Descriptor::parse(0x00af_9b00_0000_ffff);
        assert!(code.long);
        assert!(!code.default_big);

        let tss = Descriptor::parse(0x0000_8900_1000_0067);
        assert!(tss.is_386_tss());
        assert_eq!(tss.base, 0x1000);
        assert_eq!(tss.limit, 0x67);
    }

    #[test]
    fn expand_down_limit_check() {
        let mut desc = Descriptor::parse(0x0040_9600_0000_0fff);
        assert!(desc.is_expand_down());
        assert!(!desc.contains(0x0ffe, 2));
        assert!(desc.contains(0x1000, 4));
        desc.default_big = false;
        assert!(!desc.contains(0xffff, 2));
    }

    #[test]
    fn gate_offsets() {
        let gate = Gate::parse(0x1234_8e00_0008_5678);
        assert_eq!(gate.offset, 0x1234_5678);
        assert_eq!(gate.selector, Selector(0x08));
        assert!(gate.is_interrupt_gate());
        assert!(gate.present);

        let gate = Gate::parse_long(0x1234_8f01_0010_5678, 0xffff_8000);
        assert_eq!(gate.offset, 0xffff_8000_1234_5678);
        assert_eq!(gate.ist, 1);
        assert!(!gate.is_interrupt_gate());
    }

    #[test]
    fn encoders_match_parsers() {
        assert_eq!(
            encode::segment(0, 0xfffff, 0xa, 0, encode::BIG | encode::GRANULARITY),
            0x00cf_9a00_0000_ffff
        );
        assert_eq!(encode::system(0x1000, 0x67, 0x9), 0x0000_8900_1000_0067);
        assert_eq!(encode::gate(0x1234_5678, 0x08, 0xe, 0), 0x1234_8e00_0008_5678);

        let (lo, hi) = encode::gate64(0xffff_8000_1234_5678, 0x10, 0xf, 0, 1);
        assert_eq!(Gate::parse_long(lo, hi).offset, 0xffff_8000_1234_5678);
        assert_eq!(Gate::parse_long(lo, hi).ist, 1);
    }
}
