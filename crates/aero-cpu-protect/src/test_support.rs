//! Descriptor-table fixtures shared by the unit tests.

use crate::config::CpuConfig;
use crate::cpu::CpuCore;
use crate::descriptors::{encode, read_descriptor, system_type, Descriptor, Selector};
use crate::mem::{CpuBus, FlatTestBus};
use crate::state::{
    Cr0, Cr4, DescriptorTable, Efer, SegReg, SegmentRegister, RFLAGS_IF, RFLAGS_RESERVED1,
};

pub const GDT: u64 = 0x1000;
pub const IDT: u64 = 0x2000;
pub const TSS: u64 = 0x3000;
pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1b;
pub const USER_DS: u16 = 0x23;
pub const TSS_SELECTOR: u16 = 0x28;
pub const KERNEL_STACK: u64 = 0x8000;

pub fn load_segment(core: &mut CpuCore, bus: &mut FlatTestBus, seg: SegReg, selector: u16) {
    let raw = read_descriptor(bus, &core.state, Selector(selector))
        .unwrap()
        .unwrap();
    *core.state.seg_mut(seg) = SegmentRegister {
        selector,
        cache: Descriptor::parse(raw),
    };
}

pub fn write_gdt(core: &mut CpuCore, bus: &mut FlatTestBus, entries: &[u64]) {
    for (n, &entry) in entries.iter().enumerate() {
        bus.write_u64(GDT + n as u64 * 8, entry).unwrap();
    }
    core.state.gdtr = DescriptorTable {
        base: GDT,
        limit: (entries.len() * 8 - 1) as u16,
    };
}

/// 32-bit protected mode, running user code at 0x1b:0x4000 with ESP 0x6000.
pub fn protected_mode() -> (CpuCore, FlatTestBus) {
    let mut core = CpuCore::new(CpuConfig::x86_64()).unwrap();
    let mut bus = FlatTestBus::new(0x20000);
    let flat = encode::BIG | encode::GRANULARITY;
    write_gdt(
        &mut core,
        &mut bus,
        &[
            0,
            encode::segment(0, 0xfffff, 0xa, 0, flat),
            encode::segment(0, 0xfffff, 0x2, 0, flat),
            encode::segment(0, 0xfffff, 0xa, 3, flat),
            encode::segment(0, 0xfffff, 0x2, 3, flat),
            encode::system(TSS as u32, 0xff, system_type::BUSY_386_TSS),
        ],
    );
    core.state.idtr = DescriptorTable {
        base: IDT,
        limit: 0x7ff,
    };
    core.state.control.cr0 = Cr0::PE | Cr0::ET;
    bus.write_u32(TSS + 4, KERNEL_STACK as u32).unwrap();
    bus.write_u16(TSS + 8, KERNEL_DS).unwrap();
    load_segment(&mut core, &mut bus, SegReg::Cs, USER_CS);
    for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
        load_segment(&mut core, &mut bus, seg, USER_DS);
    }
    core.state.tr = SegmentRegister {
        selector: TSS_SELECTOR,
        cache: Descriptor::parse(encode::system(TSS as u32, 0xff, system_type::BUSY_386_TSS)),
    };
    core.state.set_rsp(0x6000);
    core.state.prev_rip = 0x4000;
    core.state.rip = 0x4000;
    core.state.rflags = RFLAGS_RESERVED1 | RFLAGS_IF;
    (core, bus)
}

pub fn set_gate(bus: &mut FlatTestBus, vector: u8, offset: u32, typ: u8, dpl: u8) {
    let raw = encode::gate(offset, KERNEL_CS, typ, dpl);
    bus.write_u64(IDT + u64::from(vector) * 8, raw).unwrap();
}

pub fn stack_u32(bus: &mut FlatTestBus, top: u64, slot: u64) -> u32 {
    bus.read_u32(top - 4 * slot).unwrap()
}

pub fn long_mode() -> (CpuCore, FlatTestBus) {
    let mut core = CpuCore::new(CpuConfig::x86_64()).unwrap();
    let mut bus = FlatTestBus::new(0x20000);
    write_gdt(
        &mut core,
        &mut bus,
        &[
            0,
            encode::segment(0, 0, 0xa, 0, encode::LONG),
            encode::segment(0, 0xfffff, 0x2, 0, encode::GRANULARITY),
            encode::segment(0, 0, 0xa, 3, encode::LONG),
            encode::segment(0, 0xfffff, 0x2, 3, encode::GRANULARITY),
            encode::system(TSS as u32, 0x67, system_type::BUSY_386_TSS),
            0,
        ],
    );
    core.state.idtr = DescriptorTable {
        base: IDT,
        limit: 0xfff,
    };
    core.state.control.cr0 = Cr0::PE | Cr0::ET | Cr0::PG;
    core.state.control.cr4 = Cr4::PAE;
    core.state.control.efer = Efer::LME | Efer::LMA;
    core.state.tr = SegmentRegister {
        selector: TSS_SELECTOR,
        cache: Descriptor::parse(encode::system(TSS as u32, 0x67, system_type::BUSY_386_TSS)),
    };
    bus.write_u64(TSS + 4, 0x9000).unwrap();
    // IST1.
    bus.write_u64(TSS + 0x24, 0xa008).unwrap();
    load_segment(&mut core, &mut bus, SegReg::Cs, USER_CS);
    load_segment(&mut core, &mut bus, SegReg::Ss, USER_DS);
    core.state.set_rsp(0x7ff8);
    core.state.rip = 0x4000;
    core.state.prev_rip = 0x4000;
    core.state.rflags = RFLAGS_RESERVED1 | RFLAGS_IF;
    (core, bus)
}

pub fn set_gate64(bus: &mut FlatTestBus, vector: u8, offset: u64, ist: u8) {
    let (lo, hi) = encode::gate64(offset, KERNEL_CS, system_type::INTERRUPT_GATE_386, 0, ist);
    let entry = IDT + u64::from(vector) * 16;
    bus.write_u64(entry, lo).unwrap();
    bus.write_u64(entry + 8, hi).unwrap();
}
