#![allow(dead_code)]

use aero_cpu_protect::descriptors::{encode, read_descriptor, system_type, Descriptor, Selector};
use aero_cpu_protect::state::{Cr0, DescriptorTable, SegmentRegister, RFLAGS_IF, RFLAGS_RESERVED1};
use aero_cpu_protect::{CpuBus, CpuConfig, CpuCore, FlatTestBus, SegReg};

pub const GDT: u64 = 0x1000;
pub const IDT: u64 = 0x2000;
pub const TSS: u64 = 0x3000;
pub const IO_BITMAP: u16 = 0x88;
pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1b;
pub const USER_DS: u16 = 0x23;
pub const TSS_SELECTOR: u16 = 0x28;
pub const KERNEL_STACK: u64 = 0x8000;
pub const USER_STACK: u64 = 0x6000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn load_segment(core: &mut CpuCore, bus: &mut FlatTestBus, seg: SegReg, selector: u16) {
    let raw = read_descriptor(bus, &core.state, Selector(selector))
        .expect("GDT readable")
        .expect("selector inside GDT");
    *core.state.seg_mut(seg) = SegmentRegister {
        selector,
        cache: Descriptor::parse(raw),
    };
}

/// Flat 32-bit protected mode running user code at `1b:4000`, ESP `0x6000`. The TSS holds a
/// ring-0 stack and an I/O bitmap at [`IO_BITMAP`] that denies every port until cleared.
pub fn protected_mode(config: CpuConfig) -> (CpuCore, FlatTestBus) {
    let mut core = CpuCore::new(config).expect("valid configuration");
    let mut bus = FlatTestBus::new(0x20000);
    let flat = encode::BIG | encode::GRANULARITY;
    let tss_limit = u32::from(IO_BITMAP) + 0x2000;
    let entries = [
        0,
        encode::segment(0, 0xfffff, 0xa, 0, flat),
        encode::segment(0, 0xfffff, 0x2, 0, flat),
        encode::segment(0, 0xfffff, 0xa, 3, flat),
        encode::segment(0, 0xfffff, 0x2, 3, flat),
        encode::system(TSS as u32, tss_limit, system_type::BUSY_386_TSS),
    ];
    for (n, entry) in entries.iter().enumerate() {
        bus.write_u64(GDT + n as u64 * 8, *entry).unwrap();
    }
    core.state.gdtr = DescriptorTable {
        base: GDT,
        limit: (entries.len() * 8 - 1) as u16,
    };
    core.state.idtr = DescriptorTable {
        base: IDT,
        limit: 0x7ff,
    };
    core.state.control.cr0 = Cr0::PE | Cr0::ET | Cr0::NE;

    bus.write_u32(TSS + 4, KERNEL_STACK as u32).unwrap();
    bus.write_u16(TSS + 8, KERNEL_DS).unwrap();
    bus.write_u16(TSS + 0x66, IO_BITMAP).unwrap();
    bus.load(TSS + u64::from(IO_BITMAP), &[0xff; 0x2001]);

    load_segment(&mut core, &mut bus, SegReg::Cs, USER_CS);
    for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
        load_segment(&mut core, &mut bus, seg, USER_DS);
    }
    core.state.tr = SegmentRegister {
        selector: TSS_SELECTOR,
        cache: Descriptor::parse(entries[5]),
    };
    core.state.set_rsp(USER_STACK);
    core.state.rip = 0x4000;
    core.state.prev_rip = 0x4000;
    core.state.rflags = RFLAGS_RESERVED1 | RFLAGS_IF;
    (core, bus)
}

/// Switches the fixture to ring 0.
pub fn enter_kernel(core: &mut CpuCore, bus: &mut FlatTestBus) {
    load_segment(core, bus, SegReg::Cs, KERNEL_CS);
    load_segment(core, bus, SegReg::Ss, KERNEL_DS);
    core.state.set_rsp(KERNEL_STACK);
}

pub fn set_gate(bus: &mut FlatTestBus, vector: u8, offset: u32, typ: u8, dpl: u8) {
    let raw = encode::gate(offset, KERNEL_CS, typ, dpl);
    bus.write_u64(IDT + u64::from(vector) * 8, raw).unwrap();
}

/// Interrupt gates for every vector, handler at `0x10000 + vector * 0x10`.
pub fn fill_idt(bus: &mut FlatTestBus) {
    for vector in 0..=0xffu8 {
        let offset = 0x10000 + u32::from(vector) * 0x10;
        set_gate(bus, vector, offset, system_type::INTERRUPT_GATE_386, 0);
    }
}

pub fn handler(vector: u8) -> u64 {
    0x10000 + u64::from(vector) * 0x10
}

/// The `slot`-th dword below `top`, counting from 1.
pub fn stack_u32(bus: &mut FlatTestBus, top: u64, slot: u64) -> u32 {
    bus.read_u32(top - 4 * slot).unwrap()
}
