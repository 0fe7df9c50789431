//! End-to-end protection scenarios driven through the public `aero-cpu-protect` API.

#[path = "../crates/aero-cpu-protect/tests/common/mod.rs"]
mod common;

use aero_cpu_protect::events::Inhibit;
use aero_cpu_protect::state::{Cr0, Cr4, RFLAGS_IF};
use aero_cpu_protect::{
    Boundary, CpuConfig, CpuCore, Events, FifoInterruptController, FlatTestBus, Fault,
    InterceptPolicy, InterruptSource, IoAccess, IoDirection, SvmControls, TlbFlush,
};

use common::*;

fn guest() -> (CpuCore, FlatTestBus, FifoInterruptController) {
    init_tracing();
    let (core, mut bus) = protected_mode(CpuConfig::x86_64());
    fill_idt(&mut bus);
    (core, bus, FifoInterruptController::new())
}

fn serial_port_bitmap(bus: &mut FlatTestBus, byte: u8) {
    bus.load(TSS + u64::from(IO_BITMAP) + 0x3f8 / 8, &[byte]);
}

#[test]
fn user_io_to_a_permitted_port() {
    let (mut core, mut bus, _apic) = guest();
    serial_port_bitmap(&mut bus, 0x00);
    assert_eq!(core.state.cpl(), 3);
    assert_eq!(core.state.iopl(), 0);

    let access = IoAccess::new(0x3f8, 1, IoDirection::Out);
    assert_eq!(core.allow_io(&mut bus, &access), Ok(true));
}

#[test]
fn user_io_to_a_denied_port_raises_gp() {
    let (mut core, mut bus, _apic) = guest();
    serial_port_bitmap(&mut bus, 0x01);
    core.state.rip = 0x4001;

    let access = IoAccess::new(0x3f8, 1, IoDirection::Out);
    assert_eq!(core.allow_io(&mut bus, &access), Ok(false));
    let fault = core.check_io(&mut bus, &access).unwrap_err();
    assert_eq!(fault, Fault::gp0());

    core.deliver_fault(&mut bus, fault).unwrap();
    assert_eq!(core.state.rip, handler(13));
    assert_eq!(core.state.cpl(), 0);
    assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 5), 0x4000);
    assert_eq!(stack_u32(&mut bus, KERNEL_STACK, 6), 0);
}

#[test]
fn paging_without_protection_is_rejected() {
    let (mut core, mut bus, mut apic) = guest();
    enter_kernel(&mut core, &mut bus);
    let before = core.state.control;
    let value = u64::from((Cr0::PG | Cr0::ET | Cr0::NE).bits());

    let fault = core.mov_to_cr(&mut bus, &mut apic, 0, value, 0).unwrap_err();
    assert_eq!(fault, Fault::gp0());
    assert_eq!(core.state.control, before);
    assert!(bus.take_flushes().is_empty());

    core.deliver_fault(&mut bus, fault).unwrap();
    assert_eq!(core.state.rip, handler(13));

    // An SVM guest may run paged real mode.
    core.intercept = InterceptPolicy::Svm(SvmControls::default());
    assert!(core.check_cr0(value));
}

#[test]
fn enabling_global_pages_flushes_everything() {
    let (mut core, mut bus, mut apic) = guest();
    enter_kernel(&mut core, &mut bus);
    let paged = core.state.control.cr0 | Cr0::PG;
    core.mov_to_cr(&mut bus, &mut apic, 0, u64::from(paged.bits()), 0)
        .unwrap();
    assert_eq!(bus.take_flushes(), vec![TlbFlush::All]);

    core.mov_to_cr(&mut bus, &mut apic, 4, u64::from(Cr4::PGE.bits()), 0)
        .unwrap();
    assert_eq!(bus.take_flushes(), vec![TlbFlush::All]);
    assert!(core.state.control.cr4.contains(Cr4::PGE));

    // Same value again: nothing changes.
    core.mov_to_cr(&mut bus, &mut apic, 4, u64::from(Cr4::PGE.bits()), 0)
        .unwrap();
    assert!(bus.take_flushes().is_empty());

    // With PGE on, a CR3 load keeps global translations.
    core.mov_to_cr(&mut bus, &mut apic, 3, 0x5000, 0).unwrap();
    assert_eq!(bus.take_flushes(), vec![TlbFlush::NonGlobal]);
}

#[test]
fn nmi_waits_for_the_sti_shadow_then_beats_intr() {
    let (mut core, mut bus, mut apic) = guest();
    let signals = core.signal_handle();
    apic.push(0x30);

    // STI just retired.
    core.events.inhibit_interrupts(Inhibit::INTERRUPTS);
    core.retire_instruction();
    signals.raise_nmi();
    signals.set_intr(true);

    assert_eq!(core.handle_async_event(&mut bus, &mut apic), Ok(Boundary::Continue));
    assert_eq!(core.state.rip, 0x4000);
    assert!(core.events.is_pending(Events::NMI));

    core.retire_instruction();
    assert_eq!(core.handle_async_event(&mut bus, &mut apic), Ok(Boundary::Continue));
    assert_eq!(core.state.rip, handler(2));
    assert!(core.events.is_masked(Events::NMI));
    assert!(apic.acknowledged.is_empty());

    // IRET out of the NMI handler.
    core.nmi_return();
    core.state.set_flag(RFLAGS_IF, true);
    core.retire_instruction();
    assert_eq!(core.handle_async_event(&mut bus, &mut apic), Ok(Boundary::Continue));
    assert_eq!(core.state.rip, handler(0x30));
    assert_eq!(apic.acknowledged, vec![(InterruptSource::Pic, 0x30)]);
}
