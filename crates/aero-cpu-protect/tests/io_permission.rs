mod common;

use aero_cpu_protect::intercept::{ProcControls, SvmExitCode, SvmIntercepts, VmxExitReason, SVM_IOPM_SIZE};
use aero_cpu_protect::state::{Cr4, Dr7, RFLAGS_IOPL_MASK, RFLAGS_VM};
use aero_cpu_protect::{
    CpuConfig, CpuCore, CpuExit, DebugTrap, FlatTestBus, Fault, InterceptPolicy, IoAccess,
    IoDirection, SvmControls, VmExitReason, VmxControls,
};

use common::*;

fn user_mode() -> (CpuCore, FlatTestBus) {
    init_tracing();
    protected_mode(CpuConfig::x86_64())
}

fn permit_ports(bus: &mut FlatTestBus, first: u16, bytes: usize) {
    let start = TSS + u64::from(IO_BITMAP) + u64::from(first / 8);
    bus.load(start, &vec![0; bytes]);
}

fn inb(port: u16) -> IoAccess {
    IoAccess::new(port, 1, IoDirection::In)
}

#[test]
fn privileged_code_skips_the_bitmap() {
    let (mut core, mut bus) = user_mode();
    enter_kernel(&mut core, &mut bus);
    assert_eq!(core.allow_io(&mut bus, &inb(0x60)), Ok(true));

    let (mut core, mut bus) = user_mode();
    core.state.rflags |= RFLAGS_IOPL_MASK;
    assert_eq!(core.allow_io(&mut bus, &inb(0x60)), Ok(true));
}

#[test]
fn virtual_8086_mode_always_consults_the_bitmap() {
    let (mut core, mut bus) = user_mode();
    core.state.rflags |= RFLAGS_IOPL_MASK | RFLAGS_VM;
    assert_eq!(core.allow_io(&mut bus, &inb(0x60)), Ok(false));
    assert_eq!(core.check_io(&mut bus, &inb(0x60)), Err(Fault::gp0()));
}

#[test]
fn every_port_of_a_wide_access_must_be_permitted() {
    let (mut core, mut bus) = user_mode();
    // Ports 0x3f8-0x3ff.
    permit_ports(&mut bus, 0x3f8, 1);

    assert_eq!(core.allow_io(&mut bus, &inb(0x3f8)), Ok(true));
    assert_eq!(
        core.allow_io(&mut bus, &IoAccess::new(0x3fc, 4, IoDirection::Out)),
        Ok(true)
    );
    // 0x3ff is permitted, 0x400 is not.
    assert_eq!(
        core.allow_io(&mut bus, &IoAccess::new(0x3ff, 2, IoDirection::In)),
        Ok(false)
    );
    assert_eq!(core.allow_io(&mut bus, &inb(0x3f0)), Ok(false));
}

#[test]
fn bitmap_bytes_beyond_the_tss_limit_deny() {
    let (mut core, mut bus) = user_mode();
    permit_ports(&mut bus, 0, 0x2000);
    core.state.tr.cache.limit = u32::from(IO_BITMAP) + 0x10;

    // Permission word for 0x78 starts at the last byte inside the limit.
    assert_eq!(core.allow_io(&mut bus, &inb(0x78)), Ok(true));
    assert_eq!(core.allow_io(&mut bus, &inb(0x80)), Ok(false));

    // Too short to hold the I/O map base at all.
    core.state.tr.cache.limit = 0x60;
    assert_eq!(core.allow_io(&mut bus, &inb(0)), Ok(false));
}

#[test]
fn vmx_io_exit_follows_a_granted_access() {
    let (mut core, mut bus) = user_mode();
    core.intercept = InterceptPolicy::Vmx(VmxControls {
        proc: ProcControls::UNCONDITIONAL_IO_EXITING,
        ..VmxControls::default()
    });
    // Denied before the hypervisor sees it.
    assert_eq!(core.allow_io(&mut bus, &inb(0x60)), Ok(false));

    enter_kernel(&mut core, &mut bus);
    let mut bitmaps = vec![0u8; 0x2000].into_boxed_slice();
    bitmaps[0x60 / 8] = 0x01;
    core.intercept = InterceptPolicy::Vmx(VmxControls {
        proc: ProcControls::USE_IO_BITMAPS,
        io_bitmaps: bitmaps,
        ..VmxControls::default()
    });
    core.state.rip = 0x4002;

    assert_eq!(core.allow_io(&mut bus, &inb(0x61)), Ok(true));
    let mut access = inb(0x60);
    access.immediate = true;
    let exit = match core.allow_io(&mut bus, &access) {
        Err(Fault::Exit(CpuExit::VmExit(exit))) => exit,
        other => panic!("expected an I/O exit, got {other:?}"),
    };
    assert_eq!(exit.reason, VmExitReason::Vmx(VmxExitReason::IoInstruction));
    assert_eq!(exit.qualification, (0x60 << 16) | (1 << 3) | (1 << 6));
    assert_eq!(core.state.rip, 0x4000);
}

#[test]
fn svm_iopm_reports_next_rip() {
    let (mut core, mut bus) = user_mode();
    enter_kernel(&mut core, &mut bus);
    let mut iopm = vec![0u8; SVM_IOPM_SIZE].into_boxed_slice();
    iopm[0x3f8 / 8] = 0x01;
    core.intercept = InterceptPolicy::Svm(SvmControls {
        intercepts: SvmIntercepts::IOIO_PROT,
        iopm,
        ..SvmControls::default()
    });

    assert_eq!(core.allow_io(&mut bus, &inb(0x3f9)), Ok(true));
    let mut access = inb(0x3f8);
    access.next_rip = 0x4001;
    let exit = match core.allow_io(&mut bus, &access) {
        Err(Fault::Exit(CpuExit::VmExit(exit))) => exit,
        other => panic!("expected IOIO, got {other:?}"),
    };
    assert_eq!(exit.reason, VmExitReason::Svm(SvmExitCode::IOIO));
    assert_eq!(exit.qualification, (0x3f8 << 16) | 1 | (1 << 4) | (1 << 8));
    assert_eq!(exit.info, 0x4001);
}

#[test]
fn io_breakpoints_need_debug_extensions() {
    let (mut core, mut bus) = user_mode();
    enter_kernel(&mut core, &mut bus);
    core.state.debug.dr[0] = 0x3f8;
    core.state.debug.dr7 = Dr7(0x400 | 0x1 | (2 << 16));

    assert_eq!(core.allow_io(&mut bus, &inb(0x3f8)), Ok(true));
    assert!(core.events.debug_trap.is_empty());

    core.state.control.cr4 |= Cr4::DE;
    assert_eq!(core.allow_io(&mut bus, &inb(0x3f9)), Ok(true));
    assert!(core.events.debug_trap.is_empty());
    assert_eq!(
        core.allow_io(&mut bus, &IoAccess::new(0x3f6, 4, IoDirection::Out)),
        Ok(true)
    );
    assert_eq!(core.events.debug_trap, DebugTrap::B0 | DebugTrap::HIT);
}

#[test]
fn denied_access_does_not_match_breakpoints() {
    let (mut core, mut bus) = user_mode();
    core.state.control.cr4 |= Cr4::DE;
    core.state.debug.dr[0] = 0x3f8;
    core.state.debug.dr7 = Dr7(0x400 | 0x1 | (2 << 16));

    assert_eq!(core.check_io(&mut bus, &inb(0x3f8)), Err(Fault::gp0()));
    assert!(core.events.debug_trap.is_empty());
}
