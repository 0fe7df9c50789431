//! Debug registers and hardware breakpoint matching.

use tracing::{debug, trace};

use crate::cpu::CpuCore;
use crate::events::DebugTrap;
use crate::exceptions::Fault;
use crate::intercept::InterceptEvent;
use crate::mem::{CpuBus, TlbFlush};
use crate::state::{Cr4, DebugRegs, Dr7, RFLAGS_RF};

/// DR7 R/W encodings.
pub mod breakpoint_kind {
    pub const EXECUTE: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const IO: u8 = 2;
    pub const READ_WRITE: u8 = 3;
}

/// Address bits ignored by a breakpoint, indexed by the LEN field: 1, 2, 8 and 4 bytes.
const LEN_ALIGNMENT_MASK: [u64; 4] = [0x0, 0x1, 0x7, 0x3];

const DR6_WRITABLE: u32 = 0x0000_e00f;
const DR7_WRITABLE: u32 = 0xffff_2fff;

/// Compares `size` bytes at `laddr` against the four breakpoints whose R/W field is `opa` or
/// `opb`.
///
/// Every matching breakpoint reports its B bit, enabled or not, once at least one match was
/// found. [`DebugTrap::HIT`] is set only if a matching breakpoint is enabled in DR7.
pub fn hwdebug_compare(debug: &DebugRegs, laddr: u64, size: u32, opa: u8, opb: u8) -> DebugTrap {
    let dr7 = debug.dr7;
    let last = laddr.wrapping_add(u64::from(size.max(1)) - 1);

    let mut found = DebugTrap::empty();
    let mut hit = false;
    for (n, &address) in debug.dr.iter().enumerate() {
        let op = dr7.rw(n);
        if op != opa && op != opb {
            continue;
        }
        let mask = LEN_ALIGNMENT_MASK[usize::from(dr7.len_code(n))];
        let start = address & !mask;
        let end = start + mask;
        if laddr <= end && last >= start {
            found |= DebugTrap::from_bits_retain(1 << n);
            hit |= dr7.enabled(n);
        }
    }
    if hit {
        found |= DebugTrap::HIT;
    }
    found
}

impl CpuCore {
    /// Resolves the DR4/DR5 aliases and runs the checks common to both MOV DR directions.
    fn debug_register_access(&mut self, dr: u8, gpr: u8, write: bool) -> Result<u8, Fault> {
        let de = self.state.control.cr4.contains(Cr4::DE);
        if dr >= 8 || (de && matches!(dr, 4 | 5)) {
            return Err(Fault::ud());
        }
        if self.state.debug.dr7.general_detect() {
            debug!(dr, "debug register access with DR7.GD set");
            self.events.debug_trap |= DebugTrap::DR_ACCESS;
            return Err(Fault::db());
        }
        if self.state.cpl() != 0 {
            return Err(Fault::gp0());
        }
        self.intercept(if write {
            InterceptEvent::DrWrite { dr, gpr }
        } else {
            InterceptEvent::DrRead { dr, gpr }
        })?;
        Ok(match dr {
            4 => 6,
            5 => 7,
            n => n,
        })
    }

    /// `MOV DRn, reg`.
    pub fn mov_to_dr<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        dr: u8,
        value: u64,
        gpr: u8,
    ) -> Result<(), Fault> {
        let dr = self.debug_register_access(dr, gpr, true)?;
        let long64 = self.state.long64_mode();
        let value = if long64 { value } else { value & 0xffff_ffff };
        match dr {
            0..=3 => {
                self.state.debug.dr[usize::from(dr)] = value;
                bus.flush_tlb(TlbFlush::Page(value));
            }
            6 => {
                if value >> 32 != 0 {
                    return Err(Fault::gp0());
                }
                let dr6 = self.state.debug.dr6;
                self.state.debug.dr6 = (dr6 & 0xffff_0ff0) | (value as u32 & DR6_WRITABLE);
            }
            _ => {
                if value >> 32 != 0 {
                    return Err(Fault::gp0());
                }
                let dr7 = Dr7((value as u32 & DR7_WRITABLE) | DebugRegs::DR7_RESET);
                for n in 0..4 {
                    if dr7.rw(n) == breakpoint_kind::EXECUTE && dr7.len_code(n) != 0 {
                        debug!(n, "code breakpoint with LEN != 0 is undefined");
                    }
                }
                self.state.debug.dr7 = dr7;
                bus.flush_tlb(TlbFlush::All);
            }
        }
        trace!(dr, value, "debug register written");
        Ok(())
    }

    /// `MOV reg, DRn`.
    pub fn mov_from_dr(&mut self, dr: u8, gpr: u8) -> Result<u64, Fault> {
        let dr = self.debug_register_access(dr, gpr, false)?;
        let debug = &self.state.debug;
        Ok(match dr {
            0..=3 => debug.dr[usize::from(dr)],
            6 => u64::from(debug.dr6),
            _ => u64::from(debug.dr7.0),
        })
    }

    /// Instruction breakpoints for the instruction at `laddr`. Suppressed by RFLAGS.RF.
    pub fn code_breakpoint_match(&self, laddr: u64) -> DebugTrap {
        if self.state.flag(RFLAGS_RF) || !self.state.debug.dr7.any_enabled() {
            return DebugTrap::empty();
        }
        hwdebug_compare(
            &self.state.debug,
            laddr,
            1,
            breakpoint_kind::EXECUTE,
            breakpoint_kind::EXECUTE,
        )
    }

    /// Records data breakpoints hit by a `len`-byte access at `laddr`. Reads only match
    /// read/write breakpoints; writes match both kinds.
    pub fn data_breakpoint_match(&mut self, laddr: u64, len: u32, write: bool) {
        if !self.state.debug.dr7.any_enabled() {
            return;
        }
        let opb = if write {
            breakpoint_kind::WRITE
        } else {
            breakpoint_kind::READ_WRITE
        };
        let bits = hwdebug_compare(
            &self.state.debug,
            laddr,
            len,
            breakpoint_kind::READ_WRITE,
            opb,
        );
        self.events.debug_trap |= bits;
    }

    pub fn io_breakpoint_match(&mut self, port: u16, len: u8) {
        let debug = &self.state.debug;
        if !self.state.control.cr4.contains(Cr4::DE) || !debug.dr7.any_enabled() {
            return;
        }
        let bits = hwdebug_compare(
            debug,
            u64::from(port),
            u32::from(len),
            breakpoint_kind::IO,
            breakpoint_kind::IO,
        );
        if !bits.is_empty() {
            trace!(port, ?bits, "I/O breakpoint");
        }
        self.events.debug_trap |= bits;
    }
}
