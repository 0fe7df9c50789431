use tracing::debug;

use crate::cpu::CpuCore;
use crate::exceptions::Fault;
use crate::intercept::InterceptEvent;
use crate::mem::CpuBus;
use crate::state::{Cr0, RFLAGS_VM};

/// Offset of the I/O map base field in a 32-bit TSS.
const TSS_IO_MAP_BASE: u64 = 0x66;
/// Smallest TSS limit that still holds the I/O map base field.
const TSS_MIN_IO_LIMIT: u32 = 103;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    In,
    Out,
}

/// One port access (or one whole `REP INS/OUTS`) as seen by the permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccess {
    pub port: u16,
    /// 1, 2 or 4 bytes.
    pub len: u8,
    pub direction: IoDirection,
    pub string: bool,
    pub rep: bool,
    /// Port given as an immediate operand.
    pub immediate: bool,
    /// Address size of a string instruction, in bytes.
    pub address_size: u8,
    /// RIP of the following instruction, reported to SVM.
    pub next_rip: u64,
}

impl IoAccess {
    pub fn new(port: u16, len: u8, direction: IoDirection) -> Self {
        Self {
            port,
            len,
            direction,
            string: false,
            rep: false,
            immediate: false,
            address_size: 4,
            next_rip: 0,
        }
    }

    /// Bits of the 16-bit permission word read at `port / 8` that cover this access.
    ///
    /// Lengths above 4 are clamped to 4.
    pub fn bitmap_mask(&self) -> u16 {
        debug_assert!(matches!(self.len, 1 | 2 | 4), "bad I/O length {}", self.len);
        let len = u32::from(self.len.min(4));
        (((1u32 << len) - 1) << (self.port & 7)) as u16
    }
}

impl CpuCore {
    /// Decides whether the current privilege level may perform `access`.
    ///
    /// `Ok(false)` means the caller raises `#GP(0)`. A granted access is then offered to the
    /// intercept layer and matched against I/O breakpoints; breakpoint hits only accumulate in
    /// the debug-trap state and are reported at the next instruction boundary. String
    /// instructions call this once for the whole repeated operation.
    pub fn allow_io<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        access: &IoAccess,
    ) -> Result<bool, Fault> {
        if !self.io_permitted(bus, access)? {
            debug!(port = access.port, len = access.len, "I/O access denied");
            return Ok(false);
        }
        self.intercept(InterceptEvent::Io(*access))?;
        self.io_breakpoint_match(access.port, access.len);
        Ok(true)
    }

    /// [`CpuCore::allow_io`], mapping a denial to `#GP(0)`.
    pub fn check_io<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        access: &IoAccess,
    ) -> Result<(), Fault> {
        if self.allow_io(bus, access)? {
            Ok(())
        } else {
            Err(Fault::gp0())
        }
    }

    fn io_permitted<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        access: &IoAccess,
    ) -> Result<bool, Fault> {
        let state = &self.state;
        let pe = state.control.cr0.contains(Cr0::PE);
        if !pe || (state.rflags & RFLAGS_VM == 0 && state.cpl() <= state.iopl()) {
            return Ok(true);
        }

        let tss = state.tr.cache;
        if !tss.valid || !tss.present || !tss.is_386_tss() || tss.limit < TSS_MIN_IO_LIMIT {
            return Ok(false);
        }
        let io_base = bus.read_u16(tss.base.wrapping_add(TSS_IO_MAP_BASE))?;
        let offset = u32::from(io_base) + u32::from(access.port / 8);
        if offset >= tss.limit {
            return Ok(false);
        }
        let permission = bus.read_u16(tss.base.wrapping_add(u64::from(offset)))?;
        Ok(permission & access.bitmap_mask() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_mask_one_bit_per_port() {
        assert_eq!(IoAccess::new(0x3f8, 1, IoDirection::In).bitmap_mask(), 0x1);
        assert_eq!(IoAccess::new(0x3fa, 2, IoDirection::In).bitmap_mask(), 0xc);
        assert_eq!(IoAccess::new(0x3ff, 4, IoDirection::Out).bitmap_mask(), 0x780);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "bad I/O length"))]
    fn oversized_length_is_clamped() {
        let access = IoAccess::new(0x3ff, 200, IoDirection::In);
        assert_eq!(access.bitmap_mask(), 0x780);
    }
}
