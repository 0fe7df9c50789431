//! CET shadow-stack bookkeeping performed during event delivery.

use tracing::debug;

use crate::cpu::CpuCore;
use crate::exceptions::Fault;
use crate::mem::CpuBus;
use crate::state::{Cr4, CET_SH_STK_EN};

/// Supervisor shadow-stack token busy bit.
const TOKEN_BUSY: u64 = 1;

impl CpuCore {
    /// Shadow stacks are active for code running at `cpl`.
    pub fn shadow_stack_enabled(&self, cpl: u8) -> bool {
        let cet = &self.state.cet;
        let control = if cpl == 3 { cet.u_cet } else { cet.s_cet };
        self.state.control.cr4.contains(Cr4::CET)
            && self.state.protected_mode()
            && control & CET_SH_STK_EN != 0
    }

    /// Parks the user SSP in `IA32_PL3_SSP` before leaving CPL 3.
    pub(crate) fn save_user_ssp(&mut self, old_cpl: u8) {
        if old_cpl == 3 && self.shadow_stack_enabled(3) {
            self.state.cet.pl_ssp[3] = self.state.cet.ssp;
        }
    }

    /// Switches to the supervisor shadow stack at `new_ssp`, claiming its token.
    pub(crate) fn shadow_stack_switch<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        new_ssp: u64,
    ) -> Result<(), Fault> {
        if new_ssp & 0x7 != 0 {
            debug!(new_ssp, "misaligned shadow stack pointer");
            return Err(Fault::gp0());
        }
        if !self.state.long64_mode() && new_ssp >> 32 != 0 {
            return Err(Fault::gp0());
        }
        let token = bus.read_u64(new_ssp)?;
        if token != new_ssp {
            debug!(new_ssp, token, "shadow stack token invalid or busy");
            return Err(Fault::gp0());
        }
        bus.write_u64(new_ssp, token | TOKEN_BUSY)?;
        self.state.cet.ssp = new_ssp;
        Ok(())
    }

    /// Records the interrupted CS, linear return address and SSP on the new shadow stack.
    pub(crate) fn call_far_shadow_stack_push<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        cs: u16,
        lip: u64,
        old_ssp: u64,
    ) -> Result<(), Fault> {
        if self.state.cet.ssp & 0x7 != 0 {
            let padded = self.state.cet.ssp.wrapping_sub(4);
            bus.write_u32(padded, 0)?;
            self.state.cet.ssp = padded & !0x7;
        }
        for value in [u64::from(cs), lip, old_ssp] {
            let ssp = self.state.cet.ssp.wrapping_sub(8);
            bus.write_u64(ssp, value)?;
            self.state.cet.ssp = ssp;
        }
        Ok(())
    }
}
