use crate::exceptions::Fault;

/// Scope of a TLB invalidation requested by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlbFlush {
    /// Every translation, global pages included.
    All,
    /// Everything except global pages.
    NonGlobal,
    /// The page holding this linear address.
    Page(u64),
}

/// 48-bit canonical form: bits 63:47 all equal.
pub fn is_canonical(addr: u64) -> bool {
    let upper = (addr as i64) >> 47;
    upper == 0 || upper == -1
}

/// Memory interface consumed by the protection core.
///
/// Linear accesses go through the embedder's paging unit and may fail with
/// [`Fault::PageFault`] (or any other fault the MMU wants delivered). Physical accesses are
/// used for paging structures and virtualization control pages and never fault.
pub trait CpuBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Fault>;
    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Fault>;

    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Fault> {
        let lo = self.read_u8(vaddr)?;
        let hi = self.read_u8(vaddr.wrapping_add(1))?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Fault> {
        let lo = self.read_u16(vaddr)?;
        let hi = self.read_u16(vaddr.wrapping_add(2))?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Fault> {
        let lo = self.read_u32(vaddr)?;
        let hi = self.read_u32(vaddr.wrapping_add(4))?;
        Ok(u64::from(lo) | (u64::from(hi) << 32))
    }

    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Fault> {
        let [lo, hi] = val.to_le_bytes();
        self.write_u8(vaddr, lo)?;
        self.write_u8(vaddr.wrapping_add(1), hi)
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Fault> {
        self.write_u16(vaddr, val as u16)?;
        self.write_u16(vaddr.wrapping_add(2), (val >> 16) as u16)
    }

    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Fault> {
        self.write_u32(vaddr, val as u32)?;
        self.write_u32(vaddr.wrapping_add(4), (val >> 32) as u32)
    }

    fn read_phys_u64(&mut self, paddr: u64) -> u64;
    fn read_phys_u32(&mut self, paddr: u64) -> u32 {
        self.read_phys_u64(paddr) as u32
    }
    fn write_phys_u32(&mut self, paddr: u64, val: u32);

    fn flush_tlb(&mut self, scope: TlbFlush);
}

/// Flat identity-mapped memory for tests and simple embedders.
///
/// Out-of-range linear accesses raise a not-present `#PF`; out-of-range physical reads return
/// zero. Every TLB invalidation is recorded in [`FlatTestBus::flushes`].
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
    pub flushes: Vec<TlbFlush>,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            flushes: Vec::new(),
        }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        &self.mem[start..start + len]
    }

    pub fn take_flushes(&mut self) -> Vec<TlbFlush> {
        std::mem::take(&mut self.flushes)
    }

    fn index(&self, addr: u64, write: bool) -> Result<usize, Fault> {
        usize::try_from(addr)
            .ok()
            .filter(|&idx| idx < self.mem.len())
            .ok_or(Fault::PageFault {
                address: addr,
                error_code: if write { 1 << 1 } else { 0 },
            })
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Fault> {
        let idx = self.index(vaddr, false)?;
        Ok(self.mem[idx])
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Fault> {
        let idx = self.index(vaddr, true)?;
        self.mem[idx] = val;
        Ok(())
    }

    fn read_phys_u64(&mut self, paddr: u64) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self
                .mem
                .get(paddr.wrapping_add(i as u64) as usize)
                .copied()
                .unwrap_or(0);
        }
        u64::from_le_bytes(bytes)
    }

    fn write_phys_u32(&mut self, paddr: u64, val: u32) {
        for (i, byte) in val.to_le_bytes().into_iter().enumerate() {
            if let Some(slot) = self.mem.get_mut(paddr.wrapping_add(i as u64) as usize) {
                *slot = byte;
            }
        }
    }

    fn flush_tlb(&mut self, scope: TlbFlush) {
        self.flushes.push(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_composition() {
        let mut bus = FlatTestBus::new(0x100);
        bus.write_u64(0x10, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(bus.read_u16(0x10).unwrap(), 0x7788);
        assert_eq!(bus.read_u32(0x14).unwrap(), 0x1122_3344);
        assert_eq!(bus.read_phys_u64(0x10), 0x1122_3344_5566_7788);
    }

    #[test]
    fn out_of_range_linear_access_page_faults() {
        let mut bus = FlatTestBus::new(0x10);
        assert_eq!(
            bus.write_u16(0xf, 0xffff),
            Err(Fault::PageFault {
                address: 0x10,
                error_code: 2
            })
        );
        assert_eq!(bus.read_phys_u64(0x1000), 0);
    }

    #[test]
    fn canonical_addresses() {
        assert!(is_canonical(0x0000_7fff_ffff_ffff));
        assert!(is_canonical(0xffff_8000_0000_0000));
        assert!(!is_canonical(0x0000_8000_0000_0000));
    }
}
