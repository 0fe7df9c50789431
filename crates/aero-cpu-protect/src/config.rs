//! Per-vCPU configuration: CPU level and ISA extensions.
//!
//! A configuration always names its feature set. There is deliberately no `Default`; use a
//! preset or [`CpuConfig::new`].

use bitflags::bitflags;
use thiserror::Error;

use crate::state::{Cr4, Efer, XFeatures};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CpuLevel {
    I386 = 3,
    I486 = 4,
    Pentium = 5,
    P6 = 6,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IsaExtensions: u64 {
        /// Virtual-8086 mode extensions (CR4.VME/PVI).
        const VME = 1 << 0;
        const DEBUG_EXTENSIONS = 1 << 1;
        const PSE = 1 << 2;
        const PAE = 1 << 3;
        const PGE = 1 << 4;
        const TSC = 1 << 5;
        const SSE = 1 << 6;
        const XSAVE = 1 << 7;
        const AVX = 1 << 8;
        const AVX512 = 1 << 9;
        const LONG_MODE = 1 << 10;
        const NX = 1 << 11;
        const SYSCALL = 1 << 12;
        const FFXSR = 1 << 13;
        const PCID = 1 << 14;
        const FSGSBASE = 1 << 15;
        const SMEP = 1 << 16;
        const SMAP = 1 << 17;
        const PKU = 1 << 18;
        const PKS = 1 << 19;
        const UMIP = 1 << 20;
        const CET = 1 << 21;
        const VMX = 1 << 22;
        const SVM = 1 << 23;
        const SMX = 1 << 24;
        const TCE = 1 << 25;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    pub level: CpuLevel,
    pub extensions: IsaExtensions,
    /// MAXPHYADDR.
    pub physical_address_bits: u8,
    /// Triple fault resets the processor instead of shutting it down.
    pub reset_on_triple_fault: bool,
    /// Bootstrap processor. Application processors wait for SIPI after INIT.
    pub bsp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{feature} requires CPU level {required:?} or newer (configured {configured:?})")]
    LevelTooLow {
        feature: &'static str,
        required: CpuLevel,
        configured: CpuLevel,
    },
    #[error("{feature} requires {dependency}")]
    MissingDependency {
        feature: &'static str,
        dependency: &'static str,
    },
    #[error("physical address width {0} outside 32..=52")]
    PhysicalAddressBits(u8),
}

/// Writable bits of each feature-gated register, derived once from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowMasks {
    pub cr4: Cr4,
    pub efer: Efer,
    pub xcr0: XFeatures,
    pub xss: XFeatures,
}

impl CpuConfig {
    pub fn new(level: CpuLevel, extensions: IsaExtensions) -> Self {
        Self {
            level,
            extensions,
            physical_address_bits: 36,
            reset_on_triple_fault: true,
            bsp: true,
        }
    }

    pub fn i386() -> Self {
        Self::new(CpuLevel::I386, IsaExtensions::empty())
    }

    pub fn i486() -> Self {
        Self::new(CpuLevel::I486, IsaExtensions::empty())
    }

    pub fn pentium() -> Self {
        Self::new(
            CpuLevel::Pentium,
            IsaExtensions::VME | IsaExtensions::DEBUG_EXTENSIONS | IsaExtensions::PSE | IsaExtensions::TSC,
        )
    }

    /// A P6-level x86-64 processor with both virtualization extensions and CET.
    pub fn x86_64() -> Self {
        Self {
            physical_address_bits: 40,
            ..Self::new(
                CpuLevel::P6,
                IsaExtensions::VME
                    | IsaExtensions::DEBUG_EXTENSIONS
                    | IsaExtensions::PSE
                    | IsaExtensions::PAE
                    | IsaExtensions::PGE
                    | IsaExtensions::TSC
                    | IsaExtensions::SSE
                    | IsaExtensions::XSAVE
                    | IsaExtensions::AVX
                    | IsaExtensions::LONG_MODE
                    | IsaExtensions::NX
                    | IsaExtensions::SYSCALL
                    | IsaExtensions::FFXSR
                    | IsaExtensions::PCID
                    | IsaExtensions::FSGSBASE
                    | IsaExtensions::SMEP
                    | IsaExtensions::SMAP
                    | IsaExtensions::UMIP
                    | IsaExtensions::CET
                    | IsaExtensions::VMX
                    | IsaExtensions::SVM,
            )
        }
    }

    pub fn has(&self, ext: IsaExtensions) -> bool {
        self.extensions.contains(ext)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(32..=52).contains(&self.physical_address_bits) {
            return Err(ConfigError::PhysicalAddressBits(self.physical_address_bits));
        }

        let level_gates = [
            (IsaExtensions::VME, "VME", CpuLevel::Pentium),
            (IsaExtensions::TSC, "TSC", CpuLevel::Pentium),
            (IsaExtensions::PAE, "PAE", CpuLevel::P6),
            (IsaExtensions::PGE, "PGE", CpuLevel::P6),
            (IsaExtensions::SSE, "SSE", CpuLevel::P6),
            (IsaExtensions::LONG_MODE, "long mode", CpuLevel::P6),
            (IsaExtensions::PCID, "PCID", CpuLevel::P6),
            (IsaExtensions::VMX, "VMX", CpuLevel::P6),
            (IsaExtensions::SVM, "SVM", CpuLevel::P6),
        ];
        for (ext, feature, required) in level_gates {
            if self.has(ext) && self.level < required {
                return Err(ConfigError::LevelTooLow {
                    feature,
                    required,
                    configured: self.level,
                });
            }
        }

        let dependencies = [
            (IsaExtensions::LONG_MODE, "long mode", IsaExtensions::PAE, "PAE"),
            (IsaExtensions::PCID, "PCID", IsaExtensions::LONG_MODE, "long mode"),
            (IsaExtensions::XSAVE, "XSAVE", IsaExtensions::SSE, "SSE"),
            (IsaExtensions::AVX, "AVX", IsaExtensions::XSAVE, "XSAVE"),
            (IsaExtensions::AVX512, "AVX-512", IsaExtensions::AVX, "AVX"),
            (IsaExtensions::CET, "CET", IsaExtensions::XSAVE, "XSAVE"),
            (IsaExtensions::FFXSR, "FFXSR", IsaExtensions::LONG_MODE, "long mode"),
        ];
        for (ext, feature, dependency, dependency_name) in dependencies {
            if self.has(ext) && !self.has(dependency) {
                return Err(ConfigError::MissingDependency {
                    feature,
                    dependency: dependency_name,
                });
            }
        }
        Ok(())
    }

    pub fn allow_masks(&self) -> AllowMasks {
        let mut cr4 = Cr4::MCE | Cr4::PCE;
        let gated = [
            (IsaExtensions::VME, Cr4::VME | Cr4::PVI),
            (IsaExtensions::TSC, Cr4::TSD),
            (IsaExtensions::DEBUG_EXTENSIONS, Cr4::DE),
            (IsaExtensions::PSE, Cr4::PSE),
            (IsaExtensions::PAE, Cr4::PAE),
            (IsaExtensions::PGE, Cr4::PGE),
            (IsaExtensions::SSE, Cr4::OSFXSR | Cr4::OSXMMEXCPT),
            (IsaExtensions::UMIP, Cr4::UMIP),
            (IsaExtensions::VMX, Cr4::VMXE),
            (IsaExtensions::SMX, Cr4::SMXE),
            (IsaExtensions::FSGSBASE, Cr4::FSGSBASE),
            (IsaExtensions::PCID, Cr4::PCIDE),
            (IsaExtensions::XSAVE, Cr4::OSXSAVE),
            (IsaExtensions::SMEP, Cr4::SMEP),
            (IsaExtensions::SMAP, Cr4::SMAP),
            (IsaExtensions::PKU, Cr4::PKE),
            (IsaExtensions::CET, Cr4::CET),
            (IsaExtensions::PKS, Cr4::PKS),
        ];
        for (ext, bits) in gated {
            if self.has(ext) {
                cr4 |= bits;
            }
        }

        let mut efer = Efer::empty();
        let efer_gated = [
            (IsaExtensions::SYSCALL, Efer::SCE),
            (IsaExtensions::LONG_MODE, Efer::LME | Efer::LMA),
            (IsaExtensions::NX, Efer::NXE),
            (IsaExtensions::SVM, Efer::SVME),
            (IsaExtensions::FFXSR, Efer::FFXSR),
            (IsaExtensions::TCE, Efer::TCE),
        ];
        for (ext, bits) in efer_gated {
            if self.has(ext) {
                efer |= bits;
            }
        }

        let (xcr0, xss) = crate::xstate::support_masks(self);

        AllowMasks {
            cr4,
            efer,
            xcr0,
            xss,
        }
    }
}
