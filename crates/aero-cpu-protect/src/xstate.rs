//! XSAVE feature components and the XCR0 / IA32_XSS validators.

use tracing::debug;

use crate::config::{CpuConfig, IsaExtensions};
use crate::cpu::CpuCore;
use crate::exceptions::Fault;
use crate::intercept::InterceptEvent;
use crate::state::{Cr4, XFeatures};

/// One state component of the XSAVE area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XsaveComponent {
    pub feature: XFeatures,
    pub name: &'static str,
    pub size: u32,
    /// Offset in the standard (non-compacted) layout; supervisor components have none.
    pub offset: Option<u32>,
    /// Managed through IA32_XSS rather than XCR0.
    pub supervisor: bool,
    pub requires: IsaExtensions,
}

pub static XSAVE_COMPONENTS: [XsaveComponent; 9] = [
    XsaveComponent {
        feature: XFeatures::X87,
        name: "x87",
        size: 160,
        offset: Some(0),
        supervisor: false,
        requires: IsaExtensions::XSAVE,
    },
    XsaveComponent {
        feature: XFeatures::SSE,
        name: "SSE",
        size: 256,
        offset: Some(160),
        supervisor: false,
        requires: IsaExtensions::SSE,
    },
    XsaveComponent {
        feature: XFeatures::YMM,
        name: "AVX",
        size: 256,
        offset: Some(576),
        supervisor: false,
        requires: IsaExtensions::AVX,
    },
    XsaveComponent {
        feature: XFeatures::OPMASK,
        name: "opmask",
        size: 64,
        offset: Some(1088),
        supervisor: false,
        requires: IsaExtensions::AVX512,
    },
    XsaveComponent {
        feature: XFeatures::ZMM_HI256,
        name: "ZMM_Hi256",
        size: 512,
        offset: Some(1152),
        supervisor: false,
        requires: IsaExtensions::AVX512,
    },
    XsaveComponent {
        feature: XFeatures::HI16_ZMM,
        name: "Hi16_ZMM",
        size: 1024,
        offset: Some(1664),
        supervisor: false,
        requires: IsaExtensions::AVX512,
    },
    XsaveComponent {
        feature: XFeatures::PKRU,
        name: "PKRU",
        size: 8,
        offset: Some(2688),
        supervisor: false,
        requires: IsaExtensions::PKU,
    },
    XsaveComponent {
        feature: XFeatures::CET_U,
        name: "CET_U",
        size: 16,
        offset: None,
        supervisor: true,
        requires: IsaExtensions::CET,
    },
    XsaveComponent {
        feature: XFeatures::CET_S,
        name: "CET_S",
        size: 24,
        offset: None,
        supervisor: true,
        requires: IsaExtensions::CET,
    },
];

/// Looks up a component by its feature bit number.
pub fn component(bit: u32) -> Option<&'static XsaveComponent> {
    XSAVE_COMPONENTS
        .iter()
        .find(|c| c.feature.bits() == 1u32.checked_shl(bit).unwrap_or(0))
}

/// `(XCR0 mask, IA32_XSS mask)` supported by `config`.
pub fn support_masks(config: &CpuConfig) -> (XFeatures, XFeatures) {
    let mut xcr0 = XFeatures::empty();
    let mut xss = XFeatures::empty();
    if !config.has(IsaExtensions::XSAVE) {
        return (xcr0, xss);
    }
    for c in XSAVE_COMPONENTS.iter().filter(|c| config.has(c.requires)) {
        if c.supervisor {
            xss |= c.feature;
        } else {
            xcr0 |= c.feature;
        }
    }
    (xcr0, xss)
}

/// Size of a standard-format XSAVE area holding `features` (legacy region and header
/// included).
pub fn xsave_area_size(features: XFeatures) -> u32 {
    XSAVE_COMPONENTS
        .iter()
        .filter(|c| features.contains(c.feature))
        .filter_map(|c| c.offset.map(|off| off + c.size))
        .fold(512 + 64, u32::max)
}

impl CpuCore {
    pub fn xsetbv(&mut self, ecx: u32, edx: u32, eax: u32) -> Result<(), Fault> {
        if !self.state.control.cr4.contains(Cr4::OSXSAVE) {
            return Err(Fault::ud());
        }
        if self.state.cpl() != 0 {
            return Err(Fault::gp0());
        }
        self.intercept(InterceptEvent::Xsetbv { ecx })?;

        if ecx != 0 || edx != 0 {
            return Err(Fault::gp0());
        }
        let allowed = self.masks.xcr0.bits();
        if eax & !allowed != 0 || eax & XFeatures::X87.bits() == 0 {
            return Err(Fault::gp0());
        }
        let value = XFeatures::from_bits_retain(eax);
        if value.contains(XFeatures::YMM) && !value.contains(XFeatures::SSE) {
            return Err(Fault::gp0());
        }
        if value.intersects(XFeatures::AVX512)
            && !value.contains(XFeatures::X87 | XFeatures::SSE | XFeatures::YMM | XFeatures::AVX512)
        {
            return Err(Fault::gp0());
        }

        debug!(xcr0 = eax, "xsetbv");
        self.state.control.xcr0 = value;
        Ok(())
    }

    pub fn xgetbv(&self, ecx: u32) -> Result<u64, Fault> {
        if !self.state.control.cr4.contains(Cr4::OSXSAVE) {
            return Err(Fault::ud());
        }
        if ecx != 0 {
            return Err(Fault::gp0());
        }
        Ok(u64::from(self.state.control.xcr0.bits()))
    }

    /// `WRMSR IA32_XSS`.
    pub fn write_xss(&mut self, value: u64) -> Result<(), Fault> {
        if value & !u64::from(self.masks.xss.bits()) != 0 {
            return Err(Fault::gp0());
        }
        self.state.control.xss = XFeatures::from_bits_retain(value as u32);
        Ok(())
    }
}
