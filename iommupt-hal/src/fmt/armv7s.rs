//! ARM VMSAv7 short-descriptor format
//!
//! 32-bit descriptors over two native levels: a 16 KiB first-level table of
//! 4096 entries (1 MiB sections, 16 MiB supersections, or pointers to
//! second-level tables) and 1 KiB second-level tables of 256 entries
//! (4 KiB small pages, 64 KiB large pages). Large pages and supersections
//! are sixteen repeated identical entries, which is this format's
//! contiguous-run mechanism. Each of the four leaf forms spreads the same
//! attributes over different bit positions, so the attribute set is kept as
//! three pre-encoded words (section, large, small) and the installer picks
//! one by level and size.

use crate::format::{EntryKind, PtFeatures, PtFormat};
use crate::log2;
use crate::types::{PhysAddr, Prot, PtError};

// Descriptor type field, bits 1:0
const TYPE_MASK: u32 = 0b11;
const L1_TYPE_TABLE: u32 = 0b01;
const L1_TYPE_SECTION: u32 = 0b10;
const L2_TYPE_LARGE: u32 = 0b01;
/// Small pages use bit 1; bit 0 is XN
const L2_TYPE_SMALL: u32 = 0b10;

const L1_TABLE_OA_MASK: u32 = 0xFFFF_FC00;
const L1_TABLE_NS: u32 = 1 << 3;

const SECTION_OA_MASK: u32 = 0xFFF0_0000;
const SUPERSECTION_BIT: u32 = 1 << 18;
const SUPERSECTION_OA_MASK: u32 = 0xFF00_0000;
/// PA[35:32] of a supersection
const SUPERSECTION_EXT1_SHIFT: u32 = 20;
/// PA[39:36] of a supersection
const SUPERSECTION_EXT2_SHIFT: u32 = 5;

const SMALL_OA_MASK: u32 = 0xFFFF_F000;
const LARGE_OA_MASK: u32 = 0xFFFF_0000;

// Section attribute positions
const SECTION_B: u32 = 1 << 2;
const SECTION_C: u32 = 1 << 3;
const SECTION_XN: u32 = 1 << 4;
const SECTION_AP0: u32 = 1 << 10;
const SECTION_AP1: u32 = 1 << 11;
const SECTION_TEX_SHIFT: u32 = 12;
const SECTION_AP2: u32 = 1 << 15;
const SECTION_S: u32 = 1 << 16;
const SECTION_NS: u32 = 1 << 19;

// Small page attribute positions
const SMALL_XN: u32 = 1 << 0;
const SMALL_B: u32 = 1 << 2;
const SMALL_C: u32 = 1 << 3;
const SMALL_AP0: u32 = 1 << 4;
const SMALL_AP1: u32 = 1 << 5;
const SMALL_TEX_SHIFT: u32 = 6;
const SMALL_AP2: u32 = 1 << 9;
const SMALL_S: u32 = 1 << 10;

// Large page attribute positions
const LARGE_B: u32 = 1 << 2;
const LARGE_C: u32 = 1 << 3;
const LARGE_AP0: u32 = 1 << 4;
const LARGE_AP1: u32 = 1 << 5;
const LARGE_AP2: u32 = 1 << 9;
const LARGE_S: u32 = 1 << 10;
const LARGE_TEX_SHIFT: u32 = 12;
const LARGE_XN: u32 = 1 << 15;

// FIXME: the MediaTek 4 GiB quirk repurposes spare attribute bits as
// PA[33:32] on every leaf form; unresolved in the reference driver and not
// modelled here.

/// Memory type selector for the TEX/C/B remap-free encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemType {
    Device,
    Normal,
    NormalCached,
}

/// The three pre-encoded attribute words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmV7SAttrs {
    section: u32,
    large: u32,
    small: u32,
}

/// VMSAv7 short-descriptor format instance
#[derive(Debug, Clone, Copy)]
pub struct ArmV7S {
    va_lg2: u8,
    ns: bool,
    ttbr1: bool,
}

impl ArmV7S {
    pub fn new(va_lg2: u8) -> Result<Self, PtError> {
        if !(21..=32).contains(&va_lg2) {
            return Err(PtError::InvalidArgument);
        }
        Ok(Self { va_lg2, ns: false, ttbr1: false })
    }

    pub fn with_ns(mut self) -> Self {
        self.ns = true;
        self
    }

    pub fn with_ttbr1(mut self) -> Self {
        self.ttbr1 = true;
        self
    }

    fn build_attrs(
        &self,
        write: bool,
        unpriv: bool,
        mem: MemType,
        xn: bool,
    ) -> ArmV7SAttrs {
        // TEX[0] set selects the non-remapped normal encodings.
        let (tex, c, b, s) = match mem {
            MemType::Device => (0b000u32, false, true, false),
            MemType::Normal => (0b001, false, false, true),
            MemType::NormalCached => (0b001, true, true, true),
        };
        let ap2 = !write;

        let mut section = (tex << SECTION_TEX_SHIFT) | SECTION_AP0;
        if b {
            section |= SECTION_B;
        }
        if c {
            section |= SECTION_C;
        }
        if s {
            section |= SECTION_S;
        }
        if ap2 {
            section |= SECTION_AP2;
        }
        if unpriv {
            section |= SECTION_AP1;
        }
        if xn {
            section |= SECTION_XN;
        }
        if self.ns {
            section |= SECTION_NS;
        }

        let mut small = (tex << SMALL_TEX_SHIFT) | SMALL_AP0;
        if b {
            small |= SMALL_B;
        }
        if c {
            small |= SMALL_C;
        }
        if s {
            small |= SMALL_S;
        }
        if ap2 {
            small |= SMALL_AP2;
        }
        if unpriv {
            small |= SMALL_AP1;
        }
        if xn {
            small |= SMALL_XN;
        }

        let mut large = (tex << LARGE_TEX_SHIFT) | LARGE_AP0;
        if b {
            large |= LARGE_B;
        }
        if c {
            large |= LARGE_C;
        }
        if s {
            large |= LARGE_S;
        }
        if ap2 {
            large |= LARGE_AP2;
        }
        if unpriv {
            large |= LARGE_AP1;
        }
        if xn {
            large |= LARGE_XN;
        }

        ArmV7SAttrs { section, large, small }
    }

    fn mem_type(tex: u32, c: bool, b: bool) -> MemType {
        if tex & 0b001 == 0 {
            MemType::Device
        } else if c || b {
            MemType::NormalCached
        } else {
            MemType::Normal
        }
    }

    /// Is this level-1 word a large page?
    #[inline]
    fn is_large(word: u32) -> bool {
        word & TYPE_MASK == L2_TYPE_LARGE
    }

    /// Is this level-2 word a supersection?
    #[inline]
    fn is_supersection(word: u32) -> bool {
        word & TYPE_MASK == L1_TYPE_SECTION && word & SUPERSECTION_BIT != 0
    }
}

impl PtFormat for ArmV7S {
    type Word = u32;
    type Attrs = ArmV7SAttrs;

    fn max_top_level(&self) -> u8 {
        2
    }

    fn granule_lg2sz(&self) -> u8 {
        12
    }

    fn max_va_lg2(&self) -> u8 {
        self.va_lg2
    }

    fn max_oa_lg2(&self) -> u8 {
        // Supersections can reach 40 bits; the uniform cap stays at the
        // 32-bit reach of the other three leaf forms.
        32
    }

    fn supported_features(&self) -> PtFeatures {
        let mut f = PtFeatures::DMA_INCOHERENT | PtFeatures::ARM_NS;
        if self.ttbr1 {
            f |= PtFeatures::ARMV7_TTBR1 | PtFeatures::FULL_VA;
        }
        f
    }

    fn full_va_prefix(&self) -> u64 {
        if self.ttbr1 {
            0xFFFF_FFFF
        } else {
            0
        }
    }

    fn num_items_lg2(&self, level: u8) -> u8 {
        if level == 1 {
            8
        } else {
            12
        }
    }

    fn top_items_lg2(&self, top_level: u8) -> u8 {
        // A short TTBR0 walks a truncated first-level table.
        if top_level == 2 && self.va_lg2 < 32 {
            self.va_lg2 - 20
        } else {
            self.num_items_lg2(top_level)
        }
    }

    fn item_lg2sz(&self, level: u8) -> u8 {
        if level == 1 {
            12
        } else {
            20
        }
    }

    fn can_have_leaf(&self, _level: u8) -> bool {
        true
    }

    fn possible_sizes(&self, level: u8) -> u64 {
        if level == 1 {
            log2::to_int(12) | log2::to_int(16)
        } else {
            log2::to_int(20) | log2::to_int(24)
        }
    }

    fn entry_kind(&self, word: u32, level: u8) -> EntryKind {
        match word & TYPE_MASK {
            0b00 => EntryKind::Empty,
            L1_TYPE_TABLE if level == 2 => EntryKind::Table,
            _ => EntryKind::Oa,
        }
    }

    fn entry_oa(&self, word: u32, level: u8) -> PhysAddr {
        if level == 1 {
            if Self::is_large(word) {
                (word & LARGE_OA_MASK) as u64
            } else {
                (word & SMALL_OA_MASK) as u64
            }
        } else if Self::is_supersection(word) {
            let base = (word & SUPERSECTION_OA_MASK) as u64;
            let ext1 = ((word >> SUPERSECTION_EXT1_SHIFT) & 0xF) as u64;
            let ext2 = ((word >> SUPERSECTION_EXT2_SHIFT) & 0xF) as u64;
            base | (ext1 << 32) | (ext2 << 36)
        } else {
            (word & SECTION_OA_MASK) as u64
        }
    }

    fn entry_num_contig_lg2(&self, word: u32, level: u8) -> u8 {
        if level == 1 {
            if Self::is_large(word) {
                4
            } else {
                0
            }
        } else if Self::is_supersection(word) {
            4
        } else {
            0
        }
    }

    fn table_pa(&self, word: u32, _level: u8) -> PhysAddr {
        (word & L1_TABLE_OA_MASK) as u64
    }

    fn encode_leaf(&self, oa: PhysAddr, level: u8, oasz_lg2: u8, attrs: &ArmV7SAttrs) -> u32 {
        if level == 1 {
            if oasz_lg2 >= 16 {
                L2_TYPE_LARGE | (oa as u32 & LARGE_OA_MASK) | attrs.large
            } else {
                L2_TYPE_SMALL | (oa as u32 & SMALL_OA_MASK) | attrs.small
            }
        } else if oasz_lg2 >= 24 {
            let ext1 = (log2::div(oa, 32) & 0xF) as u32;
            let ext2 = (log2::div(oa, 36) & 0xF) as u32;
            L1_TYPE_SECTION
                | SUPERSECTION_BIT
                | (oa as u32 & SUPERSECTION_OA_MASK)
                | (ext1 << SUPERSECTION_EXT1_SHIFT)
                | (ext2 << SUPERSECTION_EXT2_SHIFT)
                | attrs.section
        } else {
            L1_TYPE_SECTION | (oa as u32 & SECTION_OA_MASK) | attrs.section
        }
    }

    fn encode_table(&self, table_pa: PhysAddr, _level: u8) -> u32 {
        let mut word = L1_TYPE_TABLE | (table_pa as u32 & L1_TABLE_OA_MASK);
        if self.ns {
            word |= L1_TABLE_NS;
        }
        word
    }

    fn attrs_from_entry(&self, word: u32, level: u8) -> ArmV7SAttrs {
        let (write, unpriv, mem, xn) = if level == 1 {
            if Self::is_large(word) {
                (
                    word & LARGE_AP2 == 0,
                    word & LARGE_AP1 != 0,
                    Self::mem_type(
                        (word >> LARGE_TEX_SHIFT) & 0x7,
                        word & LARGE_C != 0,
                        word & LARGE_B != 0,
                    ),
                    word & LARGE_XN != 0,
                )
            } else {
                (
                    word & SMALL_AP2 == 0,
                    word & SMALL_AP1 != 0,
                    Self::mem_type(
                        (word >> SMALL_TEX_SHIFT) & 0x7,
                        word & SMALL_C != 0,
                        word & SMALL_B != 0,
                    ),
                    word & SMALL_XN != 0,
                )
            }
        } else {
            (
                word & SECTION_AP2 == 0,
                word & SECTION_AP1 != 0,
                Self::mem_type(
                    (word >> SECTION_TEX_SHIFT) & 0x7,
                    word & SECTION_C != 0,
                    word & SECTION_B != 0,
                ),
                word & SECTION_XN != 0,
            )
        };
        self.build_attrs(write, unpriv, mem, xn)
    }

    fn attrs_from_prot(&self, prot: Prot) -> Result<ArmV7SAttrs, PtError> {
        if !prot.contains(Prot::READ) {
            // Reads cannot be disabled in this layout
            return Err(PtError::InvalidArgument);
        }
        let mem = if prot.contains(Prot::MMIO) {
            MemType::Device
        } else if prot.contains(Prot::CACHE) {
            MemType::NormalCached
        } else {
            MemType::Normal
        };
        Ok(self.build_attrs(
            prot.contains(Prot::WRITE),
            !prot.contains(Prot::PRIV),
            mem,
            prot.contains(Prot::NOEXEC),
        ))
    }
}
