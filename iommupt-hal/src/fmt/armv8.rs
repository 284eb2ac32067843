//! ARM VMSAv8-64 long-descriptor format
//!
//! 64-bit descriptors at 4K/16K/64K granules, stage-1 and stage-2 attribute
//! encodings, optional upper-half (TTBR1) tables, 52-bit output addresses
//! with the 64K granule (LPA), hardware dirty-bit management (DBM), S2FWB
//! and secure-namespace table walks.
//!
//! Contiguous runs are the architectural fixed-length hint: a power-of-two
//! group of adjacent entries with identical attributes and the CONTIG bit
//! set, each entry still carrying its own output address.

use crate::format::{EntryKind, PtFeatures, PtFormat};
use crate::log2;
use crate::types::{PhysAddr, Prot, PtError};

const PTE_VALID: u64 = 1 << 0;
/// Table at levels >= 2, page at level 1
const PTE_TYPE: u64 = 1 << 1;

// Stage-1 lower attributes
const ATTRINDX_SHIFT: u32 = 2;
const PTE_NS: u64 = 1 << 5;
/// Unprivileged access
const PTE_AP_UNPRIV: u64 = 1 << 6;
/// Read-only
const PTE_AP_RDONLY: u64 = 1 << 7;
const SH_INNER: u64 = 0b11 << 8;
const PTE_AF: u64 = 1 << 10;

// Stage-2 lower attributes
const S2_MEMATTR_SHIFT: u32 = 2;
const S2AP_READ: u64 = 1 << 6;
const S2AP_WRITE: u64 = 1 << 7;

// Upper attributes
const PTE_DBM: u64 = 1 << 51;
const PTE_CONTIG: u64 = 1 << 52;
const PTE_UXN: u64 = 1 << 53;
const PTE_PXN: u64 = 1 << 54;
const PTE_NSTABLE: u64 = 1 << 63;

/// MAIR indices the embedding driver programs to match
const ATTRIDX_NC: u64 = 0;
const ATTRIDX_CACHE: u64 = 1;
const ATTRIDX_DEV: u64 = 2;

// Stage-2 MemAttr encodings, with and without FWB
const S2_MEMATTR_WB: u64 = 0b1111;
const S2_MEMATTR_NC: u64 = 0b0101;
const S2_MEMATTR_DEV: u64 = 0b0001;
const S2_MEMATTR_FWB_WB: u64 = 0b0110;
const S2_MEMATTR_FWB_NC: u64 = 0b0101;
const S2_MEMATTR_FWB_DEV: u64 = 0b0001;

const OA48_END: u8 = 48;
/// OA bits 51:48 live in descriptor bits 15:12 with the 64K granule
const LPA_OA_SHIFT: u32 = 12;
const LPA_OA_MASK: u64 = 0xF << LPA_OA_SHIFT;

const S1_ATTR_MASK: u64 =
    (0x3FF << ATTRINDX_SHIFT) | PTE_DBM | PTE_UXN | PTE_PXN | PTE_NSTABLE;
const S2_ATTR_MASK: u64 = (0x3FF << S2_MEMATTR_SHIFT) | PTE_DBM | PTE_UXN | PTE_PXN;

/// Translation granule selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmGranule {
    K4,
    K16,
    K64,
}

impl ArmGranule {
    const fn lg2(self) -> u8 {
        match self {
            ArmGranule::K4 => 12,
            ArmGranule::K16 => 14,
            ArmGranule::K64 => 16,
        }
    }
}

/// Pre-encoded attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmV8Attrs {
    bits: u64,
}

/// VMSAv8-64 format instance
#[derive(Debug, Clone, Copy)]
pub struct ArmV8 {
    granule_lg2: u8,
    va_lg2: u8,
    stage2: bool,
    ttbr1: bool,
    lpa: bool,
    dbm: bool,
    s2fwb: bool,
    ns: bool,
}

/// Construction parameters for [`ArmV8`]
#[derive(Debug, Clone, Copy)]
pub struct ArmV8Cfg {
    pub granule: ArmGranule,
    pub va_lg2: u8,
    pub stage2: bool,
    pub ttbr1: bool,
    pub lpa: bool,
    pub dbm: bool,
    pub s2fwb: bool,
    pub ns: bool,
}

impl ArmV8Cfg {
    pub fn stage1(granule: ArmGranule, va_lg2: u8) -> Self {
        Self {
            granule,
            va_lg2,
            stage2: false,
            ttbr1: false,
            lpa: false,
            dbm: false,
            s2fwb: false,
            ns: false,
        }
    }

    pub fn stage2(granule: ArmGranule, va_lg2: u8) -> Self {
        Self { stage2: true, ..Self::stage1(granule, va_lg2) }
    }
}

impl ArmV8 {
    pub fn new(cfg: ArmV8Cfg) -> Result<Self, PtError> {
        let granule_lg2 = cfg.granule.lg2();
        if cfg.va_lg2 < granule_lg2 + 1 || cfg.va_lg2 > 48 {
            return Err(PtError::InvalidArgument);
        }
        if cfg.lpa && cfg.granule != ArmGranule::K64 {
            return Err(PtError::NotSupported);
        }
        if cfg.ttbr1 && cfg.stage2 {
            return Err(PtError::InvalidArgument);
        }
        if cfg.s2fwb && !cfg.stage2 {
            return Err(PtError::InvalidArgument);
        }
        Ok(Self {
            granule_lg2,
            va_lg2: cfg.va_lg2,
            stage2: cfg.stage2,
            ttbr1: cfg.ttbr1,
            lpa: cfg.lpa,
            dbm: cfg.dbm,
            s2fwb: cfg.s2fwb,
            ns: cfg.ns,
        })
    }

    #[inline]
    fn bits_per_level(&self) -> u8 {
        self.granule_lg2 - 3
    }

    /// log2 entries in an architectural contiguous run, 0 when the level
    /// has none.
    fn contig_lg2(&self, level: u8) -> u8 {
        match (self.granule_lg2, level) {
            (12, 1) | (12, 2) => 4,
            (14, 1) => 7,
            (14, 2) => 5,
            (16, 1) | (16, 2) => 5,
            _ => 0,
        }
    }

    #[inline]
    fn oa_field_mask(&self, low_lg2: u8) -> u64 {
        log2::to_max(OA48_END) & !log2::to_max(low_lg2)
    }

    fn encode_oa(&self, oa: PhysAddr, low_lg2: u8) -> u64 {
        let mut bits = oa & self.oa_field_mask(low_lg2);
        if self.lpa {
            bits |= (log2::div(oa, OA48_END) & 0xF) << LPA_OA_SHIFT;
        }
        bits
    }

    fn decode_oa(&self, word: u64, low_lg2: u8) -> PhysAddr {
        let mut oa = word & self.oa_field_mask(low_lg2);
        if self.lpa {
            oa |= ((word & LPA_OA_MASK) >> LPA_OA_SHIFT) << OA48_END;
        }
        oa
    }

    fn attr_mask(&self) -> u64 {
        if self.stage2 {
            S2_ATTR_MASK
        } else {
            S1_ATTR_MASK
        }
    }
}

impl PtFormat for ArmV8 {
    type Word = u64;
    type Attrs = ArmV8Attrs;

    fn max_top_level(&self) -> u8 {
        match self.granule_lg2 {
            12 | 14 => 4,
            _ => 3,
        }
    }

    fn granule_lg2sz(&self) -> u8 {
        self.granule_lg2
    }

    fn max_va_lg2(&self) -> u8 {
        self.va_lg2
    }

    fn max_oa_lg2(&self) -> u8 {
        if self.lpa {
            52
        } else {
            48
        }
    }

    fn supported_features(&self) -> PtFeatures {
        let mut f = PtFeatures::DMA_INCOHERENT | PtFeatures::OA_TABLE_XCHG;
        if self.stage2 {
            f |= PtFeatures::ARM_S2;
        }
        if self.ttbr1 {
            f |= PtFeatures::ARM_TTBR1 | PtFeatures::FULL_VA;
        }
        if self.lpa {
            f |= PtFeatures::ARM_LPA;
        }
        if self.dbm {
            f |= PtFeatures::ARM_DBM;
        }
        if self.s2fwb {
            f |= PtFeatures::ARM_S2FWB;
        }
        if self.ns {
            f |= PtFeatures::ARM_NS;
        }
        f
    }

    fn full_va_prefix(&self) -> u64 {
        if self.ttbr1 {
            u64::MAX
        } else {
            0
        }
    }

    fn num_items_lg2(&self, _level: u8) -> u8 {
        self.bits_per_level()
    }

    fn top_items_lg2(&self, top_level: u8) -> u8 {
        let item = self.item_lg2sz(top_level);
        if self.va_lg2 <= item {
            return 1;
        }
        // Stage-2 concatenates up to 16 tables at the top; stage-1 roots
        // can only shrink.
        let cap = if self.stage2 {
            self.bits_per_level() + 4
        } else {
            self.bits_per_level()
        };
        (self.va_lg2 - item).min(cap)
    }

    fn item_lg2sz(&self, level: u8) -> u8 {
        self.granule_lg2 + self.bits_per_level() * (level - 1)
    }

    fn can_have_leaf(&self, level: u8) -> bool {
        match level {
            1 | 2 => true,
            3 => self.granule_lg2 == 12,
            _ => false,
        }
    }

    fn possible_sizes(&self, level: u8) -> u64 {
        if !self.can_have_leaf(level) {
            return 0;
        }
        let item = self.item_lg2sz(level);
        let mut sizes = log2::to_int(item);
        let contig = self.contig_lg2(level);
        if contig != 0 {
            sizes |= log2::to_int(item + contig);
        }
        sizes
    }

    fn entry_kind(&self, word: u64, level: u8) -> EntryKind {
        if word & PTE_VALID == 0 {
            EntryKind::Empty
        } else if level == 1 {
            // bits[1:0] == 0b01 is reserved at the last level
            if word & PTE_TYPE != 0 {
                EntryKind::Oa
            } else {
                EntryKind::Empty
            }
        } else if word & PTE_TYPE != 0 {
            EntryKind::Table
        } else {
            EntryKind::Oa
        }
    }

    fn entry_oa(&self, word: u64, level: u8) -> PhysAddr {
        self.decode_oa(word, self.item_lg2sz(level))
    }

    fn entry_num_contig_lg2(&self, word: u64, level: u8) -> u8 {
        if word & PTE_CONTIG != 0 {
            self.contig_lg2(level)
        } else {
            0
        }
    }

    fn table_pa(&self, word: u64, _level: u8) -> PhysAddr {
        self.decode_oa(word, self.granule_lg2)
    }

    fn encode_leaf(&self, oa: PhysAddr, level: u8, oasz_lg2: u8, attrs: &ArmV8Attrs) -> u64 {
        let item = self.item_lg2sz(level);
        let mut word = PTE_VALID | self.encode_oa(oa, item) | attrs.bits;
        if level == 1 {
            word |= PTE_TYPE;
        }
        if oasz_lg2 > item {
            word |= PTE_CONTIG;
        }
        word
    }

    fn encode_table(&self, table_pa: PhysAddr, _level: u8) -> u64 {
        let mut word = PTE_VALID | PTE_TYPE | self.encode_oa(table_pa, self.granule_lg2);
        if self.ns {
            word |= PTE_NSTABLE;
        }
        word
    }

    fn attrs_from_entry(&self, word: u64, _level: u8) -> ArmV8Attrs {
        let mut bits = word & self.attr_mask();
        // Dirty state lives in the AP bits; recover the clean encoding so a
        // reinstall starts clean.
        if self.dbm && bits & PTE_DBM != 0 {
            if self.stage2 {
                bits &= !S2AP_WRITE;
            } else {
                bits |= PTE_AP_RDONLY;
            }
        }
        ArmV8Attrs { bits }
    }

    fn attrs_from_prot(&self, prot: Prot) -> Result<ArmV8Attrs, PtError> {
        if !prot.contains(Prot::READ) && !prot.contains(Prot::WRITE) {
            return Err(PtError::InvalidArgument);
        }
        let mut bits = PTE_AF | SH_INNER;
        if self.stage2 {
            let memattr = match (self.s2fwb, prot.contains(Prot::CACHE), prot.contains(Prot::MMIO))
            {
                (false, _, true) => S2_MEMATTR_DEV,
                (false, true, _) => S2_MEMATTR_WB,
                (false, false, _) => S2_MEMATTR_NC,
                (true, _, true) => S2_MEMATTR_FWB_DEV,
                (true, true, _) => S2_MEMATTR_FWB_WB,
                (true, false, _) => S2_MEMATTR_FWB_NC,
            };
            bits |= memattr << S2_MEMATTR_SHIFT;
            if prot.contains(Prot::READ) {
                bits |= S2AP_READ;
            }
            if prot.contains(Prot::WRITE) {
                if self.dbm {
                    // Start clean; hardware raises the write bit on dirty.
                    bits |= PTE_DBM;
                } else {
                    bits |= S2AP_WRITE;
                }
            }
            if prot.contains(Prot::NOEXEC) {
                bits |= PTE_UXN | PTE_PXN;
            }
        } else {
            let idx = if prot.contains(Prot::MMIO) {
                ATTRIDX_DEV
            } else if prot.contains(Prot::CACHE) {
                ATTRIDX_CACHE
            } else {
                ATTRIDX_NC
            };
            bits |= idx << ATTRINDX_SHIFT;
            if !prot.contains(Prot::PRIV) {
                bits |= PTE_AP_UNPRIV;
            }
            if prot.contains(Prot::WRITE) {
                if self.dbm {
                    bits |= PTE_DBM | PTE_AP_RDONLY;
                }
            } else {
                bits |= PTE_AP_RDONLY;
            }
            if prot.contains(Prot::NOEXEC) {
                bits |= PTE_UXN | PTE_PXN;
            }
            if self.ns {
                bits |= PTE_NS;
            }
        }
        Ok(ArmV8Attrs { bits })
    }

    fn dirty_tracking(&self) -> bool {
        self.dbm
    }

    fn entry_is_dirty(&self, word: u64, _level: u8) -> bool {
        if word & PTE_DBM == 0 {
            return false;
        }
        if self.stage2 {
            word & S2AP_WRITE != 0
        } else {
            word & PTE_AP_RDONLY == 0
        }
    }

    fn entry_clear_dirty(&self, word: u64, _level: u8) -> u64 {
        if self.stage2 {
            word & !S2AP_WRITE
        } else {
            word | PTE_AP_RDONLY
        }
    }

    fn entry_set_dirty(&self, word: u64, _level: u8) -> u64 {
        if self.stage2 {
            word | S2AP_WRITE
        } else {
            word & !PTE_AP_RDONLY
        }
    }
}
