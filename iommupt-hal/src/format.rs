//! The per-format page table contract
//!
//! A format is a pure description of one hardware table layout: descriptor
//! encoding, per-level geometry and the set of representable page sizes.
//! Formats never touch memory; the engine owns every load and store and
//! hands words in and out through this trait, so a format implementation is
//! testable as plain arithmetic.
//!
//! Level numbering is the generic convention throughout: a leaf translation
//! is a level 0 object, the table holding leaf entries is level 1, and each
//! enclosing table adds one. Formats whose native numbering is inverted
//! translate internally.

use bitflags::bitflags;

use crate::types::{PhysAddr, Prot, PtError};
use crate::word::TableWord;

bitflags! {
    /// Per-domain feature bits.
    ///
    /// A domain may only enable bits its format reports in
    /// [`PtFormat::supported_features`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtFeatures: u32 {
        /// Table memory is not coherent with the IOMMU walker and must be
        /// DMA-flushed after every update.
        const DMA_INCOHERENT = 1 << 0;
        /// The root can be grown in place while readers walk concurrently.
        const DYNAMIC_TOP = 1 << 1;
        /// VA is interpreted against a format-selected high prefix
        /// (upper-half tables).
        const FULL_VA = 1 << 2;
        /// Leaf output size may be changed in place.
        const OA_SIZE_CHANGE = 1 << 3;
        /// A leaf may replace an (empty) table and vice versa in place.
        const OA_TABLE_XCHG = 1 << 4;
        /// AArch64 stage-2 attribute encoding.
        const ARM_S2 = 1 << 8;
        /// AArch64 TTBR1 (upper half) table.
        const ARM_TTBR1 = 1 << 9;
        /// 52-bit output addresses (64K granule only).
        const ARM_LPA = 1 << 10;
        /// Hardware dirty-bit management.
        const ARM_DBM = 1 << 11;
        /// Stage-2 forced write-back combining.
        const ARM_S2FWB = 1 << 12;
        /// Secure namespace table walks.
        const ARM_NS = 1 << 13;
        /// ARMv7 TTBR1 split.
        const ARMV7_TTBR1 = 1 << 14;
        /// Apple DART second-generation descriptor layout.
        const DART_V2 = 1 << 15;
    }
}

/// What a loaded descriptor translates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Not present
    Empty,
    /// Points to a child table
    Table,
    /// Produces an output address (leaf)
    Oa,
}

/// Aperture summary reported by `get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtInfo {
    /// Natively representable page sizes, bit `k` set for `2^k`
    pub pgsize_bitmap: u64,
    /// Input address width in bits
    pub ias: u8,
    /// Output address width in bits
    pub oas: u8,
    /// Features enabled on this domain
    pub features: PtFeatures,
}

/// One hardware table format.
///
/// Geometry methods take the generic level of the table being inspected
/// (`1..=max_top_level`). The engine monomorphises its walk per level, so
/// implementations should be `#[inline]` arithmetic over their configuration.
pub trait PtFormat: Send + Sync + 'static {
    /// Raw descriptor word type
    type Word: TableWord;

    /// Pre-encoded attribute set carried between descriptor and installer.
    type Attrs: Copy + Eq + core::fmt::Debug + Send + Sync;

    /// Deepest level a root table may occupy.
    fn max_top_level(&self) -> u8;

    /// log2 size of a level 0 leaf.
    fn granule_lg2sz(&self) -> u8;

    /// Format cap on input address bits.
    fn max_va_lg2(&self) -> u8;

    /// Format cap on output address bits.
    fn max_oa_lg2(&self) -> u8;

    /// Features this format instance can honour.
    fn supported_features(&self) -> PtFeatures;

    /// `0` for lower-half tables, all-ones for upper-half tables.
    fn full_va_prefix(&self) -> u64 {
        0
    }

    /// log2 number of entries in a table at `level`.
    fn num_items_lg2(&self, level: u8) -> u8;

    /// log2 number of entries in the root table when the root sits at
    /// `top_level`. Formats with concatenated or truncated roots override.
    fn top_items_lg2(&self, top_level: u8) -> u8 {
        self.num_items_lg2(top_level)
    }

    /// log2 byte size of a table at `level`.
    fn table_lg2sz(&self, level: u8) -> u8 {
        self.num_items_lg2(level) + Self::Word::LG2SZ
    }

    /// log2 VA span of a single entry in a table at `level`.
    fn item_lg2sz(&self, level: u8) -> u8;

    /// May a table at `level` hold OA leaves?
    fn can_have_leaf(&self, level: u8) -> bool;

    /// Bitmap of leaf sizes installable in a table at `level`, bit `k` set
    /// for `2^k`. Includes contiguous-run sizes.
    fn possible_sizes(&self, level: u8) -> u64;

    /// Classify a loaded descriptor.
    fn entry_kind(&self, word: Self::Word, level: u8) -> EntryKind;

    /// Output address of an OA entry, at item granularity. For an entry
    /// inside a contiguous run the run base is recovered by aligning down to
    /// the run size.
    fn entry_oa(&self, word: Self::Word, level: u8) -> PhysAddr;

    /// log2 of the number of items the leaf's contiguous run spans
    /// (0 for a singleton).
    fn entry_num_contig_lg2(&self, word: Self::Word, level: u8) -> u8;

    /// Child table address of a Table entry.
    fn table_pa(&self, word: Self::Word, level: u8) -> PhysAddr;

    /// Encode a leaf for the item whose VA-aligned output is `oa`, covering
    /// `2^oasz_lg2` bytes in total (>= the item size when contiguous).
    fn encode_leaf(&self, oa: PhysAddr, level: u8, oasz_lg2: u8, attrs: &Self::Attrs)
        -> Self::Word;

    /// Encode a next-level table pointer installable at `level`.
    fn encode_table(&self, table_pa: PhysAddr, level: u8) -> Self::Word;

    /// Recover the attribute set of an installed leaf. Reinstalling the
    /// result must reproduce an identical descriptor.
    fn attrs_from_entry(&self, word: Self::Word, level: u8) -> Self::Attrs;

    /// Translate caller protection flags into the format attribute set.
    fn attrs_from_prot(&self, prot: Prot) -> Result<Self::Attrs, PtError>;

    /// Does this instance track hardware dirty state?
    fn dirty_tracking(&self) -> bool {
        false
    }

    fn entry_is_dirty(&self, _word: Self::Word, _level: u8) -> bool {
        false
    }

    fn entry_clear_dirty(&self, word: Self::Word, _level: u8) -> Self::Word {
        word
    }

    fn entry_set_dirty(&self, word: Self::Word, _level: u8) -> Self::Word {
        word
    }
}
