//! Completion identifier codec.
//!
//! Every posted work request carries a 64-bit `wr_id` that the completion
//! queue hands back untouched. rsched packs the issuing coroutine and the
//! connection's watermark into it, so the drain loop can route a completion
//! without any per-operation lookup:
//!
//! ```text
//!  63                              bits   bits-1          0
//! ┌──────────────────────────────────┬──────────────────┐
//! │            watermark             │   coroutine id   │
//! └──────────────────────────────────┴──────────────────┘
//! ```
//!
//! The id field is `COR_ID_BIT` (8) bits wide by default. Other widths are
//! chosen at scheduler initialization through `WrIdLayout::new`.

use crate::constants::MAX_COR_ID_BITS;
use crate::error::{SchedError, SchedResult};
use crate::id::CoroutineId;

use core::fmt;

/// Default width of the coroutine-id field.
pub const COR_ID_BIT: u32 = 8;

cfg_if::cfg_if! {
    if #[cfg(feature = "debug-assertions")] {
        macro_rules! codec_contract {
            ($cond:expr, $($arg:tt)+) => { assert!($cond, $($arg)+) };
        }
    } else {
        macro_rules! codec_contract {
            ($cond:expr, $($arg:tt)+) => { debug_assert!($cond, $($arg)+) };
        }
    }
}

/// Opaque completion identifier stored in a work request's `wr_id`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct WrId(pub u64);

impl fmt::Debug for WrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrId({:#x})", self.0)
    }
}

/// Per-connection sequence number of posted work items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Watermark(pub u64);

impl Watermark {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Watermark `span` items later.
    #[inline]
    pub const fn advanced(self, span: u64) -> Self {
        Self(self.0 + span)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bit split between coroutine id and watermark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WrIdLayout {
    bits: u32,
    mask: u64,
}

impl WrIdLayout {
    /// The 8-bit layout: 256 coroutines, 56-bit watermarks.
    pub const DEFAULT: Self = Self {
        bits: COR_ID_BIT,
        mask: (1 << COR_ID_BIT) - 1,
    };

    /// Layout with a `bits`-wide coroutine-id field.
    pub fn new(bits: u32) -> SchedResult<Self> {
        if bits == 0 || bits > MAX_COR_ID_BITS {
            return Err(SchedError::InvalidCorIdBits(bits));
        }
        Ok(Self {
            bits,
            mask: (1u64 << bits) - 1,
        })
    }

    #[inline]
    pub const fn cor_id_bits(&self) -> u32 {
        self.bits
    }

    /// Number of distinct coroutine ids the layout can carry.
    #[inline]
    pub const fn max_coroutines(&self) -> usize {
        1usize << self.bits
    }

    /// Largest watermark that survives the shift.
    #[inline]
    pub const fn max_watermark(&self) -> Watermark {
        Watermark(u64::MAX >> self.bits)
    }

    /// Pack `cor` and `watermark` into an identifier.
    ///
    /// # Panics
    ///
    /// With `debug_assertions` (or the `debug-assertions` feature), panics
    /// if `cor` does not fit the id field or `watermark` exceeds
    /// `max_watermark()`. Callers guard both; use `try_encode` otherwise.
    #[inline]
    pub fn encode(&self, cor: CoroutineId, watermark: Watermark) -> WrId {
        codec_contract!(
            (cor.as_u32() as u64) <= self.mask,
            "coroutine id {} does not fit in {} bits",
            cor.as_u32(),
            self.bits
        );
        codec_contract!(
            watermark <= self.max_watermark(),
            "watermark {} overflows a {}-bit id layout",
            watermark,
            self.bits
        );
        WrId((watermark.0 << self.bits) | cor.as_u32() as u64)
    }

    /// Identifier for `cor` with a zero watermark.
    #[inline]
    pub fn encode_cor(&self, cor: CoroutineId) -> WrId {
        self.encode(cor, Watermark::ZERO)
    }

    /// Checked `encode`.
    #[inline]
    pub fn try_encode(&self, cor: CoroutineId, watermark: Watermark) -> Option<WrId> {
        if (cor.as_u32() as u64) > self.mask || watermark > self.max_watermark() {
            return None;
        }
        Some(WrId((watermark.0 << self.bits) | cor.as_u32() as u64))
    }

    #[inline]
    pub fn decode_coroutine(&self, wr_id: WrId) -> CoroutineId {
        CoroutineId::new((wr_id.0 & self.mask) as u32)
    }

    #[inline]
    pub fn decode_watermark(&self, wr_id: WrId) -> Watermark {
        Watermark(wr_id.0 >> self.bits)
    }
}

impl Default for WrIdLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let layout = WrIdLayout::default();
        assert_eq!(layout.cor_id_bits(), 8);
        assert_eq!(layout.max_coroutines(), 256);
        assert_eq!(layout.max_watermark(), Watermark(u64::MAX >> 8));
        assert_eq!(layout, WrIdLayout::new(COR_ID_BIT).unwrap());
    }

    #[test]
    fn test_encode_bit_positions() {
        let layout = WrIdLayout::DEFAULT;
        let id = layout.encode(CoroutineId::new(3), Watermark(6));
        assert_eq!(id, WrId((6 << 8) | 3));
        assert_eq!(layout.encode_cor(CoroutineId::new(9)), WrId(9));
    }

    #[test]
    fn test_round_trip_all_coroutines() {
        let layout = WrIdLayout::DEFAULT;
        let watermarks = [0, 1, 2, 255, 256, 1 << 40, layout.max_watermark().get()];
        for c in 0..256u32 {
            for &w in &watermarks {
                let id = layout.encode(CoroutineId::new(c), Watermark(w));
                assert_eq!(layout.decode_coroutine(id), CoroutineId::new(c));
                assert_eq!(layout.decode_watermark(id), Watermark(w));
            }
        }
    }

    #[test]
    fn test_round_trip_other_widths() {
        for bits in [1, 4, 12, 16] {
            let layout = WrIdLayout::new(bits).unwrap();
            let top = CoroutineId::new((layout.max_coroutines() - 1) as u32);
            let w = layout.max_watermark();
            let id = layout.encode(top, w);
            assert_eq!(layout.decode_coroutine(id), top);
            assert_eq!(layout.decode_watermark(id), w);
        }
    }

    #[test]
    fn test_invalid_widths() {
        assert_eq!(WrIdLayout::new(0), Err(SchedError::InvalidCorIdBits(0)));
        assert_eq!(WrIdLayout::new(17), Err(SchedError::InvalidCorIdBits(17)));
    }

    #[test]
    fn test_try_encode_rejects_out_of_range() {
        let layout = WrIdLayout::DEFAULT;
        assert!(layout.try_encode(CoroutineId::new(256), Watermark(1)).is_none());
        assert!(layout
            .try_encode(CoroutineId::new(0), layout.max_watermark().advanced(1))
            .is_none());
        assert_eq!(
            layout.try_encode(CoroutineId::new(255), Watermark(1)),
            Some(WrId((1 << 8) | 255))
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit")]
    fn test_encode_oversized_coroutine_panics() {
        WrIdLayout::DEFAULT.encode(CoroutineId::new(256), Watermark(0));
    }
}
