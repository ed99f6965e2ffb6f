//! Fixed-width binary descriptors and the builder that packs raw byte rows into them.
//!
//! A descriptor of `bits` bits is stored in `ceil(bits / 8)` bytes. Bit `i` lives
//! in byte `i / 8` at position `i % 8` (least significant bit first), so every
//! full source byte is copied verbatim. When the width is not a multiple of
//! eight, the final byte only carries `bits % 8` meaningful bits and its unused
//! high bits are always zero.

use std::fmt;

use rayon::prelude::*;

use crate::HbstError;

/// Runtime description of a descriptor width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorLayout {
    bits: usize,
}

impl DescriptorLayout {
    /// 128-bit descriptors (e.g. BRIEF-16).
    pub const BITS_128: Self = Self { bits: 128 };
    /// 256-bit descriptors (ORB, BRIEF-32).
    pub const BITS_256: Self = Self { bits: 256 };
    /// 488-bit descriptors (AKAZE/MLDB).
    pub const BITS_488: Self = Self { bits: 488 };
    /// 512-bit descriptors (FREAK, BRISK).
    pub const BITS_512: Self = Self { bits: 512 };

    /// Create a layout for descriptors of `bits` bits.
    pub fn new(bits: usize) -> Result<Self, HbstError> {
        if bits == 0 {
            return Err(HbstError::InvalidConfig(
                "descriptor width must be positive",
            ));
        }
        Ok(Self { bits })
    }

    /// Number of meaningful bits per descriptor.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Number of source bytes that are copied in full.
    pub fn raw_bytes(&self) -> usize {
        self.bits / 8
    }

    /// Number of bits taken from the trailing, partially used byte.
    pub fn overflow_bits(&self) -> usize {
        self.bits % 8
    }

    /// Number of bytes needed to store one descriptor.
    pub fn bytes(&self) -> usize {
        (self.bits + 7) / 8
    }

    /// Mask of the bits that may be set in the final storage byte.
    fn last_byte_mask(&self) -> u8 {
        match self.overflow_bits() {
            0 => u8::MAX,
            overflow => (1u8 << overflow) - 1,
        }
    }
}

/// An immutable, fixed-width bit vector.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    bits: usize,
    bytes: Box<[u8]>,
}

impl Descriptor {
    /// All-zero descriptor of the given layout.
    pub fn zeros(layout: DescriptorLayout) -> Self {
        Self {
            bits: layout.bits(),
            bytes: vec![0u8; layout.bytes()].into_boxed_slice(),
        }
    }

    /// Wrap already packed storage bytes, e.g. when loading a persisted index.
    ///
    /// Fails if the length does not match the layout or if any unused
    /// trailing bit is set.
    pub fn from_packed(layout: DescriptorLayout, bytes: Vec<u8>) -> Result<Self, HbstError> {
        if bytes.len() != layout.bytes() {
            return Err(HbstError::DescriptorWidth {
                expected: layout.bytes(),
                got: bytes.len(),
            });
        }
        if let Some(&last) = bytes.last() {
            if last & !layout.last_byte_mask() != 0 {
                return Err(HbstError::ShapeValidation(format!(
                    "unused trailing bits of a {}-bit descriptor must be zero",
                    layout.bits()
                )));
            }
        }
        Ok(Self {
            bits: layout.bits(),
            bytes: bytes.into_boxed_slice(),
        })
    }

    /// Number of meaningful bits.
    pub fn width_bits(&self) -> usize {
        self.bits
    }

    /// Packed storage bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Value of bit `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`Descriptor::width_bits`].
    pub fn bit(&self, index: usize) -> bool {
        assert!(
            index < self.bits,
            "bit index {index} out of range for a {}-bit descriptor",
            self.bits
        );
        (self.bytes[index / 8] >> (index % 8)) & 1 == 1
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// Number of differing bits between two descriptors of the same width.
    pub fn hamming_distance(&self, other: &Descriptor) -> u32 {
        debug_assert_eq!(self.bits, other.bits, "descriptor widths differ");

        let lhs = self.bytes.chunks_exact(8);
        let rhs = other.bytes.chunks_exact(8);
        let tail: u32 = lhs
            .remainder()
            .iter()
            .zip(rhs.remainder())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();

        lhs.zip(rhs)
            .map(|(a, b)| (word(a) ^ word(b)).count_ones())
            .sum::<u32>()
            + tail
    }
}

fn word(chunk: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(chunk);
    u64::from_le_bytes(buf)
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({} bits: ", self.bits)?;
        for byte in self.bytes.iter() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Packs raw caller-supplied byte rows into [`Descriptor`]s.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBuilder {
    layout: DescriptorLayout,
}

impl DescriptorBuilder {
    pub fn new(layout: DescriptorLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> DescriptorLayout {
        self.layout
    }

    /// Check that a row of `width` bytes can be turned into a descriptor.
    pub fn check_row_width(&self, width: usize, pad_allowed: bool) -> Result<(), HbstError> {
        if width == 0 {
            return Err(HbstError::ShapeValidation(
                "descriptor rows must not be empty".to_string(),
            ));
        }
        let expected = self.layout.bytes();
        let fits = if pad_allowed {
            width <= expected
        } else {
            width == expected
        };
        if !fits {
            return Err(HbstError::DescriptorWidth {
                expected,
                got: width,
            });
        }
        Ok(())
    }

    /// Build one descriptor from a raw row.
    ///
    /// With `pad_allowed`, rows shorter than the storage width are accepted and
    /// the missing high-order bits stay zero.
    pub fn build(&self, row: &[u8], pad_allowed: bool) -> Result<Descriptor, HbstError> {
        self.check_row_width(row.len(), pad_allowed)?;
        Ok(self.pack(row))
    }

    /// Build descriptors for a batch of rows.
    ///
    /// Every row is validated before any descriptor is built; all rows must
    /// share one width.
    pub fn build_rows<R>(&self, rows: &[R], pad_allowed: bool) -> Result<Vec<Descriptor>, HbstError>
    where
        R: AsRef<[u8]> + Sync,
    {
        let Some(width) = uniform_row_width(rows)? else {
            return Ok(Vec::new());
        };
        self.check_row_width(width, pad_allowed)?;

        Ok(rows.par_iter().map(|row| self.pack(row.as_ref())).collect())
    }

    fn pack(&self, row: &[u8]) -> Descriptor {
        let raw = self.layout.raw_bytes();
        let mut bytes = vec![0u8; self.layout.bytes()];

        let full = row.len().min(raw);
        bytes[..full].copy_from_slice(&row[..full]);

        // The overflow bits are the most significant bits of the trailing source
        // byte; they land in the low bits of the last storage byte.
        let overflow = self.layout.overflow_bits();
        if overflow > 0 {
            if let Some(&last) = row.get(raw) {
                bytes[raw] = last >> (8 - overflow);
            }
        }

        Descriptor {
            bits: self.layout.bits(),
            bytes: bytes.into_boxed_slice(),
        }
    }
}

/// Width shared by all rows, or `None` for an empty batch.
fn uniform_row_width<R: AsRef<[u8]>>(rows: &[R]) -> Result<Option<usize>, HbstError> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let width = first.as_ref().len();
    if let Some((idx, row)) = rows
        .iter()
        .enumerate()
        .find(|(_, row)| row.as_ref().len() != width)
    {
        return Err(HbstError::ShapeValidation(format!(
            "descriptor row {idx} has {} bytes, expected {width} like row 0",
            row.as_ref().len()
        )));
    }
    Ok(Some(width))
}
