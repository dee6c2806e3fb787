use serde::{Deserialize, Serialize};
use std::fmt;

/// Distance reported for digests that cannot be compared (different widths,
/// or a known digest against a failed one). Never within any threshold.
pub const MISMATCHED_WIDTH_DISTANCE: u32 = u32::MAX;

const UNKNOWN: &str = "unknown";

/// Perceptual digest of an image, as produced by the analysis stage.
///
/// Parsed from a hex string; the declared bit width is four bits per hex
/// digit. Anything that is not valid hex, including `null`, is treated as a
/// failed hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum PerceptualHash {
    Known { bytes: Vec<u8>, width: u32 },
    #[default]
    Unknown,
}

impl PerceptualHash {
    pub fn from_hex(hex: &str) -> Self {
        let digits = hex.trim();
        if digits.is_empty() || digits.eq_ignore_ascii_case(UNKNOWN) {
            return PerceptualHash::Unknown;
        }

        let mut nibbles = Vec::with_capacity(digits.len() + 1);
        for c in digits.chars() {
            match c.to_digit(16) {
                Some(n) => nibbles.push(n as u8),
                None => return PerceptualHash::Unknown,
            }
        }

        let width = (nibbles.len() * 4) as u32;
        // Left-pad odd digit counts so the bytes stay big-endian aligned.
        if nibbles.len() % 2 == 1 {
            nibbles.insert(0, 0);
        }
        let bytes = nibbles
            .chunks(2)
            .map(|pair| (pair[0] << 4) | pair[1])
            .collect();

        PerceptualHash::Known { bytes, width }
    }

    /// Build a digest from an integer value with an explicit bit width.
    /// Bits above `width` are discarded.
    pub fn from_u64(value: u64, width: u32) -> Self {
        let width = width.min(64);
        let digits = width.div_ceil(4) as usize;
        let masked = if width == 64 {
            value
        } else {
            value & ((1u64 << width) - 1)
        };
        if digits == 0 {
            return PerceptualHash::Unknown;
        }
        let mut hash = Self::from_hex(&format!("{:0digits$x}", masked, digits = digits));
        if let PerceptualHash::Known { width: w, .. } = &mut hash {
            *w = width;
        }
        hash
    }

    pub fn is_known(&self) -> bool {
        matches!(self, PerceptualHash::Known { .. })
    }

    pub fn width(&self) -> Option<u32> {
        match self {
            PerceptualHash::Known { width, .. } => Some(*width),
            PerceptualHash::Unknown => None,
        }
    }

    /// Big-endian expansion of the digest to its declared width. A width
    /// wider than the stored bytes yields every stored bit.
    pub fn to_bit_vector(&self) -> Option<Vec<bool>> {
        let PerceptualHash::Known { bytes, width } = self else {
            return None;
        };
        let total = bytes.len() * 8;
        let skip = total.saturating_sub(*width as usize);
        let bits = bytes
            .iter()
            .flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1 == 1))
            .skip(skip)
            .collect();
        Some(bits)
    }

    /// Number of differing bits, or `MISMATCHED_WIDTH_DISTANCE` when the two
    /// digests do not share a width. Two failed digests compare as
    /// mismatched here; callers that collapse failed hashes handle that
    /// case themselves.
    pub fn hamming_distance(&self, other: &PerceptualHash) -> u32 {
        match (self, other) {
            (
                PerceptualHash::Known { bytes: a, width: wa },
                PerceptualHash::Known { bytes: b, width: wb },
            ) if wa == wb => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x ^ y).count_ones())
                .sum(),
            _ => MISMATCHED_WIDTH_DISTANCE,
        }
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerceptualHash::Known { bytes, width } => {
                let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                let digits = (*width as usize).div_ceil(4).min(hex.len());
                write!(f, "{}", &hex[hex.len() - digits..])
            }
            PerceptualHash::Unknown => write!(f, "{}", UNKNOWN),
        }
    }
}

impl From<String> for PerceptualHash {
    fn from(s: String) -> Self {
        PerceptualHash::from_hex(&s)
    }
}

impl From<Option<String>> for PerceptualHash {
    fn from(s: Option<String>) -> Self {
        s.map_or(PerceptualHash::Unknown, PerceptualHash::from)
    }
}

impl From<&str> for PerceptualHash {
    fn from(s: &str) -> Self {
        PerceptualHash::from_hex(s)
    }
}

impl From<PerceptualHash> for String {
    fn from(hash: PerceptualHash) -> Self {
        hash.to_string()
    }
}
