use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionKind {
    Int4,
    Int8,
    Half,
    #[default]
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
    I8,
    U8,
    QInt4,
    Other(String),
}

impl PrecisionKind {
    pub const ALL: [PrecisionKind; 4] = [
        PrecisionKind::Int4,
        PrecisionKind::Int8,
        PrecisionKind::Half,
        PrecisionKind::Full,
    ];

    pub fn bits(self) -> u64 {
        match self {
            PrecisionKind::Full => 32,
            PrecisionKind::Half => 16,
            PrecisionKind::Int8 => 8,
            PrecisionKind::Int4 => 4,
        }
    }

    pub fn bytes_per_element(self) -> f64 {
        self.bits() as f64 / 8.0
    }

    pub fn footprint(self, elements: u64) -> u64 {
        elements.saturating_mul(self.bits()).div_ceil(8)
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            32 => Some(PrecisionKind::Full),
            16 => Some(PrecisionKind::Half),
            8 => Some(PrecisionKind::Int8),
            4 => Some(PrecisionKind::Int4),
            _ => None,
        }
    }

    /// Tags are checked widest first, so `"F32"` never reads as 4-bit and
    /// `"F8_E4M3"` reads as 8-bit. Names with no tag are full precision.
    pub fn infer_from_name(name: &str) -> Self {
        const TAGS: [(&str, PrecisionKind); 4] = [
            ("32", PrecisionKind::Full),
            ("16", PrecisionKind::Half),
            ("8", PrecisionKind::Int8),
            ("4", PrecisionKind::Int4),
        ];
        TAGS.iter()
            .find(|(tag, _)| name.contains(tag))
            .map(|(_, kind)| *kind)
            .unwrap_or(PrecisionKind::Full)
    }

    pub fn from_dtype(dtype: &DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(PrecisionKind::Full),
            DType::F16 | DType::BF16 => Some(PrecisionKind::Half),
            DType::I8 | DType::U8 => Some(PrecisionKind::Int8),
            DType::QInt4 => Some(PrecisionKind::Int4),
            DType::Other(_) => None,
        }
    }
}

impl fmt::Display for PrecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PrecisionKind::Full => "32-bit float",
            PrecisionKind::Half => "16-bit float",
            PrecisionKind::Int8 => "8-bit integer",
            PrecisionKind::Int4 => "4-bit integer",
        };
        f.write_str(label)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => f.write_str("f32"),
            DType::F16 => f.write_str("f16"),
            DType::BF16 => f.write_str("bf16"),
            DType::I8 => f.write_str("i8"),
            DType::U8 => f.write_str("u8"),
            DType::QInt4 => f.write_str("qint4"),
            DType::Other(name) => f.write_str(name),
        }
    }
}

pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn as_gib(bytes: u64) -> f64 {
    bytes as f64 / GIB
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn byte_costs_match_widths() {
        assert_eq!(PrecisionKind::Full.bytes_per_element(), 4.0);
        assert_eq!(PrecisionKind::Half.bytes_per_element(), 2.0);
        assert_eq!(PrecisionKind::Int8.bytes_per_element(), 1.0);
        assert_eq!(PrecisionKind::Int4.bytes_per_element(), 0.5);
    }

    #[test]
    fn byte_costs_are_monotonic() {
        let costs: Vec<f64> = PrecisionKind::ALL
            .iter()
            .map(|kind| kind.bytes_per_element())
            .collect();
        assert!(costs.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn untagged_names_default_to_full_precision() {
        assert_eq!(PrecisionKind::infer_from_name("layer.weight"), PrecisionKind::Full);
        assert_eq!(PrecisionKind::infer_from_name("BOOL"), PrecisionKind::Full);
    }

    #[test]
    fn tagged_names_resolve() {
        assert_eq!(
            PrecisionKind::infer_from_name("layer.weight.int8"),
            PrecisionKind::Int8
        );
        assert_eq!(PrecisionKind::infer_from_name("BF16"), PrecisionKind::Half);
        assert_eq!(PrecisionKind::infer_from_name("F32"), PrecisionKind::Full);
        assert_eq!(PrecisionKind::infer_from_name("F8_E4M3"), PrecisionKind::Int8);
        assert_eq!(PrecisionKind::infer_from_name("q4_0"), PrecisionKind::Int4);
    }

    #[test]
    fn odd_element_counts_round_up_at_four_bits() {
        assert_eq!(PrecisionKind::Int4.footprint(3), 2);
        assert_eq!(PrecisionKind::Int4.footprint(4), 2);
        assert_eq!(PrecisionKind::Full.footprint(0), 0);
    }

    #[test]
    fn bits_round_trip_through_config_values() {
        for kind in PrecisionKind::ALL {
            assert_eq!(PrecisionKind::from_bits(kind.bits() as u32), Some(kind));
        }
        assert_eq!(PrecisionKind::from_bits(12), None);
    }

    #[test]
    fn unrecognized_dtype_has_no_precision() {
        assert_eq!(PrecisionKind::from_dtype(&DType::Other("f64".into())), None);
        assert_eq!(PrecisionKind::from_dtype(&DType::BF16), Some(PrecisionKind::Half));
    }

    proptest! {
        #[test]
        fn inference_is_deterministic(name in "[a-zA-Z0-9._]{0,24}") {
            prop_assert_eq!(
                PrecisionKind::infer_from_name(&name),
                PrecisionKind::infer_from_name(&name)
            );
        }

        #[test]
        fn digit_free_names_are_full_precision(name in "[a-zA-Z._]{0,24}") {
            prop_assert_eq!(PrecisionKind::infer_from_name(&name), PrecisionKind::Full);
        }

        #[test]
        fn footprint_never_shrinks_with_width(elements in 0u64..1_000_000_000_000) {
            let sizes: Vec<u64> = PrecisionKind::ALL
                .iter()
                .map(|kind| kind.footprint(elements))
                .collect();
            prop_assert!(sizes.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }
}
