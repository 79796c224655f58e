//! Ordered value-filter pipeline applied to decoded sensor readings.
//!
//! Filters are written in config/descriptors as single-key maps, e.g.
//! `- multiply: 0.1`. A `filter_out*` hit drops the value, which suppresses
//! the entity's publication for that cycle.

use serde::de::{self, Deserializer, MapAccess};
use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterOp {
    Offset(f64),
    Round(i32),
    Multiply(f64),
    FilterOut(f64),
    FilterOutGreater(f64),
    FilterOutLower(f64),
}

impl FilterOp {
    pub fn apply(self, value: f64) -> Option<f64> {
        match self {
            FilterOp::Offset(k) => Some(value + k),
            FilterOp::Round(n) => {
                let factor = 10f64.powi(n);
                Some((value * factor).round() / factor)
            }
            FilterOp::Multiply(k) => Some(value * k),
            FilterOp::FilterOut(k) => (value != k).then_some(value),
            FilterOp::FilterOutGreater(k) => (value <= k).then_some(value),
            FilterOp::FilterOutLower(k) => (value >= k).then_some(value),
        }
    }
}

/// Run the pipeline left to right; `None` means the value was dropped.
pub fn apply_filters(value: f64, filters: &[FilterOp]) -> Option<f64> {
    filters
        .iter()
        .try_fold(value, |value, filter| filter.apply(value))
}

impl<'de> Deserialize<'de> for FilterOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl<'de> de::Visitor<'de> for Visitor {
            type Value = FilterOp;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a single-key map like {multiply: 0.1}")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<FilterOp, A::Error> {
                let Some((key, value)) = map.next_entry::<String, f64>()? else {
                    return Err(de::Error::custom("empty filter"));
                };
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("filter must have exactly one key"));
                }
                Ok(match key.as_str() {
                    "offset" => FilterOp::Offset(value),
                    "round" => FilterOp::Round(value as i32),
                    "multiply" => FilterOp::Multiply(value),
                    "filter_out" => FilterOp::FilterOut(value),
                    "filter_out_greater" => FilterOp::FilterOutGreater(value),
                    "filter_out_lower" => FilterOp::FilterOutLower(value),
                    other => {
                        return Err(de::Error::custom(format!(
                            "filter {other} doesn't exist"
                        )))
                    }
                })
            }
        }
        deserializer.deserialize_map(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_applies_in_order() {
        let filters = [FilterOp::Multiply(0.1), FilterOp::Round(1)];
        assert_eq!(apply_filters(50.0, &filters), Some(5.0));
        let filters = [FilterOp::Offset(2.0), FilterOp::Multiply(3.0)];
        assert_eq!(apply_filters(1.0, &filters), Some(9.0));
    }

    #[test]
    fn filter_out_drops_values() {
        assert_eq!(apply_filters(0.0, &[FilterOp::FilterOut(0.0)]), None);
        assert_eq!(
            apply_filters(101.0, &[FilterOp::FilterOutGreater(100.0)]),
            None
        );
        assert_eq!(apply_filters(-1.0, &[FilterOp::FilterOutLower(0.0)]), None);
        assert_eq!(
            apply_filters(50.0, &[FilterOp::FilterOutGreater(100.0)]),
            Some(50.0)
        );
    }

    #[test]
    fn deserializes_from_single_key_maps() {
        let filters: Vec<FilterOp> =
            serde_yaml::from_str("- multiply: 0.1\n- round: 1\n- filter_out: 0\n").unwrap();
        assert_eq!(
            filters,
            vec![
                FilterOp::Multiply(0.1),
                FilterOp::Round(1),
                FilterOp::FilterOut(0.0)
            ]
        );
        assert!(serde_yaml::from_str::<Vec<FilterOp>>("- unknown: 1\n").is_err());
    }
}
