//! Measures: per-call statistics feeding the threshold decisions.

use std::sync::Arc;

use noodles_vcf as vcf;
use strum_macros::{Display, EnumIter};

use crate::seqvars::filter::block::call_position;
use crate::seqvars::filter::error::Error;
use crate::seqvars::filter::facet::{self, FacetMap, Samples};

/// Result of evaluating one measure on one call.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasureValue {
    /// Integer-valued result.
    Int(i64),
    /// Float-valued result.
    Float(f64),
    /// Boolean-valued result.
    Bool(bool),
    /// The underlying fields are absent from the call.
    Missing,
}

impl MeasureValue {
    /// Numeric view used by threshold predicates.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MeasureValue::Int(value) => Some(*value as f64),
            MeasureValue::Float(value) => Some(*value),
            MeasureValue::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            MeasureValue::Missing => None,
        }
    }

    /// Text form used for INFO annotation, `.` when missing.
    pub fn to_field(&self) -> String {
        match self {
            MeasureValue::Int(value) => value.to_string(),
            MeasureValue::Float(value) => value.to_string(),
            MeasureValue::Bool(value) => String::from(if *value { "1" } else { "0" }),
            MeasureValue::Missing => String::from("."),
        }
    }
}

/// A named statistic computed from a call and the facets of its block.
///
/// Implementations must be pure: for the same call and facets they return
/// the same value, and they never mutate shared evidence.
pub trait Measure: std::fmt::Debug + Send + Sync {
    /// Name of the measure; doubles as the INFO key used for annotation.
    fn name(&self) -> &str;

    /// Names of the facets this measure needs.
    fn requirements(&self) -> &[&'static str] {
        &[]
    }

    /// Evaluate the measure on one call.
    fn evaluate(&self, call: &vcf::Record, facets: &FacetMap) -> Result<MeasureValue, Error>;

    /// Serialize an evaluation result for annotation.
    fn serialize(&self, value: &MeasureValue) -> String {
        value.to_field()
    }
}

/// Identifiers of the built-in measures.
#[derive(
    serde::Serialize,
    serde::Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Debug,
    Hash,
    Display,
    EnumIter,
)]
pub enum MeasureId {
    /// Variant quality from the QUAL column.
    #[serde(rename = "QUAL")]
    #[strum(serialize = "QUAL")]
    Qual,
    /// Total read depth at the site, INFO `DP`.
    #[serde(rename = "DP")]
    #[strum(serialize = "DP")]
    Depth,
    /// RMS mapping quality of the reads at the site, INFO `MQ`.
    #[serde(rename = "MQ")]
    #[strum(serialize = "MQ")]
    MappingQuality,
    /// Number of reads with mapping quality zero, INFO `MQ0`.
    #[serde(rename = "MQ0")]
    #[strum(serialize = "MQ0")]
    MappingQualityZero,
    /// Minimum genotype quality over all samples, FORMAT `GQ`.
    #[serde(rename = "GQ")]
    #[strum(serialize = "GQ")]
    GenotypeQuality,
}

/// Construct the built-in measure for `id`.
pub fn make_measure(id: MeasureId) -> Arc<dyn Measure> {
    match id {
        MeasureId::Qual => Arc::new(Quality),
        MeasureId::Depth => Arc::new(Depth),
        MeasureId::MappingQuality => Arc::new(MappingQuality),
        MeasureId::MappingQualityZero => Arc::new(MappingQualityZero),
        MeasureId::GenotypeQuality => Arc::new(GenotypeQuality),
    }
}

/// Read a numeric INFO field, tolerating Integer and Float encodings.
fn info_value(call: &vcf::Record, name: &str) -> Result<MeasureValue, Error> {
    use vcf::record::info::field::{Key, Value};

    let key = name
        .parse::<Key>()
        .map_err(|e| Error::Configuration(format!("invalid INFO key {:?}: {}", name, e)))?;
    match call.info().get(&key) {
        Some(Some(Value::Integer(value))) => Ok(MeasureValue::Int(i64::from(*value))),
        Some(Some(Value::Float(value))) => Ok(MeasureValue::Float(f64::from(*value))),
        Some(Some(value)) => Err(Error::MeasureEvaluation {
            name: name.to_string(),
            position: call_position(call),
            reason: format!("INFO {} has non-numeric value {:?}", name, value),
        }),
        Some(None) | None => Ok(MeasureValue::Missing),
    }
}

/// The record's QUAL column.
#[derive(Debug, Clone)]
pub struct Quality;

impl Measure for Quality {
    fn name(&self) -> &str {
        "QUAL"
    }

    fn evaluate(&self, call: &vcf::Record, _facets: &FacetMap) -> Result<MeasureValue, Error> {
        Ok(match call.quality_score() {
            Some(score) => MeasureValue::Float(f64::from(f32::from(score))),
            None => MeasureValue::Missing,
        })
    }
}

/// Total read depth at the site, INFO `DP`.
#[derive(Debug, Clone)]
pub struct Depth;

impl Measure for Depth {
    fn name(&self) -> &str {
        "DP"
    }

    fn evaluate(&self, call: &vcf::Record, _facets: &FacetMap) -> Result<MeasureValue, Error> {
        info_value(call, self.name())
    }
}

/// RMS mapping quality of the reads at the site, INFO `MQ`.
#[derive(Debug, Clone)]
pub struct MappingQuality;

impl Measure for MappingQuality {
    fn name(&self) -> &str {
        "MQ"
    }

    fn evaluate(&self, call: &vcf::Record, _facets: &FacetMap) -> Result<MeasureValue, Error> {
        info_value(call, self.name())
    }
}

/// Number of reads with mapping quality zero, INFO `MQ0`.
#[derive(Debug, Clone)]
pub struct MappingQualityZero;

impl Measure for MappingQualityZero {
    fn name(&self) -> &str {
        "MQ0"
    }

    fn evaluate(&self, call: &vcf::Record, _facets: &FacetMap) -> Result<MeasureValue, Error> {
        info_value(call, self.name())
    }
}

/// Minimum genotype quality over the calling samples, FORMAT `GQ`.
#[derive(Debug, Clone)]
pub struct GenotypeQuality;

impl Measure for GenotypeQuality {
    fn name(&self) -> &str {
        "GQ"
    }

    fn requirements(&self) -> &[&'static str] {
        &[Samples::NAME]
    }

    fn evaluate(&self, call: &vcf::Record, facets: &FacetMap) -> Result<MeasureValue, Error> {
        use vcf::record::genotypes::{keys::key, sample::Value};

        let samples = facet::get_facet::<Samples>(facets, Samples::NAME)?;
        let mut minimum: Option<i64> = None;
        for (name, sample) in samples.names().iter().zip(call.genotypes().values()) {
            let quality = match sample.get(&key::CONDITIONAL_GENOTYPE_QUALITY) {
                Some(Some(Value::Integer(quality))) => Some(i64::from(*quality)),
                Some(Some(value)) => {
                    return Err(Error::MeasureEvaluation {
                        name: self.name().to_string(),
                        position: call_position(call),
                        reason: format!("sample {} has non-integer GQ value {:?}", name, value),
                    })
                }
                _ => None,
            };
            if let Some(quality) = quality {
                minimum = Some(match minimum {
                    None => quality,
                    Some(current) => current.min(quality),
                });
            }
        }
        Ok(match minimum {
            Some(minimum) => MeasureValue::Int(minimum),
            None => MeasureValue::Missing,
        })
    }
}
