//! Threshold conditions and the threshold classification policy.

use std::sync::Arc;

use itertools::Itertools;
use noodles_vcf as vcf;

use crate::seqvars::filter::engine::{Classification, FilterPolicy};
use crate::seqvars::filter::error::Error;
use crate::seqvars::filter::measure::{Measure, MeasureValue};

/// Comparison operator of a threshold predicate.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOp {
    /// Value must be at least the bound.
    AtLeast,
    /// Value must be at most the bound.
    AtMost,
    /// Value must be strictly greater than the bound.
    Greater,
    /// Value must be strictly less than the bound.
    Less,
}

/// A monotone boolean test over one measure value.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Clone, Copy, Debug)]
pub struct Threshold {
    /// Comparison operator.
    pub op: ThresholdOp,
    /// Bound compared against.
    pub value: f64,
}

impl Threshold {
    /// Whether `measured` passes the test; missing values always pass.
    pub fn passes(&self, measured: &MeasureValue) -> bool {
        match measured.as_f64() {
            None => true,
            Some(measured) => match self.op {
                ThresholdOp::AtLeast => measured >= self.value,
                ThresholdOp::AtMost => measured <= self.value,
                ThresholdOp::Greater => measured > self.value,
                ThresholdOp::Less => measured < self.value,
            },
        }
    }
}

/// A hard condition; failing it drops the call from the output.
#[derive(Debug, Clone)]
pub struct HardCondition {
    /// Measure the threshold applies to.
    pub measure: Arc<dyn Measure>,
    /// Threshold predicate.
    pub threshold: Threshold,
}

/// A soft condition; failing it annotates the call with `vcf_filter_key`.
#[derive(Debug, Clone)]
pub struct SoftCondition {
    /// Measure the threshold applies to.
    pub measure: Arc<dyn Measure>,
    /// Threshold predicate.
    pub threshold: Threshold,
    /// FILTER key written for calls failing the threshold.
    pub vcf_filter_key: String,
}

/// Check that a soft filter key can appear in a VCF FILTER column.
fn validate_filter_key(key: &str) -> Result<(), Error> {
    if key.is_empty() || key == "." || key == "0" {
        return Err(Error::Configuration(format!(
            "invalid soft filter key {:?}",
            key
        )));
    }
    if key == "PASS" {
        return Err(Error::Configuration(String::from(
            "soft filter key PASS is reserved",
        )));
    }
    if key.contains(';') || key.contains(char::is_whitespace) {
        return Err(Error::Configuration(format!(
            "soft filter key {:?} contains separator characters",
            key
        )));
    }
    Ok(())
}

/// Classification policy applying ordered hard and soft threshold conditions.
///
/// The measure vector handed to `classify` is laid out as all hard measures
/// followed by all soft measures, matching the order of `measures()`.
#[derive(Debug)]
pub struct ThresholdFilter {
    /// Measures of all conditions, hard before soft.
    measures: Vec<Arc<dyn Measure>>,
    /// Thresholds of the hard conditions.
    hard_thresholds: Vec<Threshold>,
    /// Thresholds of the soft conditions.
    soft_thresholds: Vec<Threshold>,
    /// FILTER keys, index-aligned with `soft_thresholds`.
    vcf_filter_keys: Vec<String>,
    /// Whether the declared keys are pairwise distinct.
    all_unique_filter_keys: bool,
}

impl ThresholdFilter {
    /// Create the policy, validating the soft filter keys eagerly.
    pub fn new(hard: Vec<HardCondition>, soft: Vec<SoftCondition>) -> Result<Self, Error> {
        for condition in &soft {
            validate_filter_key(&condition.vcf_filter_key)?;
        }
        let all_unique_filter_keys = soft.iter().map(|c| &c.vcf_filter_key).all_unique();

        let mut measures = Vec::with_capacity(hard.len() + soft.len());
        let mut hard_thresholds = Vec::with_capacity(hard.len());
        for condition in hard {
            measures.push(condition.measure);
            hard_thresholds.push(condition.threshold);
        }
        let mut soft_thresholds = Vec::with_capacity(soft.len());
        let mut vcf_filter_keys = Vec::with_capacity(soft.len());
        for condition in soft {
            measures.push(condition.measure);
            soft_thresholds.push(condition.threshold);
            vcf_filter_keys.push(condition.vcf_filter_key);
        }

        Ok(Self {
            measures,
            hard_thresholds,
            soft_thresholds,
            vcf_filter_keys,
            all_unique_filter_keys,
        })
    }

    /// Whether all hard conditions pass.
    fn passes_all_hard(&self, measures: &[MeasureValue]) -> bool {
        self.hard_thresholds
            .iter()
            .zip(measures)
            .all(|(threshold, measured)| threshold.passes(measured))
    }

    /// Whether all soft conditions pass.
    fn passes_all_soft(&self, measures: &[MeasureValue]) -> bool {
        self.soft_thresholds
            .iter()
            .zip(&measures[self.hard_thresholds.len()..])
            .all(|(threshold, measured)| threshold.passes(measured))
    }

    /// FILTER keys of the failing soft conditions.
    ///
    /// With duplicate declared keys the result is sorted-unique, otherwise
    /// declaration order.
    fn failing_filter_keys(&self, measures: &[MeasureValue]) -> Vec<String> {
        let soft_measures = &measures[self.hard_thresholds.len()..];
        let failing = self
            .soft_thresholds
            .iter()
            .zip(soft_measures)
            .zip(&self.vcf_filter_keys)
            .filter(|((threshold, measured), _)| !threshold.passes(measured))
            .map(|(_, key)| key.clone());
        if self.all_unique_filter_keys {
            failing.collect()
        } else {
            failing.sorted().dedup().collect()
        }
    }
}

impl FilterPolicy for ThresholdFilter {
    fn measures(&self) -> &[Arc<dyn Measure>] {
        &self.measures
    }

    fn classify(&self, measures: &[MeasureValue]) -> Classification {
        debug_assert_eq!(self.measures.len(), measures.len());
        if self.passes_all_hard(measures) {
            if self.passes_all_soft(measures) {
                Classification::Unfiltered
            } else {
                Classification::SoftFiltered {
                    reasons: self.failing_filter_keys(measures),
                }
            }
        } else {
            Classification::HardFiltered
        }
    }

    fn annotate_header(&self, header: &mut vcf::Header) {
        use vcf::header::record::value::{map::Filter, Map};

        for key in &self.vcf_filter_keys {
            header
                .filters_mut()
                .entry(key.clone())
                .or_insert_with(|| Map::<Filter>::new(format!("Failed {} threshold", key)));
        }
    }
}

#[cfg(test)]
mod test {
    use noodles_vcf as vcf;
    use pretty_assertions::assert_eq;

    use super::{HardCondition, SoftCondition, Threshold, ThresholdFilter, ThresholdOp};
    use crate::seqvars::filter::engine::{Classification, FilterPolicy};
    use crate::seqvars::filter::error::Error;
    use crate::seqvars::filter::measure::{make_measure, MeasureId, MeasureValue};

    fn hard(id: MeasureId, op: ThresholdOp, value: f64) -> HardCondition {
        HardCondition {
            measure: make_measure(id),
            threshold: Threshold { op, value },
        }
    }

    fn soft(id: MeasureId, op: ThresholdOp, value: f64, key: &str) -> SoftCondition {
        SoftCondition {
            measure: make_measure(id),
            threshold: Threshold { op, value },
            vcf_filter_key: key.to_string(),
        }
    }

    #[rstest::rstest]
    #[case(ThresholdOp::AtLeast, 10.0, MeasureValue::Int(10), true)]
    #[case(ThresholdOp::AtLeast, 10.0, MeasureValue::Float(9.9), false)]
    #[case(ThresholdOp::AtMost, 10.0, MeasureValue::Int(10), true)]
    #[case(ThresholdOp::AtMost, 10.0, MeasureValue::Int(11), false)]
    #[case(ThresholdOp::Greater, 10.0, MeasureValue::Int(10), false)]
    #[case(ThresholdOp::Greater, 10.0, MeasureValue::Float(10.1), true)]
    #[case(ThresholdOp::Less, 10.0, MeasureValue::Int(10), false)]
    #[case(ThresholdOp::Less, 10.0, MeasureValue::Int(9), true)]
    #[case(ThresholdOp::AtLeast, 10.0, MeasureValue::Missing, true)] // missing passes
    #[case(ThresholdOp::Less, 10.0, MeasureValue::Missing, true)] // missing passes
    fn threshold_passes(
        #[case] op: ThresholdOp,
        #[case] bound: f64,
        #[case] measured: MeasureValue,
        #[case] expected: bool,
    ) {
        let threshold = Threshold { op, value: bound };

        assert_eq!(expected, threshold.passes(&measured));
    }

    #[test]
    fn measures_are_hard_then_soft() -> Result<(), Error> {
        let filter = ThresholdFilter::new(
            vec![hard(MeasureId::Qual, ThresholdOp::AtLeast, 10.0)],
            vec![
                soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, "LowDepth"),
                soft(MeasureId::MappingQuality, ThresholdOp::AtLeast, 20.0, "LowMQ"),
            ],
        )?;

        let names = filter
            .measures()
            .iter()
            .map(|m| m.name().to_string())
            .collect::<Vec<_>>();

        assert_eq!(vec!["QUAL", "DP", "MQ"], names);

        Ok(())
    }

    #[test]
    fn classify_passes_when_all_conditions_pass() -> Result<(), Error> {
        let filter = ThresholdFilter::new(
            vec![hard(MeasureId::Qual, ThresholdOp::AtLeast, 10.0)],
            vec![soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, "LowDepth")],
        )?;

        let classification =
            filter.classify(&[MeasureValue::Float(50.0), MeasureValue::Int(30)]);

        assert_eq!(Classification::Unfiltered, classification);

        Ok(())
    }

    #[test]
    fn classify_hard_failure_wins_over_soft_failure() -> Result<(), Error> {
        let filter = ThresholdFilter::new(
            vec![hard(MeasureId::Qual, ThresholdOp::AtLeast, 10.0)],
            vec![soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, "LowDepth")],
        )?;

        // Both conditions fail; the hard one decides.
        let classification = filter.classify(&[MeasureValue::Float(5.0), MeasureValue::Int(2)]);

        assert_eq!(Classification::HardFiltered, classification);

        Ok(())
    }

    #[test]
    fn classify_collects_failing_keys_in_declaration_order() -> Result<(), Error> {
        let filter = ThresholdFilter::new(
            vec![],
            vec![
                soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, "LowDepth"),
                soft(MeasureId::MappingQuality, ThresholdOp::AtLeast, 20.0, "LowMQ"),
            ],
        )?;

        let classification = filter.classify(&[MeasureValue::Int(5), MeasureValue::Float(10.0)]);

        assert_eq!(
            Classification::SoftFiltered {
                reasons: vec![String::from("LowDepth"), String::from("LowMQ")],
            },
            classification
        );

        Ok(())
    }

    #[test]
    fn classify_deduplicates_ambiguous_keys_sorted_unique() -> Result<(), Error> {
        // The same key guards two conditions, so dedup kicks in and the
        // result is sorted.
        let filter = ThresholdFilter::new(
            vec![],
            vec![
                soft(MeasureId::MappingQuality, ThresholdOp::AtLeast, 20.0, "LowQuality"),
                soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, "Shallow"),
                soft(MeasureId::GenotypeQuality, ThresholdOp::AtLeast, 20.0, "LowQuality"),
            ],
        )?;

        let classification = filter.classify(&[
            MeasureValue::Float(5.0),
            MeasureValue::Int(2),
            MeasureValue::Int(3),
        ]);

        assert_eq!(
            Classification::SoftFiltered {
                reasons: vec![String::from("LowQuality"), String::from("Shallow")],
            },
            classification
        );

        Ok(())
    }

    #[test]
    fn classify_merges_duplicate_keys_into_one_reason() -> Result<(), Error> {
        let filter = ThresholdFilter::new(
            vec![],
            vec![
                soft(MeasureId::MappingQuality, ThresholdOp::AtLeast, 20.0, "LowQuality"),
                soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, "Shallow"),
                soft(MeasureId::GenotypeQuality, ThresholdOp::AtLeast, 20.0, "LowQuality"),
            ],
        )?;

        // Only the two LowQuality conditions fail.
        let classification = filter.classify(&[
            MeasureValue::Float(5.0),
            MeasureValue::Int(100),
            MeasureValue::Int(3),
        ]);

        assert_eq!(
            Classification::SoftFiltered {
                reasons: vec![String::from("LowQuality")],
            },
            classification
        );

        Ok(())
    }

    #[test]
    fn classify_missing_values_pass_all_conditions() -> Result<(), Error> {
        let filter = ThresholdFilter::new(
            vec![hard(MeasureId::Qual, ThresholdOp::AtLeast, 10.0)],
            vec![soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, "LowDepth")],
        )?;

        let classification =
            filter.classify(&[MeasureValue::Missing, MeasureValue::Missing]);

        assert_eq!(Classification::Unfiltered, classification);

        Ok(())
    }

    #[rstest::rstest]
    #[case("")]
    #[case(".")]
    #[case("0")]
    #[case("PASS")]
    #[case("Low;Depth")]
    #[case("Low Depth")]
    #[case("Low\tDepth")]
    fn new_rejects_invalid_filter_keys(#[case] key: &str) {
        let result = ThresholdFilter::new(
            vec![],
            vec![soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, key)],
        );

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn annotate_header_declares_each_key_once() -> Result<(), anyhow::Error> {
        let src = "\
##fileformat=VCFv4.3
##FILTER=<ID=PASS,Description=\"All filters passed\">
##FILTER=<ID=LowDepth,Description=\"Pre-existing declaration\">
##contig=<ID=1>
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO
";
        let mut reader = vcf::Reader::new(src.as_bytes());
        let mut header = reader.read_header()?;

        let filter = ThresholdFilter::new(
            vec![],
            vec![
                soft(MeasureId::Depth, ThresholdOp::AtLeast, 10.0, "LowDepth"),
                soft(MeasureId::MappingQuality, ThresholdOp::AtLeast, 20.0, "LowMQ"),
            ],
        )?;
        filter.annotate_header(&mut header);

        // PASS and the pre-existing LowDepth plus the new LowMQ.
        assert_eq!(3, header.filters().len());
        assert!(header.filters().contains_key("LowDepth"));
        assert!(header.filters().contains_key("LowMQ"));

        Ok(())
    }

    #[rstest::rstest]
    #[case("\"at_least\"", ThresholdOp::AtLeast)]
    #[case("\"at_most\"", ThresholdOp::AtMost)]
    #[case("\"greater\"", ThresholdOp::Greater)]
    #[case("\"less\"", ThresholdOp::Less)]
    fn threshold_op_serde_forms(
        #[case] json: &str,
        #[case] op: ThresholdOp,
    ) -> Result<(), anyhow::Error> {
        assert_eq!(op, serde_json::from_str::<ThresholdOp>(json)?);
        assert_eq!(json, serde_json::to_string(&op)?);

        Ok(())
    }
}
