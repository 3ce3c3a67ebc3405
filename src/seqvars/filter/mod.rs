//! Implementation of the `seqvars filter` subcommand.

pub mod block;
pub mod engine;
pub mod error;
pub mod facet;
pub mod header;
pub mod measure;
pub mod threshold;

use noodles_vcf as vcf;
use thousands::Separable;

use crate::common::{self, io::open_read_maybe_gz};
use crate::seqvars::filter::engine::{ConcurrencyPolicy, OutputOptions, VariantCallFilter};
use crate::seqvars::filter::facet::FacetFactory;
use crate::seqvars::filter::measure::{make_measure, MeasureId};
use crate::seqvars::filter::threshold::{
    HardCondition, SoftCondition, Threshold, ThresholdFilter, ThresholdOp,
};

/// One hard threshold condition in the filter parameters.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
struct ConditionParams {
    /// Measure the condition applies to.
    pub measure: MeasureId,
    /// Comparison operator.
    pub op: ThresholdOp,
    /// Bound compared against.
    pub value: f64,
}

/// One soft threshold condition in the filter parameters.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
struct SoftConditionParams {
    /// Measure the condition applies to.
    pub measure: MeasureId,
    /// Comparison operator.
    pub op: ThresholdOp,
    /// Bound compared against.
    pub value: f64,
    /// FILTER key written for failing calls.
    pub key: String,
}

/// Parameters for the `seqvars filter` subcommand.
#[derive(Debug, Clone, PartialEq, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
struct FilterParams {
    /// Hard conditions; failing calls are dropped from the output.
    pub hard: Vec<ConditionParams>,
    /// Soft conditions; failing calls are annotated with their keys.
    pub soft: Vec<SoftConditionParams>,
    /// Output shaping options.
    pub output: OutputOptions,
}

/// Command line arguments for `seqvars filter` subcommand.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "filter a variant call VCF", long_about = None)]
pub struct Args {
    /// Path to input file.
    #[clap(long)]
    pub path_in: String,
    /// Path to output file.
    #[clap(long)]
    pub path_out: String,
    /// Filter parameters as JSON or @ with path to JSON file.
    #[clap(long)]
    pub params: String,
    /// Maximal number of worker threads; 0 or 1 disable the worker pool.
    #[clap(long)]
    pub max_threads: Option<usize>,
}

/// Load filter params from a string or a file with such a string.
fn load_params(param: &str) -> Result<FilterParams, anyhow::Error> {
    let json = if param.starts_with("@") {
        let path = param.trim_start_matches("@");
        std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read filter params file: {}", e))?
    } else {
        param.to_string()
    };
    serde_json::from_str(&json).map_err(|e| anyhow::anyhow!("failed to parse filter params: {}", e))
}

/// Construct the classification policy from the parameters.
fn build_policy(params: &FilterParams) -> Result<ThresholdFilter, anyhow::Error> {
    let hard = params
        .hard
        .iter()
        .map(|condition| HardCondition {
            measure: make_measure(condition.measure),
            threshold: Threshold {
                op: condition.op,
                value: condition.value,
            },
        })
        .collect::<Vec<_>>();
    let soft = params
        .soft
        .iter()
        .map(|condition| SoftCondition {
            measure: make_measure(condition.measure),
            threshold: Threshold {
                op: condition.op,
                value: condition.value,
            },
            vcf_filter_key: condition.key.clone(),
        })
        .collect::<Vec<_>>();
    ThresholdFilter::new(hard, soft).map_err(|e| anyhow::anyhow!("invalid filter params: {}", e))
}

/// Main entry point for `seqvars filter` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = std::time::Instant::now();
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    tracing::info!("loading filter params...");
    let params = load_params(&args.params)?;
    tracing::info!("opening input file...");
    let reader = open_read_maybe_gz(&args.path_in)
        .map_err(|e| anyhow::anyhow!("could not open input file: {}", e))?;
    let mut reader = vcf::Reader::new(reader);
    let header = reader
        .read_header()
        .map_err(|e| anyhow::anyhow!("problem reading header: {}", e))?;

    tracing::info!("building filter...");
    let filter = VariantCallFilter::new(
        build_policy(&params)?,
        FacetFactory::new(&header),
        params.output,
        ConcurrencyPolicy {
            max_threads: args.max_threads,
        },
    )
    .map_err(|e| anyhow::anyhow!("could not build filter: {}", e))?;

    tracing::info!("opening output file...");
    let mut writer = vcf::Writer::new(common::io::open_write_maybe_gz(&args.path_out).map_err(
        |e| anyhow::anyhow!("could not open output file {}: {}", &args.path_out, e),
    )?);

    common::trace_rss_now();

    tracing::info!("starting filtration...");
    let start = std::time::Instant::now();
    let stats = filter
        .filter(&header, reader.records(&header), &mut writer)
        .map_err(|e| anyhow::anyhow!("filtration failed: {}", e))?;
    tracing::info!(
        "... filtered {} calls in {:?} (passed: {}, soft-filtered: {}, hard-filtered: {})",
        stats.total.separate_with_commas(),
        start.elapsed(),
        stats.passed.separate_with_commas(),
        stats.soft_filtered.separate_with_commas(),
        stats.hard_filtered.separate_with_commas()
    );

    tracing::info!(
        "All of `seqvars filter` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    static PARAMS_JSON: &str = r#"{
        "hard": [{"measure": "QUAL", "op": "at_least", "value": 10.0}],
        "soft": [{"measure": "DP", "op": "at_least", "value": 10.0, "key": "LowDepth"}]
    }"#;

    #[test]
    fn load_params_from_string() -> Result<(), anyhow::Error> {
        let params = super::load_params(PARAMS_JSON)?;

        insta::assert_debug_snapshot!(params, @r###"
        FilterParams {
            hard: [
                ConditionParams {
                    measure: Qual,
                    op: AtLeast,
                    value: 10.0,
                },
            ],
            soft: [
                SoftConditionParams {
                    measure: Depth,
                    op: AtLeast,
                    value: 10.0,
                    key: "LowDepth",
                },
            ],
            output: OutputOptions {
                emit_sites_only: false,
                clear_existing_filters: true,
                annotate_measures: false,
                clear_info: false,
            },
        }
        "###);

        Ok(())
    }

    #[test]
    fn load_params_from_file() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();

        let params_file = tmpdir.to_path_buf().join("params.json");
        std::fs::write(&params_file, PARAMS_JSON)?;

        let from_file = super::load_params(&format!("@{}", params_file.to_str().unwrap()))?;

        assert_eq!(super::load_params(PARAMS_JSON)?, from_file);

        Ok(())
    }

    #[test]
    fn load_params_rejects_invalid_json() {
        assert!(super::load_params("{invalid").is_err());
    }

    #[test]
    fn run_with_inline_params() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();

        let args = super::Args {
            path_in: "tests/data/seqvars/filter/example.vcf".into(),
            path_out: format!("{}/out.vcf", tmpdir.to_path_buf().to_str().unwrap()),
            params: PARAMS_JSON.into(),
            max_threads: Some(0),
        };

        super::run(&crate::common::Args::default(), &args)?;

        let output = std::fs::read_to_string(&args.path_out)?;
        let records = output
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                "1\t200\t.\tG\tT\t50\tLowDepth\tDP=5;MQ=50\tGT:GQ\t0|1:40",
                "1\t300\t.\tT\tA\t50\tPASS\tDP=20;MQ=50\tGT:GQ\t0|1:40",
            ],
            records
        );

        Ok(())
    }

    #[test]
    fn run_with_params_file_and_gzip_output() -> Result<(), anyhow::Error> {
        use std::io::Read;

        let tmpdir = temp_testdir::TempDir::default();

        let params_file = tmpdir.to_path_buf().join("params.json");
        std::fs::write(&params_file, PARAMS_JSON)?;

        let args = super::Args {
            path_in: "tests/data/seqvars/filter/example.vcf".into(),
            path_out: format!("{}/out.vcf.gz", tmpdir.to_path_buf().to_str().unwrap()),
            params: format!("@{}", params_file.to_str().unwrap()),
            max_threads: Some(0),
        };

        super::run(&crate::common::Args::default(), &args)?;

        let mut output = String::new();
        crate::common::io::open_read_maybe_gz(&args.path_out)?.read_to_string(&mut output)?;
        assert!(output.contains("##FILTER=<ID=LowDepth"));
        assert!(output.contains("\tPASS\t"));

        Ok(())
    }
}
