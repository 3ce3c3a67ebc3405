//! The filtering engine: block scheduling, classification, and output.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexSet;
use itertools::Itertools;
use noodles_vcf as vcf;
use rayon::prelude::*;
use thousands::Separable;

use crate::seqvars::filter::block::{call_position, BlockReader, CallBlock};
use crate::seqvars::filter::error::Error;
use crate::seqvars::filter::facet::{FacetFactory, FacetMap};
use crate::seqvars::filter::header::make_output_header;
use crate::seqvars::filter::measure::{Measure, MeasureValue};

/// Worker count to fall back to when hardware parallelism cannot be probed.
const DEFAULT_POOL_SIZE: usize = 8;
/// Number of blocks buffered per worker in one scheduling wave.
const BLOCKS_PER_WORKER: usize = 100;
/// Upper bound on the blocks buffered in one scheduling wave.
const MAX_BUFFERED_BLOCKS: usize = 10_000;

/// Terminal decision for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// All conditions passed; the call is written with `PASS`.
    Unfiltered,
    /// At least one soft condition failed; the call is written with the
    /// failing filter keys.
    SoftFiltered {
        /// Deduplicated FILTER keys of the failing soft conditions.
        reasons: Vec<String>,
    },
    /// At least one hard condition failed; the call is dropped.
    HardFiltered,
}

/// Decides how calls are classified from their measure vectors.
pub trait FilterPolicy {
    /// The active measures; their order defines the measure vector layout.
    fn measures(&self) -> &[Arc<dyn Measure>];

    /// Classify one call given its full measure vector.
    fn classify(&self, measures: &[MeasureValue]) -> Classification;

    /// Declare the FILTER keys this policy may emit.
    fn annotate_header(&self, header: &mut vcf::Header);
}

/// Options controlling the emitted header and records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Drop all per-sample columns from the output.
    pub emit_sites_only: bool,
    /// Clear FILTER entries carried over from the input.
    pub clear_existing_filters: bool,
    /// Mirror each measure value into an INFO field of the emitted records.
    pub annotate_measures: bool,
    /// Clear INFO fields carried over from the input.
    pub clear_info: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            emit_sites_only: false,
            clear_existing_filters: true,
            annotate_measures: false,
            clear_info: false,
        }
    }
}

/// Concurrency configuration of the engine.
///
/// `max_threads` of 0 or 1 disables the worker pool, `None` uses the
/// available hardware parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConcurrencyPolicy {
    /// Maximal number of worker threads.
    pub max_threads: Option<usize>,
}

/// Outcome counts of one filtering run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Number of calls read.
    pub total: usize,
    /// Calls written with `PASS`.
    pub passed: usize,
    /// Calls written with at least one FILTER key.
    pub soft_filtered: usize,
    /// Calls dropped from the output.
    pub hard_filtered: usize,
}

impl FilterStats {
    /// Record one classification outcome.
    fn tally(&mut self, classification: &Classification) {
        self.total += 1;
        match classification {
            Classification::Unfiltered => self.passed += 1,
            Classification::SoftFiltered { .. } => self.soft_filtered += 1,
            Classification::HardFiltered => self.hard_filtered += 1,
        }
    }
}

/// Sorted-unique union of the facet names required by `measures`.
fn resolve_requirements(measures: &[Arc<dyn Measure>]) -> Vec<String> {
    measures
        .iter()
        .flat_map(|measure| measure.requirements().iter().map(|name| name.to_string()))
        .sorted()
        .dedup()
        .collect()
}

/// Number of workers to run under `concurrency`, 0 meaning serial.
fn pool_size(concurrency: &ConcurrencyPolicy) -> usize {
    let num_cores = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(0);
    match concurrency.max_threads {
        Some(max_threads) if max_threads > 1 => {
            if num_cores > 0 {
                max_threads.min(num_cores)
            } else {
                max_threads
            }
        }
        Some(_) => 0,
        None => {
            if num_cores > 0 {
                num_cores
            } else {
                DEFAULT_POOL_SIZE
            }
        }
    }
}

/// Number of blocks one scheduling wave may buffer.
fn max_buffered_blocks(worker_count: usize) -> usize {
    (BLOCKS_PER_WORKER * worker_count).min(MAX_BUFFERED_BLOCKS)
}

/// Log a progress line roughly once per minute.
fn log_progress(stats: &FilterStats, block: &CallBlock, prev: &mut Instant) {
    if prev.elapsed().as_secs() >= 60 {
        if let Some(region) = block.region() {
            tracing::info!(
                "processed {} calls, at {}",
                stats.total.separate_with_commas(),
                region
            );
        }
        *prev = Instant::now();
    }
}

/// Filters a stream of calls block by block against a classification policy.
///
/// Blocks are classified independently and written back in input order, so
/// the output is the same regardless of the worker pool size.
pub struct VariantCallFilter<P> {
    /// Policy deciding the fate of each call.
    policy: P,
    /// Factory for the facets the measures request.
    facet_factory: FacetFactory,
    /// Output shaping options.
    output: OutputOptions,
    /// Facet names required by the active measures, sorted-unique.
    facet_names: Vec<String>,
    /// Worker pool, `None` for serial operation.
    workers: Option<rayon::ThreadPool>,
}

impl<P> VariantCallFilter<P>
where
    P: FilterPolicy + Send + Sync,
{
    /// Create the filter, validating facet requirements and building the
    /// worker pool eagerly.
    pub fn new(
        policy: P,
        facet_factory: FacetFactory,
        output: OutputOptions,
        concurrency: ConcurrencyPolicy,
    ) -> Result<Self, Error> {
        let facet_names = resolve_requirements(policy.measures());
        for name in &facet_names {
            if !facet_factory.knows(name) {
                return Err(Error::Configuration(format!(
                    "measure requires unknown facet {:?} (known: {})",
                    name,
                    facet_factory.known_names().join(", ")
                )));
            }
        }

        let size = pool_size(&concurrency);
        let workers = if size == 0 {
            None
        } else {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(size)
                    .build()
                    .map_err(|e| Error::WorkerPool(e.to_string()))?,
            )
        };

        Ok(Self {
            policy,
            facet_factory,
            output,
            facet_names,
            workers,
        })
    }

    /// Filter `records` into `sink`, returning the outcome counts.
    ///
    /// The output header is written first, then calls are windowed into
    /// phase-linked blocks, classified, and written in input order.
    pub fn filter<I, W>(
        &self,
        input_header: &vcf::Header,
        records: I,
        sink: &mut vcf::Writer<W>,
    ) -> Result<FilterStats, Error>
    where
        I: Iterator<Item = std::io::Result<vcf::Record>>,
        W: Write,
    {
        let output_header = make_output_header(input_header, &self.policy, &self.output)?;
        sink.write_header(&output_header)
            .map_err(|e| Error::SinkWrite {
                position: String::from("header"),
                reason: e.to_string(),
            })?;

        let mut reader = BlockReader::new(records);
        let mut stats = FilterStats::default();
        match &self.workers {
            Some(workers) if !self.facet_names.is_empty() => {
                self.filter_parallel(workers, &mut reader, &output_header, sink, &mut stats)?
            }
            _ => self.filter_serial(&mut reader, &output_header, sink, &mut stats)?,
        }
        Ok(stats)
    }

    /// Serial operation: one block at a time on the calling thread.
    fn filter_serial<I, W>(
        &self,
        reader: &mut BlockReader<I>,
        output_header: &vcf::Header,
        sink: &mut vcf::Writer<W>,
        stats: &mut FilterStats,
    ) -> Result<(), Error>
    where
        I: Iterator<Item = std::io::Result<vcf::Record>>,
        W: Write,
    {
        let mut prev = Instant::now();
        loop {
            let block = reader.read_block()?;
            if block.is_empty() {
                break;
            }
            let facets = self.facet_factory.make(&self.facet_names, &block)?;
            let measures = self.measure_block(&block, &facets)?;
            self.write_block(&block, &measures, output_header, sink, stats)?;
            log_progress(stats, &block, &mut prev);
        }
        Ok(())
    }

    /// Pooled operation: buffer a wave of blocks, build their facets, then
    /// measure them on the workers, then write the wave in input order.
    fn filter_parallel<I, W>(
        &self,
        workers: &rayon::ThreadPool,
        reader: &mut BlockReader<I>,
        output_header: &vcf::Header,
        sink: &mut vcf::Writer<W>,
        stats: &mut FilterStats,
    ) -> Result<(), Error>
    where
        I: Iterator<Item = std::io::Result<vcf::Record>>,
        W: Write,
    {
        let max_blocks = max_buffered_blocks(workers.current_num_threads());
        let mut prev = Instant::now();
        loop {
            let blocks = reader.read_blocks(max_blocks)?;
            if blocks.is_empty() {
                break;
            }
            tracing::debug!(
                "scheduling wave of {} blocks / {} calls",
                blocks.len(),
                blocks.iter().map(|block| block.len()).sum::<usize>()
            );
            let facet_maps = self
                .facet_factory
                .make_batch(&self.facet_names, &blocks, workers)?;
            let measured = workers.install(|| {
                blocks
                    .par_iter()
                    .zip(facet_maps.par_iter())
                    .map(|(block, facets)| self.measure_block(block, facets))
                    .collect::<Result<Vec<_>, _>>()
            })?;
            for (block, measures) in blocks.iter().zip(&measured) {
                self.write_block(block, measures, output_header, sink, stats)?;
            }
            if let Some(block) = blocks.last() {
                log_progress(stats, block, &mut prev);
            }
        }
        Ok(())
    }

    /// Evaluate the full measure vector for every call of `block`.
    fn measure_block(
        &self,
        block: &CallBlock,
        facets: &FacetMap,
    ) -> Result<Vec<Vec<MeasureValue>>, Error> {
        block
            .calls()
            .iter()
            .map(|call| {
                self.policy
                    .measures()
                    .iter()
                    .map(|measure| measure.evaluate(call, facets))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect()
    }

    /// Classify the calls of one block and write the survivors.
    fn write_block<W>(
        &self,
        block: &CallBlock,
        measures: &[Vec<MeasureValue>],
        output_header: &vcf::Header,
        sink: &mut vcf::Writer<W>,
        stats: &mut FilterStats,
    ) -> Result<(), Error>
    where
        W: Write,
    {
        for (call, measures) in block.calls().iter().zip(measures) {
            let classification = self.policy.classify(measures);
            stats.tally(&classification);
            match classification {
                Classification::HardFiltered => (),
                Classification::Unfiltered => {
                    self.write_call(call, None, measures, output_header, sink)?
                }
                Classification::SoftFiltered { reasons } => {
                    self.write_call(call, Some(&reasons), measures, output_header, sink)?
                }
            }
        }
        Ok(())
    }

    /// Write one surviving call, applying the output options.
    ///
    /// `reasons` of `None` marks the call as passed.
    fn write_call<W>(
        &self,
        call: &vcf::Record,
        reasons: Option<&[String]>,
        measures: &[MeasureValue],
        output_header: &vcf::Header,
        sink: &mut vcf::Writer<W>,
    ) -> Result<(), Error>
    where
        W: Write,
    {
        use vcf::record::Filters;

        let mut record = call.clone();
        if self.output.emit_sites_only {
            *record.genotypes_mut() = vcf::record::Genotypes::default();
        }
        if self.output.clear_info {
            *record.info_mut() = vcf::record::Info::default();
        }
        if self.output.clear_existing_filters {
            *record.filters_mut() = None;
        }
        match reasons {
            None => *record.filters_mut() = Some(Filters::Pass),
            Some(reasons) => {
                let mut keys = match record.filters() {
                    Some(Filters::Fail(existing)) => existing.clone(),
                    _ => IndexSet::new(),
                };
                keys.extend(reasons.iter().cloned());
                *record.filters_mut() = Some(Filters::Fail(keys));
            }
        }
        if self.output.annotate_measures {
            self.annotate_call(&mut record, measures)?;
        }
        sink.write_record(output_header, &record)
            .map_err(|e| Error::SinkWrite {
                position: call_position(call),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Mirror the measure values of one call into its INFO fields.
    fn annotate_call(
        &self,
        record: &mut vcf::Record,
        measures: &[MeasureValue],
    ) -> Result<(), Error> {
        use vcf::record::info::field::{Key, Value};

        for (measure, value) in self.policy.measures().iter().zip(measures) {
            // QUAL keeps its own column and is never mirrored into INFO.
            if measure.name() == "QUAL" {
                continue;
            }
            let key = measure.name().parse::<Key>().map_err(|e| {
                Error::Configuration(format!("invalid INFO key {:?}: {}", measure.name(), e))
            })?;
            record
                .info_mut()
                .insert(key, Some(Value::String(measure.serialize(value))));
        }
        Ok(())
    }
}
