//! Phase-aware grouping of the call stream into blocks.
//!
//! Calls that are linked through overlapping phase regions must be looked at
//! together, so the stream is cut into `CallBlock`s: maximal runs of calls
//! where each call's phase region overlaps the previous call's phase region
//! on the same contig.

use noodles_vcf as vcf;

use crate::seqvars::filter::error::Error;

/// A 1-based, half-open genomic region `[start, end)` on one contig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenomeRegion {
    /// Name of the contig.
    pub contig: String,
    /// 1-based start position (inclusive).
    pub start: usize,
    /// 1-based end position (exclusive).
    pub end: usize,
}

impl GenomeRegion {
    /// Return the region covered by the record itself.
    pub fn of_call(call: &vcf::Record) -> Result<Self, Error> {
        let start = usize::from(call.position());
        let end = call
            .end()
            .map_err(|e| Error::SourceRead {
                position: call_position(call),
                reason: format!("could not determine record end: {}", e),
            })
            .map(usize::from)?;
        Ok(Self {
            contig: call.chromosome().to_string(),
            start,
            end: end + 1,
        })
    }

    /// Whether `self` and `other` are on the same contig and overlap.
    pub fn overlaps(&self, other: &GenomeRegion) -> bool {
        self.contig == other.contig && self.start < other.end && other.start < self.end
    }

    /// Grow `self` to also cover `other`.
    fn encompass(&mut self, other: &GenomeRegion) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }
}

impl std::fmt::Display for GenomeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}-{}", self.contig, self.start, self.end)
    }
}

/// Format a call's position for error messages and logging.
pub fn call_position(call: &vcf::Record) -> String {
    format!("{}:{}", call.chromosome(), usize::from(call.position()))
}

/// Compute the region over which the genotypes of `call` are phased.
///
/// Per sample, this is the span from the `PS` anchor position to the end of
/// the call's own region; samples without `PS` contribute the call's region.
/// The result encompasses all samples, so it equals the call's region with
/// the start pulled back to the earliest anchor.
pub fn phase_region(call: &vcf::Record) -> Result<GenomeRegion, Error> {
    use vcf::record::genotypes::{keys::key, sample::Value};

    let mut result = GenomeRegion::of_call(call)?;
    for sample in call.genotypes().values() {
        let anchor = match sample.get(&key::PHASE_SET) {
            Some(Some(Value::Integer(ps))) => Some(i64::from(*ps)),
            Some(Some(Value::String(ps))) => {
                Some(ps.parse::<i64>().map_err(|e| Error::SourceRead {
                    position: call_position(call),
                    reason: format!("invalid PS value {:?}: {}", ps, e),
                })?)
            }
            _ => None,
        };
        if let Some(anchor) = anchor {
            if anchor < 1 {
                return Err(Error::SourceRead {
                    position: call_position(call),
                    reason: format!("invalid PS value {}: positions are 1-based", anchor),
                });
            }
            result.start = result.start.min(anchor as usize);
        }
    }
    Ok(result)
}

/// A maximal run of calls whose adjacent phase regions overlap.
#[derive(Debug, Default)]
pub struct CallBlock {
    /// Calls of the block, in input order.
    calls: Vec<vcf::Record>,
    /// Phase region of the most recently appended call.
    tail_region: Option<GenomeRegion>,
    /// Region encompassing all appended calls.
    region: Option<GenomeRegion>,
}

impl CallBlock {
    /// Whether a call with the given phase region extends this block.
    fn accepts(&self, region: &GenomeRegion) -> bool {
        match &self.tail_region {
            None => true,
            Some(tail) => tail.overlaps(region),
        }
    }

    /// Append a call together with its phase region.
    fn push(&mut self, call: vcf::Record, region: GenomeRegion) {
        match &mut self.region {
            None => self.region = Some(region.clone()),
            Some(all) => all.encompass(&region),
        }
        self.tail_region = Some(region);
        self.calls.push(call);
    }

    /// The calls of the block, in input order.
    pub fn calls(&self) -> &[vcf::Record] {
        &self.calls
    }

    /// Number of calls in the block.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether the block holds no calls.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Region encompassing all calls, `None` for an empty block.
    pub fn region(&self) -> Option<&GenomeRegion> {
        self.region.as_ref()
    }

    /// Contig of the block, `None` for an empty block.
    pub fn contig(&self) -> Option<&str> {
        self.region.as_ref().map(|r| r.contig.as_str())
    }
}

/// Cuts an ordered stream of VCF records into `CallBlock`s.
pub struct BlockReader<I> {
    /// The underlying record cursor.
    records: I,
    /// A fetched call that did not fit the block under construction.
    pending: Option<(vcf::Record, GenomeRegion)>,
    /// Position of the most recently fetched call.
    cursor: Option<String>,
}

impl<I> BlockReader<I>
where
    I: Iterator<Item = std::io::Result<vcf::Record>>,
{
    /// Create a new block reader on top of a record cursor.
    pub fn new(records: I) -> Self {
        Self {
            records,
            pending: None,
            cursor: None,
        }
    }

    /// Read the next block.
    ///
    /// The result is empty only when the source is exhausted.
    pub fn read_block(&mut self) -> Result<CallBlock, Error> {
        let mut block = CallBlock::default();
        while let Some((call, region)) = self.fetch()? {
            if block.accepts(&region) {
                block.push(call, region);
            } else {
                self.pending = Some((call, region));
                break;
            }
        }
        Ok(block)
    }

    /// Read up to `max_blocks` blocks, stopping early at a contig change.
    ///
    /// The result holds no empty blocks; an empty vector means the source is
    /// exhausted.  Within one invocation all blocks share a contig.
    pub fn read_blocks(&mut self, max_blocks: usize) -> Result<Vec<CallBlock>, Error> {
        let mut blocks = Vec::new();
        while blocks.len() < max_blocks {
            let block = self.read_block()?;
            if block.is_empty() {
                break;
            }
            blocks.push(block);
            match self.peek_contig()? {
                Some(next) if Some(next.as_str()) == blocks.last().and_then(|b| b.contig()) => {}
                _ => break,
            }
        }
        Ok(blocks)
    }

    /// Pull the next call and its phase region, honoring the pushback slot.
    fn fetch(&mut self) -> Result<Option<(vcf::Record, GenomeRegion)>, Error> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        match self.records.next() {
            None => Ok(None),
            Some(Err(e)) => Err(Error::SourceRead {
                position: match &self.cursor {
                    Some(position) => format!("after {}", position),
                    None => String::from("at start"),
                },
                reason: e.to_string(),
            }),
            Some(Ok(call)) => {
                self.cursor = Some(call_position(&call));
                let region = phase_region(&call)?;
                Ok(Some((call, region)))
            }
        }
    }

    /// Contig of the next call without consuming it.
    fn peek_contig(&mut self) -> Result<Option<String>, Error> {
        Ok(match self.fetch()? {
            None => None,
            Some((call, region)) => {
                let contig = region.contig.clone();
                self.pending = Some((call, region));
                Some(contig)
            }
        })
    }
}
