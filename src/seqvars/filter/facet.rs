//! Facets: block-scoped evidence shared by the measures of one block.

use std::any::Any;
use std::sync::Arc;

use indexmap::IndexMap;
use noodles_vcf as vcf;
use rayon::prelude::*;

use crate::seqvars::filter::block::CallBlock;
use crate::seqvars::filter::error::Error;

/// Block-scoped, immutable evidence consumed by one or more measures.
pub trait Facet: std::fmt::Debug + Send + Sync {
    /// Name under which measures request this facet.
    fn name(&self) -> &str;
    /// Upcast used to reach the concrete facet type.
    fn as_any(&self) -> &dyn Any;
}

/// The facets computed for exactly one block, keyed by name.
pub type FacetMap = IndexMap<String, Arc<dyn Facet>>;

/// Fetch facet `name` from `facets` and downcast it to `T`.
pub fn get_facet<'m, T>(facets: &'m FacetMap, name: &str) -> Result<&'m T, Error>
where
    T: Facet + 'static,
{
    facets
        .get(name)
        .ok_or_else(|| Error::Configuration(format!("facet {:?} was not computed", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Configuration(format!("facet {:?} has an unexpected type", name)))
}

/// The calling sample names, as declared in the source header.
#[derive(Debug, Clone)]
pub struct Samples {
    /// Sample names in header column order.
    names: Vec<String>,
}

impl Samples {
    /// Name used in measure requirements.
    pub const NAME: &'static str = "Samples";

    /// The sample names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Facet for Samples {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Closure building one facet value for one block.
type FacetMaker = Box<dyn Fn(&CallBlock) -> Result<Arc<dyn Facet>, Error> + Send + Sync>;

/// Builds the facets requested by the active measure set, block by block.
///
/// Facet values never outlive the evaluation of the block they were built
/// for, so there is no cross-block state to go stale.
pub struct FacetFactory {
    /// Registered makers by facet name.
    makers: IndexMap<String, FacetMaker>,
}

impl FacetFactory {
    /// Create a factory with the built-in facets registered.
    pub fn new(header: &vcf::Header) -> Self {
        let mut factory = Self {
            makers: IndexMap::new(),
        };
        let samples = Samples {
            names: header.sample_names().iter().cloned().collect(),
        };
        factory.register(Samples::NAME, move |_block| {
            let facet: Arc<dyn Facet> = Arc::new(samples.clone());
            Ok(facet)
        });
        factory
    }

    /// Register a maker under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: &str, maker: F)
    where
        F: Fn(&CallBlock) -> Result<Arc<dyn Facet>, Error> + Send + Sync + 'static,
    {
        self.makers.insert(name.to_string(), Box::new(maker));
    }

    /// Whether a maker for `name` is registered.
    pub fn knows(&self, name: &str) -> bool {
        self.makers.contains_key(name)
    }

    /// Names of all registered facets.
    pub fn known_names(&self) -> Vec<&str> {
        self.makers.keys().map(String::as_str).collect()
    }

    /// Build the facets named in `names` for one block.
    ///
    /// Each name is built exactly once per invocation.
    pub fn make(&self, names: &[String], block: &CallBlock) -> Result<FacetMap, Error> {
        let mut result = FacetMap::with_capacity(names.len());
        for name in names {
            let maker = self.makers.get(name).ok_or_else(|| {
                Error::Configuration(format!(
                    "unknown facet {:?} (known: {})",
                    name,
                    self.known_names().join(", ")
                ))
            })?;
            result.insert(name.clone(), maker(block)?);
        }
        Ok(result)
    }

    /// Build the facet maps for a batch of blocks on the worker pool.
    ///
    /// One wave: the call returns only after every block's map is complete,
    /// so measures never observe a partially built map.
    pub fn make_batch(
        &self,
        names: &[String],
        blocks: &[CallBlock],
        workers: &rayon::ThreadPool,
    ) -> Result<Vec<FacetMap>, Error> {
        workers.install(|| {
            blocks
                .par_iter()
                .map(|block| self.make(names, block))
                .collect::<Result<Vec<_>, _>>()
        })
    }
}

impl std::fmt::Debug for FacetFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacetFactory")
            .field("makers", &self.makers.keys().collect::<Vec<_>>())
            .finish()
    }
}
