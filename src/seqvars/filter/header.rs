//! Construction of the output VCF header.

use noodles_vcf as vcf;

use crate::common::worker_version;
use crate::seqvars::filter::engine::{FilterPolicy, OutputOptions};
use crate::seqvars::filter::error::Error;

/// Build the output header from the input header and the active policy.
///
/// The result declares `PASS`, every soft filter key the policy may emit,
/// and (with measure annotation enabled) one INFO line per measure, each
/// exactly once.  A provenance line records the tool version.
pub fn make_output_header<P>(
    input_header: &vcf::Header,
    policy: &P,
    options: &OutputOptions,
) -> Result<vcf::Header, Error>
where
    P: FilterPolicy,
{
    use vcf::header::record::value::{map::Filter, Map};

    let mut header = input_header.clone();

    if options.emit_sites_only {
        header.formats_mut().clear();
        header.sample_names_mut().clear();
    }
    if options.clear_info {
        header.infos_mut().clear();
    }

    header
        .filters_mut()
        .entry(String::from("PASS"))
        .or_insert_with(|| Map::<Filter>::new("All filters passed"));
    policy.annotate_header(&mut header);

    if options.annotate_measures {
        for measure in policy.measures() {
            // QUAL keeps its own column and is never mirrored into INFO.
            if measure.name() == "QUAL" {
                continue;
            }
            add_measure_info(&mut header, measure.name())?;
        }
    }

    header
        .insert(
            "x-varcall-filter-version"
                .parse()
                .map_err(|e| Error::Configuration(format!("invalid header key: {}", e)))?,
            vcf::header::record::Value::from(worker_version()),
        )
        .map_err(|e| Error::Configuration(format!("could not stamp tool version: {}", e)))?;

    Ok(header)
}

/// Declare the INFO field for one measure.
fn add_measure_info(header: &mut vcf::Header, name: &str) -> Result<(), Error> {
    use vcf::header::record::value::map::{info, Info};
    use vcf::header::record::value::Map;
    use vcf::header::Number;

    let key = name
        .parse::<vcf::record::info::field::Key>()
        .map_err(|e| Error::Configuration(format!("invalid INFO key {:?}: {}", name, e)))?;
    let ty = match name {
        "DP" | "MQ0" | "GQ" => info::Type::Integer,
        _ => info::Type::Float,
    };
    header
        .infos_mut()
        .entry(key)
        .or_insert_with(|| Map::<Info>::new(Number::Count(1), ty, "Filtering measure"));
    Ok(())
}
