// Command line utility for integrating two single-cell libraries

use anyhow::{Context, Error};
use clap::{value_parser, Arg, ArgMatches, Command};
use log::{info, warn};
use scalign::config::PipelineConfig;
use scalign::pathway::{browse_url, CurlTransport};
use scalign::pipeline::{marker_pathways, run_pipeline, write_outputs, LibraryInput};
use scalign_types::PipelineError;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

fn cli() -> Command {
    Command::new("scalign-cmd")
        .about("Align, cluster and find markers across two single-cell count tables")
        .arg(
            Arg::new("INPUT_A")
                .help("first gene x cell count table (TSV, optionally gzipped)")
                .required(true)
                .index(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("INPUT_B")
                .help("second gene x cell count table")
                .required(true)
                .index(2)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("LABELS")
                .help("library labels for the two tables")
                .short('l')
                .long("labels")
                .num_args(2)
                .default_values(["ctrl", "stim"]),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory")
                .short('o')
                .long("out_dir")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("CONFIG")
                .help("JSON pipeline configuration")
                .short('c')
                .long("config")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("DIMS")
                .help("Number of aligned correlates used downstream")
                .short('d')
                .long("dims")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("RESOLUTION")
                .help("Clustering resolution")
                .short('r')
                .long("resolution")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("K")
                .help("Neighborhood size of the SNN graph")
                .short('k')
                .long("k")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("THRESHOLD")
                .help("Minimum variance ratio for a cell to be kept")
                .short('t')
                .long("threshold")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("PATHWAYS")
                .help("Submit cluster 0 markers for Reactome pathway enrichment")
                .long("pathways")
                .action(clap::ArgAction::SetTrue),
        )
}

fn load_config(matches: &ArgMatches) -> Result<PipelineConfig, Error> {
    let mut config = match matches.get_one::<PathBuf>("CONFIG") {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(&dims) = matches.get_one::<usize>("DIMS") {
        config.align.dims = dims;
        config.cluster.dims = dims;
    }
    if let Some(&resolution) = matches.get_one::<f64>("RESOLUTION") {
        config.cluster.resolution = resolution;
    }
    if let Some(&k) = matches.get_one::<usize>("K") {
        config.cluster.k = k;
    }
    if let Some(&threshold) = matches.get_one::<f64>("THRESHOLD") {
        config.align.var_ratio_threshold = threshold;
    }
    if matches.get_flag("PATHWAYS") {
        config.pathway.enabled = true;
    }
    config.validate()?;
    Ok(config)
}

pub fn main() -> Result<(), Error> {
    let mut logger = pretty_env_logger::formatted_timed_builder();
    logger.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    let labels = matches
        .get_many::<String>("LABELS")
        .map(|v| v.cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    let path = |id: &str| matches.get_one::<PathBuf>(id).cloned().unwrap_or_default();
    let inputs = match labels.as_slice() {
        [a, b] => [
            LibraryInput {
                label: a.clone(),
                path: path("INPUT_A"),
            },
            LibraryInput {
                label: b.clone(),
                path: path("INPUT_B"),
            },
        ],
        _ => return Err(PipelineError::invalid("exactly two library labels are required").into()),
    };
    let out_dir = matches
        .get_one::<PathBuf>("OUT_DIR")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."));

    let merged = run_pipeline(&inputs, &config)?;
    write_outputs(&merged, &out_dir)?;

    if config.pathway.enabled {
        let transport = CurlTransport {
            timeout_secs: config.pathway.timeout_secs,
        };
        match marker_pathways(&merged, &config, &transport) {
            Ok(Some(report)) => {
                let path = out_dir.join("pathways.json");
                let file = File::create(&path).with_context(|| path.display().to_string())?;
                serde_json::to_writer_pretty(BufWriter::new(file), &report)?;
                info!("pathway report: {}", browse_url(&report.token));
            }
            Ok(None) => warn!("no up-regulated marker genes to submit for pathway enrichment"),
            Err(e) => match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::RemoteService(_)) => warn!("skipping pathway enrichment: {e}"),
                _ => return Err(e),
            },
        }
    }
    Ok(())
}
