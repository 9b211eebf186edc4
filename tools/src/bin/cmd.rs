// Command line utility for running scqc pipeline stages

use anyhow::{bail, Context, Error};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use ndarray::prelude::*;
use scqc::config::{CellThresholdConfig, PipelineConfig};
use scqc::filter::CellThresholds;
use scqc::qc::{summarize_by_condition, GeneSubset};
use scqc::{ConditionInput, Pipeline};
use scqc_store::DatasetStore;
use scqc_types::Dataset;
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

fn parse_condition(s: &str) -> Result<ConditionInput, String> {
    match s.split_once('=') {
        Some((label, dir)) if !label.is_empty() && !dir.is_empty() => Ok(ConditionInput::new(label, dir)),
        _ => Err(format!("expected LABEL=DIR, got {s}")),
    }
}

fn conditions_arg() -> Arg {
    Arg::new("CONDITION")
        .help("Condition label and its matrix directory, as LABEL=DIR; repeat for each condition")
        .short('c')
        .long("condition")
        .required(true)
        .action(ArgAction::Append)
        .value_parser(parse_condition)
}

/// Input and output artifacts shared by the per-stage subcommands
fn stage(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .about(about)
        .arg(
            Arg::new("INPUT")
                .help("dataset artifact to read")
                .required(true)
                .index(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUTPUT")
                .help("dataset artifact to write")
                .short('o')
                .long("output")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
}

fn cli() -> Command {
    Command::new("scqc-cmd")
        .about("Single-cell QC, normalization and clustering")
        .subcommand_required(true)
        .arg(
            Arg::new("CONFIG")
                .help("JSON pipeline configuration; flags override its values")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .subcommand(
            Command::new("load")
                .about("Merge condition directories into one dataset")
                .arg(conditions_arg())
                .arg(
                    Arg::new("OUTPUT")
                        .help("dataset artifact to write")
                        .short('o')
                        .long("output")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            stage("qc", "Compute per-cell and per-gene QC metrics").arg(
                Arg::new("SUBSET_PREFIX")
                    .help("gene name prefix of the flagged subset")
                    .long("subset-prefix")
                    .value_parser(value_parser!(String)),
            ),
        )
        .subcommand(
            stage("filter-cells", "Remove low-quality cells")
                .arg(
                    Arg::new("MIN_COUNTS")
                        .help("cells need more total counts than this")
                        .long("min-counts")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("MIN_FEATURES")
                        .help("cells need more detected features than this")
                        .long("min-features")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("MAX_PCT")
                        .help("cells need a smaller flagged-subset percentage than this")
                        .long("max-pct")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("NMADS")
                        .help("derive thresholds from the data, this many MADs from the median")
                        .long("adaptive")
                        .conflicts_with_all(["MIN_COUNTS", "MIN_FEATURES", "MAX_PCT"])
                        .value_parser(value_parser!(f64)),
                ),
        )
        .subcommand(
            stage("filter-genes", "Remove genes expressed in too few cells").arg(
                Arg::new("MIN_CELLS")
                    .help("genes need to be expressed in more cells than this")
                    .long("min-cells")
                    .value_parser(value_parser!(u32)),
            ),
        )
        .subcommand(
            stage("normalize", "Estimate size factors and log-normalize").arg(
                Arg::new("METHOD")
                    .help("size factor method")
                    .short('m')
                    .long("method")
                    .value_parser(["library", "deconvolution"]),
            ),
        )
        .subcommand(
            stage("cell-cycle", "Score S and G2/M signatures and assign phases")
                .arg(
                    Arg::new("S_GENES")
                        .help("file with S-phase genes, one per line")
                        .long("s-genes")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("G2M_GENES")
                        .help("file with G2/M genes, one per line")
                        .long("g2m-genes")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("BASELINE")
                        .help("both scores under this value mean G1")
                        .long("baseline")
                        .value_parser(value_parser!(f64)),
                ),
        )
        .subcommand(
            stage("embed", "Principal components and t-SNE")
                .arg(
                    Arg::new("N_TOP_GENES")
                        .help("number of highly variable genes")
                        .long("n-top-genes")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("NUM_PCS")
                        .help("number of PCA dimensions to compute")
                        .short('d')
                        .long("num_pcs")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("TSNE_DIMS")
                        .help("leading components fed to t-SNE")
                        .long("tsne-dims")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("PERPLEXITY")
                        .help("t-SNE perplexity")
                        .long("perplexity")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("THETA")
                        .help("Barnes-Hut accuracy; 0 computes exact repulsion")
                        .long("theta")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("EXPORT")
                        .help("directory to write each embedding to as gzipped CSV")
                        .long("export")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            stage("cluster", "Graph clustering on the principal components")
                .arg(
                    Arg::new("RESOLUTION")
                        .help("modularity resolution")
                        .short('r')
                        .long("resolution")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("NEIGHBORS")
                        .help("neighbors per cell in the graph")
                        .short('k')
                        .long("neighbors")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("CLUSTER_DIMS")
                        .help("leading components used for the graph")
                        .long("cluster-dims")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("EXPORT")
                        .help("gzipped CSV of cell ids and cluster labels")
                        .long("export")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("run-all")
                .about("Run every stage, persisting the scored and clustered datasets")
                .arg(conditions_arg())
                .arg(
                    Arg::new("OUT_DIR")
                        .help("Output directory")
                        .short('o')
                        .long("out_dir")
                        .default_value(".")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

/// Copy `id` into `target` when the subcommand defines it and it was given
fn set<T: Clone + Send + Sync + 'static>(m: &ArgMatches, id: &str, target: &mut T) {
    if let Ok(Some(v)) = m.try_get_one::<T>(id) {
        *target = v.clone();
    }
}

fn given<T: Clone + Send + Sync + 'static>(m: &ArgMatches, id: &str) -> Option<T> {
    m.try_get_one::<T>(id).ok().flatten().cloned()
}

/// Flags override the config file
fn apply_overrides(config: &mut PipelineConfig, m: &ArgMatches) -> Result<(), Error> {
    if let Some(prefix) = given::<String>(m, "SUBSET_PREFIX") {
        config.flagged_subset = GeneSubset::prefix(prefix.clone(), prefix);
    }

    if let Some(nmads) = given::<f64>(m, "NMADS") {
        config.cell_thresholds = CellThresholdConfig::Adaptive { nmads };
    } else {
        let mut t = match config.cell_thresholds {
            CellThresholdConfig::Fixed(t) => t,
            CellThresholdConfig::Adaptive { .. } => CellThresholds::default(),
        };
        let before = t;
        set(m, "MIN_COUNTS", &mut t.min_total_counts);
        set(m, "MIN_FEATURES", &mut t.min_detected_features);
        set(m, "MAX_PCT", &mut t.max_pct_flagged);
        if t != before {
            config.cell_thresholds = CellThresholdConfig::Fixed(t);
        }
    }

    set(m, "MIN_CELLS", &mut config.min_cells);
    if let Some(method) = given::<String>(m, "METHOD") {
        config.size_factors = method.parse()?;
    }

    if let Some(path) = given::<PathBuf>(m, "S_GENES") {
        config.cell_cycle.s_genes = Some(path);
    }
    if let Some(path) = given::<PathBuf>(m, "G2M_GENES") {
        config.cell_cycle.g2m_genes = Some(path);
    }
    set(m, "BASELINE", &mut config.cell_cycle.baseline);

    set(m, "N_TOP_GENES", &mut config.embed.n_top_genes);
    if let Some(num_pcs) = given::<usize>(m, "NUM_PCS") {
        config.embed.n_components = num_pcs;
        config.embed.tsne_dims = config.embed.tsne_dims.min(num_pcs);
        config.embed.cluster_dims = config.embed.cluster_dims.min(num_pcs);
    }
    set(m, "TSNE_DIMS", &mut config.embed.tsne_dims);
    set(m, "PERPLEXITY", &mut config.tsne.perplexity);
    set(m, "THETA", &mut config.tsne.theta);

    set(m, "RESOLUTION", &mut config.clustering.resolution);
    set(m, "NEIGHBORS", &mut config.clustering.n_neighbors);
    set(m, "CLUSTER_DIMS", &mut config.embed.cluster_dims);
    Ok(())
}

fn read_input(m: &ArgMatches) -> Result<Dataset, Error> {
    let path: &PathBuf = m.get_one("INPUT").context("missing input")?;
    DatasetStore::load(path).with_context(|| path.display().to_string())
}

fn write_output(ds: &Dataset, m: &ArgMatches) -> Result<(), Error> {
    let path: &PathBuf = m.get_one("OUTPUT").context("missing output")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent).with_context(|| parent.display().to_string())?;
    }
    DatasetStore::save(ds, path).with_context(|| path.display().to_string())
}

fn conditions(m: &ArgMatches) -> Vec<ConditionInput> {
    m.get_many::<ConditionInput>("CONDITION")
        .map(|v| v.cloned().collect())
        .unwrap_or_default()
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = cli().get_matches();
    let Some((name, sub)) = matches.subcommand() else {
        bail!("a subcommand is required");
    };

    let mut config = match sub.get_one::<PathBuf>("CONFIG") {
        Some(path) => PipelineConfig::from_json_file(path).with_context(|| path.display().to_string())?,
        None => PipelineConfig::default(),
    };
    apply_overrides(&mut config, sub)?;
    let pipeline = Pipeline::new(config)?;

    match name {
        "load" => {
            let ds = pipeline.load(&conditions(sub))?;
            write_output(&ds, sub)?;
        }
        "qc" => {
            let ds = pipeline.qc(&read_input(sub)?)?;
            for s in summarize_by_condition(&ds) {
                info!(
                    "{}: {} cells ({} empty), median counts {:?}, median features {:?}, median flagged % {:?}",
                    s.condition,
                    s.cells,
                    s.degenerate,
                    s.median_total_counts,
                    s.median_detected_features,
                    s.median_pct_flagged
                );
            }
            write_output(&ds, sub)?;
        }
        "filter-cells" => {
            let outcome = pipeline.filter_cells(&read_input(sub)?)?;
            for (condition, n) in &outcome.survivors_by_condition {
                info!("{condition}: {n} cells kept");
            }
            println!("cells\t{}\t{}", outcome.cells_before, outcome.cells_after);
            write_output(&outcome.dataset, sub)?;
        }
        "filter-genes" => {
            let outcome = pipeline.filter_genes(&read_input(sub)?)?;
            println!("genes\t{}\t{}", outcome.genes_before, outcome.genes_after);
            write_output(&outcome.dataset, sub)?;
        }
        "normalize" => {
            let ds = pipeline.normalize(&read_input(sub)?)?;
            write_output(&ds, sub)?;
        }
        "cell-cycle" => {
            let ds = pipeline.cell_cycle(&read_input(sub)?)?;
            write_output(&ds, sub)?;
        }
        "embed" => {
            let ds = pipeline.embed(&read_input(sub)?)?;
            if let Some(dir) = sub.get_one::<PathBuf>("EXPORT") {
                create_dir_all(dir).with_context(|| dir.display().to_string())?;
                for (name, coords) in ds.embeddings() {
                    array_to_csv(coords.view(), dir.join(format!("{name}.csv.gz")))?;
                }
            }
            write_output(&ds, sub)?;
        }
        "cluster" => {
            let ds = pipeline.cluster(&read_input(sub)?)?;
            if let Some(path) = sub.get_one::<PathBuf>("EXPORT") {
                clusters_to_csv(&ds, path)?;
            }
            write_output(&ds, sub)?;
        }
        "run-all" => {
            let out_dir: &PathBuf = sub.get_one("OUT_DIR").context("missing output directory")?;
            let report = pipeline.run_all(&conditions(sub), out_dir)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        other => bail!("unknown subcommand {other}"),
    }
    Ok(())
}

pub fn array_to_csv(array: ArrayView2<f64>, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| path.display().to_string())?;
    let mut writer = BufWriter::new(GzEncoder::new(file, Compression::default()));
    let num_cols = array.shape()[1];
    for row in array.axis_iter(Axis(0)) {
        for (i, entry) in row.iter().enumerate() {
            write!(writer, "{}", *entry)?;
            if i + 1 < num_cols {
                write!(writer, ",")?;
            }
        }
        writeln!(writer)?;
    }
    writer.into_inner().map_err(|e| e.into_error())?.finish()?;
    Ok(())
}

pub fn clusters_to_csv(ds: &Dataset, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let Some(clusters) = ds.clusters() else {
        bail!("dataset has no clusters");
    };
    let file = File::create(path).with_context(|| path.display().to_string())?;
    let mut writer = BufWriter::new(GzEncoder::new(file, Compression::default()));
    writeln!(writer, "cell_id,cluster")?;
    for (id, label) in ds.cells().cell_ids.iter().zip(clusters) {
        writeln!(writer, "{id},{label}")?;
    }
    writer.into_inner().map_err(|e| e.into_error())?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let m = cli().get_matches_from([
            "scqc-cmd",
            "filter-cells",
            "in.json.gz",
            "-o",
            "out.json.gz",
            "--min-counts",
            "500",
        ]);
        let (_, sub) = m.subcommand().unwrap();
        let mut config = PipelineConfig::default();
        apply_overrides(&mut config, sub).unwrap();
        assert_eq!(
            config.cell_thresholds,
            CellThresholdConfig::Fixed(CellThresholds::new(500.0, 300.0, 25.0))
        );

        let m = cli().get_matches_from(["scqc-cmd", "embed", "in", "-o", "out", "-d", "10", "--theta", "0.8"]);
        let (_, sub) = m.subcommand().unwrap();
        let mut config = PipelineConfig::default();
        apply_overrides(&mut config, sub).unwrap();
        assert_eq!(config.tsne.theta, 0.8);
        assert_eq!(config.embed.n_components, 10);
        assert_eq!(config.embed.tsne_dims, 10);
        assert_eq!(config.embed.cluster_dims, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn condition_pairs() {
        assert_eq!(
            parse_condition("fresh=/data/fresh").unwrap(),
            ConditionInput::new("fresh", "/data/fresh")
        );
        assert!(parse_condition("fresh").is_err());
        assert!(parse_condition("=dir").is_err());
    }
}
