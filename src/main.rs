//! peptide_odid command-line interface

use std::collections::HashMap;

use clap::Parser;
use log::{info, LevelFilter};

use peptide_odid::cli::{Cli, Commands};
use peptide_odid::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Some(Commands::Run {
            counts,
            calibration,
            sequences,
            output,
            config,
            summary,
            alpha,
            primary,
            secondary,
            no_independent_filtering,
            threads,
        }) => {
            let args = RunArgs {
                counts,
                calibration,
                sequences,
                output,
                config,
                summary,
                alpha,
                primary,
                secondary,
                no_independent_filtering,
                threads,
            };
            run_analysis(&args)
        }
        Some(Commands::Calibrate { calibration }) => run_calibrate(&calibration),
        None => {
            println!("peptide_odid v{}", VERSION);
            println!("Run `peptide_odid --help` for usage.");
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

struct RunArgs {
    counts: String,
    calibration: String,
    sequences: Option<String>,
    output: String,
    config: Option<String>,
    summary: Option<String>,
    alpha: Option<f64>,
    primary: Option<u32>,
    secondary: Option<u32>,
    no_independent_filtering: bool,
    threads: usize,
}

fn build_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            PipelineConfig::from_json_file(path)?
        }
        None => PipelineConfig::default(),
    };
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if args.primary.is_some() {
        config.primary_timepoint = args.primary;
    }
    if args.secondary.is_some() {
        config.secondary_timepoint = args.secondary;
    }
    if args.no_independent_filtering {
        config.independent_filtering = false;
    }
    config.validate()?;
    Ok(config)
}

fn run_analysis(args: &RunArgs) -> Result<()> {
    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
            .ok();
    }

    let config = build_config(args)?;

    info!("Loading count table from: {}", args.counts);
    let table = read_count_table(&args.counts)?;

    info!("Loading calibration from: {}", args.calibration);
    let calibration = CalibrationTable::from_measurements(&read_calibration(&args.calibration)?, config.baseline_od)?;

    let mut sequences: HashMap<String, SequenceInfo> = table.sequences;
    if let Some(path) = &args.sequences {
        info!("Loading sequences from: {}", path);
        // the dedicated table wins over sequence columns in the count table
        sequences.extend(read_sequences(path)?);
    }

    let output = run_pipeline(&table.matrix, &calibration, &sequences, &config)?;
    write_results(&args.output, &output.records, &output.columns)?;

    if let Some(path) = &args.summary {
        write_summary(path, &output.summary)?;
        info!("Run summary written to: {}", path);
    }

    info!(
        "Done: {} of {} features reported",
        output.summary.n_features_reported, output.summary.n_features_input
    );
    Ok(())
}

fn run_calibrate(path: &str) -> Result<()> {
    let table = CalibrationTable::from_measurements(&read_calibration(path)?, BASELINE_OD)?;
    println!("timepoint\treplicates\tmean_od");
    for tp in table.timepoints() {
        println!("{}\t{}\t{:.4}", tp, table.n_replicates(tp), table.mean_od(tp)?);
    }
    Ok(())
}
