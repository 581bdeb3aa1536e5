//! Command-line interface for peptide_odid

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "peptide_odid")]
#[command(version)]
#[command(about = "Depletion testing and OD-equivalent concentrations for peptide library time courses")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full depletion pipeline
    #[command(
        long_about = "Run the full depletion pipeline\n\n\
            Filters sparse features, fits a negative binomial model over a\n\
            batch + timepoint design, tests each contrast for depletion with a\n\
            one-sided Wald test, shrinks effect sizes, converts them to\n\
            OD-equivalent concentrations, and writes one merged table.",
        after_long_help = "\
Examples:
  # Counts with embedded aa_seq/dna_seq columns
  peptide_odid run -c counts.tsv -k od.csv -o results.tsv

  # Separate sequence table, JSON config and run summary
  peptide_odid run -c counts.tsv -k od.csv -s peptides.csv -o results.tsv \\
    --config params.json --summary summary.json

  # Test t2 as the primary contrast without independent filtering
  peptide_odid run -c counts.tsv -k od.csv -o results.tsv --primary 2 --no-independent-filtering"
    )]
    Run {
        /// Path to count table (CSV or TSV)
        #[arg(short, long,
            long_help = "Path to count table.\n\
                Format: first column = feature IDs, sample columns named like X0A, 3B\n\
                (timepoint digits followed by a batch tag). Non-numeric columns such as\n\
                aa_seq and dna_seq are read as sequences. Delimiter is auto-detected.")]
        counts: String,

        /// Path to OD calibration table
        #[arg(short = 'k', long,
            long_help = "Path to OD calibration table with header timepoint,replicate,od.\n\
                Replicates are averaged per timepoint.")]
        calibration: String,

        /// Path to sequence table (feature id, aa_seq, dna_seq)
        #[arg(short, long)]
        sequences: Option<String>,

        /// Output file path; .tsv/.txt are tab-delimited
        #[arg(short, long, default_value = "odid_results.tsv")]
        output: String,

        /// JSON configuration file
        #[arg(long)]
        config: Option<String>,

        /// Write a JSON run summary here
        #[arg(long)]
        summary: Option<String>,

        /// FDR level for independent filtering [default: 0.1]
        #[arg(short, long)]
        alpha: Option<f64>,

        /// Primary (filtering) timepoint [default: last]
        #[arg(long)]
        primary: Option<u32>,

        /// Secondary (reported) timepoint [default: first non-baseline]
        #[arg(long)]
        secondary: Option<u32>,

        /// Apply BH to every feature instead of filtering on base mean
        #[arg(long)]
        no_independent_filtering: bool,

        /// Number of threads (0 = auto) [default: 0]
        #[arg(short = 't', long, default_value = "0")]
        threads: usize,
    },

    /// Print mean OD per timepoint from a calibration table
    #[command(
        after_long_help = "\
Examples:
  peptide_odid calibrate -k od.csv"
    )]
    Calibrate {
        /// Path to OD calibration table
        #[arg(short = 'k', long)]
        calibration: String,
    },
}
