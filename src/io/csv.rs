//! Delimited-text readers and writers for counts, calibration, sequences and results

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use ndarray::Array2;

use super::results::{ContrastFields, ResultRecord, RunSummary};
use crate::calibration::OdMeasurement;
use crate::data::{CountMatrix, SampleLabel, TimePoint};
use crate::error::{OdidError, Result};
use crate::merge::SequenceInfo;

const NA: &str = "NA";
const AA_COLUMNS: [&str; 4] = ["aa_seq", "aa", "aa_sequence", "peptide"];
const DNA_COLUMNS: [&str; 5] = ["dna_seq", "dna", "dna_sequence", "nt_seq", "sequence"];

/// Tab when the header line has a tab, comma otherwise
fn detect_delimiter<P: AsRef<Path>>(path: P) -> Result<u8> {
    let mut header = String::new();
    BufReader::new(File::open(path)?).read_line(&mut header)?;
    if header.trim().is_empty() {
        return Err(OdidError::EmptyData {
            reason: "File has no header line".to_string(),
        });
    }
    Ok(if header.contains('\t') { b'\t' } else { b',' })
}

fn open_reader<P: AsRef<Path>>(path: P) -> Result<csv::Reader<File>> {
    let delimiter = detect_delimiter(&path)?;
    Ok(ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(Trim::All)
        .from_path(path)?)
}

/// Output delimiter from the file extension
fn output_delimiter<P: AsRef<Path>>(path: P) -> u8 {
    match path.as_ref().extension().and_then(|e| e.to_str()) {
        Some("tsv") | Some("txt") | Some("tab") => b'\t',
        _ => b',',
    }
}

fn column_kind(name: &str) -> Option<SequenceColumn> {
    let lower = name.to_ascii_lowercase();
    if AA_COLUMNS.contains(&lower.as_str()) {
        Some(SequenceColumn::Aa)
    } else if DNA_COLUMNS.contains(&lower.as_str()) {
        Some(SequenceColumn::Dna)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceColumn {
    Aa,
    Dna,
}

fn non_empty(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || v == NA {
        None
    } else {
        Some(v.to_string())
    }
}

/// Count matrix plus any sequence columns found alongside it
#[derive(Debug, Clone)]
pub struct CountTable {
    pub matrix: CountMatrix,
    pub sequences: HashMap<String, SequenceInfo>,
}

/// Read a feature x sample count table.
///
/// The first column holds feature ids. A column whose header parses as a
/// sample label is always a sample column, and every cell in it must be a
/// number. Other columns with a non-numeric value are kept out of the matrix;
/// recognized names fill `aa_seq` / `dna_seq`.
pub fn read_count_table<P: AsRef<Path>>(path: P) -> Result<CountTable> {
    let mut reader = open_reader(&path)?;
    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(OdidError::InvalidCountMatrix {
            reason: "Need a feature id column and at least one sample column".to_string(),
        });
    }

    let rows: Vec<StringRecord> = reader.records().collect::<std::result::Result<_, _>>()?;
    if rows.is_empty() {
        return Err(OdidError::EmptyData {
            reason: "No features found in count table".to_string(),
        });
    }

    let is_numeric = |j: usize| {
        rows.iter()
            .all(|r| r.get(j).map(|v| v.parse::<f64>().is_ok()).unwrap_or(false))
    };

    let mut sample_cols = Vec::new();
    let mut aa_col = None;
    let mut dna_col = None;
    for j in 1..headers.len() {
        let labelled = column_kind(&headers[j]).is_none() && SampleLabel::parse(&headers[j]).is_ok();
        if labelled || is_numeric(j) {
            sample_cols.push(j);
            continue;
        }
        match column_kind(&headers[j]) {
            Some(SequenceColumn::Aa) if aa_col.is_none() => aa_col = Some(j),
            Some(SequenceColumn::Dna) if dna_col.is_none() => dna_col = Some(j),
            _ => log::warn!("Ignoring non-numeric column '{}'", &headers[j]),
        }
    }
    if sample_cols.is_empty() {
        return Err(OdidError::InvalidCountMatrix {
            reason: "No numeric sample columns found".to_string(),
        });
    }

    let sample_ids: Vec<String> = sample_cols.iter().map(|&j| headers[j].to_string()).collect();
    let mut feature_ids = Vec::with_capacity(rows.len());
    let mut counts = Array2::zeros((rows.len(), sample_cols.len()));
    let mut sequences = HashMap::new();

    for (i, row) in rows.iter().enumerate() {
        let id = row.get(0).unwrap_or_default().to_string();
        for (c, &j) in sample_cols.iter().enumerate() {
            let value = row.get(j).unwrap_or_default();
            counts[[i, c]] = value.parse::<f64>().map_err(|_| OdidError::InvalidCountMatrix {
                reason: format!(
                    "Non-numeric count '{}' for feature '{}' in sample column '{}'",
                    value, id, &headers[j]
                ),
            })?;
        }
        if aa_col.is_some() || dna_col.is_some() {
            sequences.insert(
                id.clone(),
                SequenceInfo {
                    aa_seq: aa_col.and_then(|j| row.get(j)).and_then(non_empty),
                    dna_seq: dna_col.and_then(|j| row.get(j)).and_then(non_empty),
                },
            );
        }
        feature_ids.push(id);
    }

    log::info!(
        "Read {} features x {} samples from {}",
        feature_ids.len(),
        sample_ids.len(),
        path.as_ref().display()
    );
    Ok(CountTable {
        matrix: CountMatrix::new(counts, feature_ids, sample_ids)?,
        sequences,
    })
}

/// Read `timepoint,replicate,od` rows
pub fn read_calibration<P: AsRef<Path>>(path: P) -> Result<Vec<OdMeasurement>> {
    let mut reader = open_reader(&path)?;
    let measurements: Vec<OdMeasurement> = reader.deserialize().collect::<std::result::Result<_, _>>()?;
    if measurements.is_empty() {
        return Err(OdidError::EmptyData {
            reason: format!("No calibration rows in {}", path.as_ref().display()),
        });
    }
    Ok(measurements)
}

/// Read feature id -> sequences. The first column is the feature id; sequence
/// columns are found by name.
pub fn read_sequences<P: AsRef<Path>>(path: P) -> Result<HashMap<String, SequenceInfo>> {
    let mut reader = open_reader(&path)?;
    let headers = reader.headers()?.clone();

    let find = |kind: SequenceColumn| (1..headers.len()).find(|&j| column_kind(&headers[j]) == Some(kind));
    let aa_col = find(SequenceColumn::Aa);
    let dna_col = find(SequenceColumn::Dna);
    if aa_col.is_none() && dna_col.is_none() {
        return Err(OdidError::InvalidInput {
            reason: format!(
                "No sequence columns in {} (expected one of {:?} or {:?})",
                path.as_ref().display(),
                AA_COLUMNS,
                DNA_COLUMNS
            ),
        });
    }

    let mut sequences = HashMap::new();
    for row in reader.records() {
        let row = row?;
        let id = row.get(0).unwrap_or_default().to_string();
        let info = SequenceInfo {
            aa_seq: aa_col.and_then(|j| row.get(j)).and_then(non_empty),
            dna_seq: dna_col.and_then(|j| row.get(j)).and_then(non_empty),
        };
        if sequences.insert(id.clone(), info).is_some() {
            log::warn!("Feature '{}' listed twice in sequence table; keeping the last row", id);
        }
    }
    Ok(sequences)
}

/// Which contrast and timepoint columns the output table carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultColumns {
    pub primary: TimePoint,
    pub secondary: Option<TimePoint>,
    pub shrunken: Vec<TimePoint>,
    pub odid: Vec<TimePoint>,
}

impl ResultColumns {
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = ["feature", "baseMean", "dispersion", "dispOutlier", "converged"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for tp in std::iter::once(self.primary).chain(self.secondary) {
            let t = tp.label();
            header.extend([
                format!("log2FoldChange_{}", t),
                format!("lfcSE_{}", t),
                format!("stat_{}", t),
                format!("pvalue_{}", t),
                format!("padj_{}", t),
            ]);
        }
        for tp in &self.shrunken {
            let t = tp.label();
            header.push(format!("shrunkLogFoldChange_{}", t));
            header.push(format!("posteriorSD_{}", t));
        }
        for tp in &self.odid {
            header.push(format!("ODID_{}", tp.label()));
        }
        header.push("aa_seq".to_string());
        header.push("dna_seq".to_string());
        header
    }

    fn row(&self, record: &ResultRecord) -> Vec<String> {
        let mut row = vec![
            record.feature.clone(),
            fmt_f64(record.base_mean),
            fmt_f64(record.dispersion),
            record.disp_outlier.to_string(),
            record.converged.to_string(),
        ];
        row.extend(contrast_cells(Some(&record.primary)));
        if self.secondary.is_some() {
            row.extend(contrast_cells(record.secondary.as_ref()));
        }
        for tp in &self.shrunken {
            let effect = record.shrunken.iter().find(|(t, _)| t == tp).map(|(_, e)| e);
            row.push(fmt_opt(effect.and_then(|e| e.shrunk_log2_fold_change)));
            row.push(fmt_opt(effect.and_then(|e| e.posterior_sd)));
        }
        for tp in &self.odid {
            let od = record.odid.iter().find(|(t, _)| t == tp).and_then(|(_, od)| *od);
            row.push(fmt_opt(od));
        }
        row.push(record.aa_seq.clone().unwrap_or_else(|| NA.to_string()));
        row.push(record.dna_seq.clone().unwrap_or_else(|| NA.to_string()));
        row
    }
}

fn fmt_f64(v: f64) -> String {
    if v.is_finite() {
        format!("{}", v)
    } else {
        NA.to_string()
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(fmt_f64).unwrap_or_else(|| NA.to_string())
}

fn contrast_cells(fields: Option<&ContrastFields>) -> Vec<String> {
    match fields {
        Some(f) => vec![
            fmt_f64(f.record.log2_fold_change),
            fmt_opt(f.record.lfc_se),
            fmt_opt(f.record.stat),
            fmt_opt(f.record.pvalue),
            fmt_opt(f.record.padj),
        ],
        None => vec![NA.to_string(); 5],
    }
}

/// Write the merged table; `.tsv`/`.txt` paths get tabs, anything else commas
pub fn write_results<P: AsRef<Path>>(path: P, records: &[ResultRecord], columns: &ResultColumns) -> Result<()> {
    let file = File::create(&path)?;
    let mut writer = WriterBuilder::new()
        .delimiter(output_delimiter(&path))
        .from_writer(BufWriter::new(file));

    writer.write_record(columns.header())?;
    for record in records {
        writer.write_record(columns.row(record))?;
    }
    writer.flush()?;
    log::info!("Wrote {} records to {}", records.len(), path.as_ref().display());
    Ok(())
}

pub fn write_summary<P: AsRef<Path>>(path: P, summary: &RunSummary) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)?;
    Ok(())
}
