//! Multi-format export of finished scan runs.
//!
//! An [`Exporter`] holds a list of [`ExportWriter`]s and runs each one
//! independently: a writer that fails leaves no partial file behind and
//! never stops the other formats.

use crate::error::ExportError;
use crate::scan::ScanRun;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// One output format.
pub trait ExportWriter: Send + Sync {
    /// Short name used in reports, e.g. `"csv"`.
    fn format(&self) -> &'static str;

    fn extension(&self) -> &'static str;

    /// Writes `run` to `path`, creating or truncating it.
    fn write(&self, run: &ScanRun, path: &Path) -> Result<(), ExportError>;
}

fn create(format: &'static str, path: &Path) -> Result<BufWriter<fs::File>, ExportError> {
    fs::File::create(path)
        .map(BufWriter::new)
        .map_err(|source| ExportError::Io {
            format,
            path: path.to_path_buf(),
            source,
        })
}

// ============================================================================
// CSV
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;

    /// Tabular samples with `# ` metadata header lines.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CsvExport;

    impl CsvExport {
        fn header(run: &ScanRun) -> Vec<String> {
            let mut lines = vec![
                format!("Run: {}", run.id),
                format!("Status: {}", run.status),
                format!("Unit: {}", run.unit),
                format!("Start(nm): {}", run.config.start_nm),
                format!("End(nm): {}", run.config.end_nm),
                format!("Resolution(pm): {}", run.config.resolution_pm()),
                format!("Speed(nm/s): {}", run.config.speed_nm_s),
                format!("LaserPower: {} mW", run.config.laser_power_mw),
                format!("LaserInput: {}", run.config.input),
            ];
            if let Some(started) = run.started_at {
                lines.push(format!("Started: {}", started.to_rfc3339()));
            }
            if let Some(last) = run.monitor_readings.last() {
                lines.push(format!("Pout(dBm): {:.3}", last.pout));
            }
            lines
        }
    }

    impl ExportWriter for CsvExport {
        fn format(&self) -> &'static str {
            "csv"
        }

        fn extension(&self) -> &'static str {
            "csv"
        }

        fn write(&self, run: &ScanRun, path: &Path) -> Result<(), ExportError> {
            let mut file = create("csv", path)?;
            let io_err = |source| ExportError::Io {
                format: "csv",
                path: path.to_path_buf(),
                source,
            };
            for line in Self::header(run) {
                writeln!(file, "# {}", line).map_err(io_err)?;
            }

            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(["wavelength_nm", "power_dbm", "monitor_pout_dbm", "timestamp"])?;
            for sample in &run.samples {
                let monitor = sample
                    .monitor
                    .map_or(String::new(), |m| format!("{:.6}", m.pout));
                writer.write_record([
                    format!("{:.6}", sample.wavelength_nm),
                    format!("{:.6}", sample.power_dbm),
                    monitor,
                    sample.timestamp.to_rfc3339(),
                ])?;
            }
            writer.flush().map_err(io_err)?;
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder when the `storage_csv` feature is off; every write fails.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CsvExport;

    impl ExportWriter for CsvExport {
        fn format(&self) -> &'static str {
            "csv"
        }

        fn extension(&self) -> &'static str {
            "csv"
        }

        fn write(&self, _run: &ScanRun, _path: &Path) -> Result<(), ExportError> {
            Err(ExportError::Writer {
                format: "csv",
                message: "feature storage_csv is not enabled".into(),
            })
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvExport;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvExport;

// ============================================================================
// MAT
// ============================================================================

/// MATLAB v7 file with one variable per column plus scalar scan settings.
#[cfg(feature = "storage_matlab")]
#[derive(Debug, Default, Clone, Copy)]
pub struct MatExport;

#[cfg(feature = "storage_matlab")]
impl ExportWriter for MatExport {
    fn format(&self) -> &'static str {
        "mat"
    }

    fn extension(&self) -> &'static str {
        "mat"
    }

    fn write(&self, run: &ScanRun, path: &Path) -> Result<(), ExportError> {
        use matrw::{MatFile, MatVariable};

        let writer_err = |message: String| ExportError::Writer { format: "mat", message };
        let target = path
            .to_str()
            .ok_or_else(|| writer_err(format!("path {} is not valid UTF-8", path.display())))?;

        let mut mat = MatFile::new();
        let wavelengths: Vec<f64> = run.samples.iter().map(|s| s.wavelength_nm).collect();
        let powers: Vec<f64> = run.samples.iter().map(|s| s.power_dbm).collect();
        mat.insert("wl_nm", MatVariable::from(wavelengths));
        mat.insert("pow_dBm", MatVariable::from(powers));
        mat.insert("start_nm", MatVariable::from(run.config.start_nm));
        mat.insert("end_nm", MatVariable::from(run.config.end_nm));
        mat.insert("res_pm", MatVariable::from(f64::from(run.config.resolution_pm())));
        mat.insert("speed_nms", MatVariable::from(run.config.speed_nm_s));
        mat.insert("lp_set", MatVariable::from(run.config.laser_power_mw));
        mat.insert("lp_unit", MatVariable::from("mW"));
        if run.samples.iter().any(|s| s.monitor.is_some()) {
            let pout: Vec<f64> = run
                .samples
                .iter()
                .map(|s| s.monitor.map_or(f64::NAN, |m| m.pout))
                .collect();
            mat.insert("pout_dBm", MatVariable::from(pout));
        }
        matrw::save_matfile_v7(target, mat, false).map_err(|err| writer_err(err.to_string()))
    }
}

// ============================================================================
// JSON
// ============================================================================

/// The whole run, config and samples included.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonExport;

impl ExportWriter for JsonExport {
    fn format(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn write(&self, run: &ScanRun, path: &Path) -> Result<(), ExportError> {
        let mut file = create("json", path)?;
        serde_json::to_writer_pretty(&mut file, run)?;
        file.flush().map_err(|source| ExportError::Io {
            format: "json",
            path: path.to_path_buf(),
            source,
        })
    }
}

// ============================================================================
// Exporter
// ============================================================================

/// Per-format results of one export.
#[derive(Debug, Default)]
pub struct ExportReport {
    /// Files written, one per successful format.
    pub written: Vec<PathBuf>,
    /// One error per failed format.
    pub errors: Vec<ExportError>,
}

impl ExportReport {
    /// True when every format succeeded.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Export outcome published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEvent {
    /// Exported run.
    pub run: Uuid,
    /// Files written.
    pub written: Vec<PathBuf>,
    /// `(format, message)` for each failed format.
    pub failed: Vec<(String, String)>,
}

impl ExportEvent {
    /// Bus form of a report; errors become display strings.
    pub fn from_report(run: Uuid, report: &ExportReport) -> Self {
        Self {
            run,
            written: report.written.clone(),
            failed: report
                .errors
                .iter()
                .map(|err| (err.format().unwrap_or("export").to_string(), err.to_string()))
                .collect(),
        }
    }
}

/// Runs every configured writer over a run.
pub struct Exporter {
    writers: Vec<Box<dyn ExportWriter>>,
}

impl Default for Exporter {
    /// CSV and JSON, plus MAT when `storage_matlab` is enabled.
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut writers: Vec<Box<dyn ExportWriter>> = vec![Box::new(CsvExport), Box::new(JsonExport)];
        #[cfg(feature = "storage_matlab")]
        writers.push(Box::new(MatExport));
        Self::new(writers)
    }
}

impl Exporter {
    /// Exporter over exactly these writers.
    pub fn new(writers: Vec<Box<dyn ExportWriter>>) -> Self {
        Self { writers }
    }

    /// Format names, in writer order.
    pub fn formats(&self) -> Vec<&'static str> {
        self.writers.iter().map(|w| w.format()).collect()
    }

    /// `scan_<start>nm_<end>nm`, from the acquired range when there is one.
    pub fn default_base_name(run: &ScanRun) -> String {
        let (start, end) = match (run.samples.first(), run.samples.last()) {
            (Some(first), Some(last)) => (first.wavelength_nm, last.wavelength_nm),
            _ => (run.config.start_nm, run.config.end_nm),
        };
        format!("scan_{:.0}nm_{:.0}nm", start, end)
    }

    /// Writes `run` once per format into `dir`.
    ///
    /// Only a run that is not exportable at all, or a directory that cannot
    /// be created, fails the whole call. Per-format failures are collected
    /// in the report.
    pub fn export(&self, run: &ScanRun, dir: &Path, base_name: Option<&str>) -> Result<ExportReport, ExportError> {
        if !run.status.is_exportable() {
            return Err(ExportError::NotExportable(run.status));
        }
        fs::create_dir_all(dir).map_err(|source| ExportError::Io {
            format: "export",
            path: dir.to_path_buf(),
            source,
        })?;
        let base = base_name.map_or_else(|| Self::default_base_name(run), str::to_string);

        let mut report = ExportReport::default();
        for writer in &self.writers {
            let path = dir.join(format!("{}.{}", base, writer.extension()));
            match writer.write(run, &path) {
                Ok(()) => {
                    info!(run = %run.id, format = writer.format(), path = %path.display(), "scan exported");
                    report.written.push(path);
                }
                Err(err) => {
                    warn!(run = %run.id, format = writer.format(), error = %err, "export format failed");
                    if path.exists() {
                        let _ = fs::remove_file(&path);
                    }
                    report.errors.push(err);
                }
            }
        }
        Ok(report)
    }
}
