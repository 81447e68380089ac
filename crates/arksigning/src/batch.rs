//! Batch driver: signs a directory of archives and app folders across a
//! worker pool.
//!
//! The input directory is scanned one level deep; ZIP archives (detected by
//! the `PK\x03\x04` prefix) and directories containing an app folder become
//! tasks. Workers pull tasks from a shared pool sized to the hardware (or
//! `--parallel=N`), each extracting into a private temp directory that is
//! removed on success and failure alike. The loaded identity is shared
//! read-only by every worker.

use crate::bundle::{find_app_folder, BundleSigner, SignOptions};
use crate::crypto::SigningIdentity;
use crate::ipa::{self, CompressionLevel};
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info};

use rayon::prelude::*;

/// One unit of batch work.
#[derive(Debug, Clone)]
pub struct SigningTask {
    pub input: PathBuf,
    pub output: PathBuf,
    pub is_archive: bool,
}

/// Completion metrics for one batch run.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Observer for batch progress. Calls are serialized by the driver.
pub trait ProgressSink: Send + Sync {
    fn task_started(&self, input: &Path, index: usize, total: usize);
    fn task_finished(&self, input: &Path, result: &Result<()>);
    fn batch_finished(&self, report: &BatchReport);
}

/// Default sink reporting through `tracing`.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn task_started(&self, input: &Path, index: usize, total: usize) {
        info!(input = %input.display(), "processing [{}/{}]", index, total);
    }

    fn task_finished(&self, input: &Path, result: &Result<()>) {
        match result {
            Ok(()) => info!(input = %input.display(), "signed"),
            Err(e) => error!(input = %input.display(), error = %e, "signing failed"),
        }
    }

    fn batch_finished(&self, report: &BatchReport) {
        info!(
            succeeded = report.succeeded,
            total = report.total,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "batch complete"
        );
    }
}

/// Batch run configuration.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Worker count; `None` selects the hardware concurrency. Always capped
    /// at the task count.
    pub parallel: Option<usize>,
    pub zip_level: CompressionLevel,
    pub sign: SignOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: None,
            zip_level: CompressionLevel::DEFAULT,
            sign: SignOptions::default(),
        }
    }
}

/// Scan the input directory one level deep for signable entries.
pub fn discover_tasks(input_dir: &Path, output_dir: &Path) -> Result<Vec<SigningTask>> {
    let mut tasks = Vec::new();

    let mut entries: Vec<_> = fs::read_dir(input_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    for entry in entries {
        let Some(name) = entry.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        let is_archive = entry.is_file() && ipa::is_zip_file(&entry);
        let is_app_dir = entry.is_dir() && find_app_folder(&entry).is_ok();
        if !is_archive && !is_app_dir {
            continue;
        }

        let stem = name.strip_suffix(".ipa").unwrap_or(&name);
        tasks.push(SigningTask {
            input: entry.clone(),
            output: output_dir.join(format!("{}_signed.ipa", stem)),
            is_archive,
        });
    }

    Ok(tasks)
}

/// Sign everything in `input_dir`, writing `<stem>_signed.ipa` files into
/// `output_dir`. Per-task failures are recorded and do not stop the batch.
pub fn run_batch(
    identity: &SigningIdentity,
    input_dir: &Path,
    output_dir: &Path,
    options: &BatchOptions,
    sink: &dyn ProgressSink,
) -> Result<BatchReport> {
    let tasks = discover_tasks(input_dir, output_dir)?;
    if tasks.is_empty() {
        return Err(Error::Bundle(format!(
            "no signable apps in {}",
            input_dir.display()
        )));
    }
    fs::create_dir_all(output_dir)?;

    let workers = options
        .parallel
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        })
        .clamp(1, tasks.len());
    info!(tasks = tasks.len(), workers, "starting batch");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| Error::Io(std::io::Error::other(format!("worker pool: {}", e))))?;

    let started = Instant::now();
    let next_index = AtomicUsize::new(0);
    let sink_gate = Mutex::new(());

    let outcomes: Vec<bool> = pool.install(|| {
        tasks
            .par_iter()
            .map(|task| {
                let index = next_index.fetch_add(1, Ordering::SeqCst) + 1;
                {
                    let _gate = sink_gate.lock().unwrap();
                    sink.task_started(&task.input, index, tasks.len());
                }

                let result = run_task(identity, task, options);
                let ok = result.is_ok();
                {
                    let _gate = sink_gate.lock().unwrap();
                    sink.task_finished(&task.input, &result);
                }
                ok
            })
            .collect()
    });

    let succeeded = outcomes.iter().filter(|ok| **ok).count();
    let report = BatchReport {
        total: tasks.len(),
        succeeded,
        failed: tasks.len() - succeeded,
        elapsed: started.elapsed(),
    };
    sink.batch_finished(&report);
    Ok(report)
}

fn run_task(identity: &SigningIdentity, task: &SigningTask, options: &BatchOptions) -> Result<()> {
    let mut sign_options = options.sign.clone();

    if task.is_archive {
        // Private extraction directory; removed on drop on every path.
        let temp = tempfile::Builder::new()
            .prefix("arksigning_folder_")
            .tempdir()?;
        ipa::extract_archive(&task.input, temp.path())?;

        // Extracted archives cannot reuse a cache from a previous run.
        sign_options.force = true;
        sign_options.enable_cache = false;

        let app_folder = BundleSigner::new(identity, sign_options).sign_folder(temp.path())?;
        ipa::create_ipa(&app_folder, &task.output, options.zip_level)?;
    } else {
        let app_folder = BundleSigner::new(identity, sign_options).sign_folder(&task.input)?;
        ipa::create_ipa(&app_folder, &task.output, options.zip_level)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_fake_ipa(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        zip.start_file("Payload/X.app/Info.plist", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"<plist/>").unwrap();
        zip.finish().unwrap();
    }

    fn write_app_dir(root: &Path) {
        let app = root.join("Payload/Demo.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(
            app.join("Info.plist"),
            br#"<plist version="1.0"><dict>
<key>CFBundleIdentifier</key><string>d</string>
<key>CFBundleExecutable</key><string>Demo</string>
</dict></plist>"#,
        )
        .unwrap();
    }

    #[test]
    fn discovery_classifies_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("in");
        let output = tmp.path().join("out");
        fs::create_dir_all(&input).unwrap();

        write_fake_ipa(&input.join("alpha.ipa"));
        write_app_dir(&input.join("beta"));
        fs::write(input.join("notes.txt"), b"irrelevant").unwrap();
        fs::create_dir_all(input.join("empty_dir")).unwrap();

        let tasks = discover_tasks(&input, &output).unwrap();
        assert_eq!(tasks.len(), 2);

        let archive = tasks.iter().find(|t| t.is_archive).unwrap();
        assert_eq!(archive.output, output.join("alpha_signed.ipa"));

        let folder = tasks.iter().find(|t| !t.is_archive).unwrap();
        assert_eq!(folder.output, output.join("beta_signed.ipa"));
    }

    #[test]
    fn discovery_of_empty_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("in");
        fs::create_dir_all(&input).unwrap();
        let tasks = discover_tasks(&input, tmp.path()).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn report_success_accounting() {
        let report = BatchReport {
            total: 3,
            succeeded: 2,
            failed: 1,
            elapsed: Duration::from_secs(1),
        };
        assert!(!report.all_succeeded());
    }
}
