// kiln/src/cli/status.rs
use std::collections::HashMap;
use std::time::Instant;

use colored::*;
use kiln_common::pipeline::PipelineEvent;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Queued,
    Downloading,
    Downloaded,
    Building,
    Linking,
    Success,
    Skipped,
    Failed,
}

impl JobStatus {
    fn display_state(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Downloaded => "downloaded",
            JobStatus::Building => "building",
            JobStatus::Linking => "linking",
            JobStatus::Success => "success",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
        }
    }

    fn colored_state(&self) -> ColoredString {
        let state = format!("{:<11}", self.display_state());
        match self {
            JobStatus::Queued => state.dimmed(),
            JobStatus::Downloading => state.yellow(),
            JobStatus::Downloaded => state.green(),
            JobStatus::Building => state.magenta(),
            JobStatus::Linking => state.cyan(),
            JobStatus::Success => state.green().bold(),
            JobStatus::Skipped => state.blue().bold(),
            JobStatus::Failed => state.red().bold(),
        }
    }

    fn is_done(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Skipped | JobStatus::Failed)
    }
}

struct JobInfo {
    status: JobStatus,
    slot: usize,
    size_bytes: Option<u64>,
}

/// Line-oriented progress printer: one line per state change, prefixed with
/// the job's slot number and the overall progress.
struct StatusPrinter {
    jobs: HashMap<String, JobInfo>,
    total_jobs: usize,
    next_slot: usize,
    start_time: Instant,
    logs_buffer: Vec<String>,
}

impl StatusPrinter {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            total_jobs: 0,
            next_slot: 1,
            start_time: Instant::now(),
            logs_buffer: Vec::new(),
        }
    }

    fn done_count(&self) -> usize {
        self.jobs.values().filter(|j| j.status.is_done()).count()
    }

    fn update(&mut self, target_id: &str, status: JobStatus, detail: Option<String>) {
        let slot = match self.jobs.get_mut(target_id) {
            Some(job) => {
                // Terminal states are final.
                if job.status.is_done() {
                    return;
                }
                job.status = status;
                job.slot
            }
            None => {
                let slot = self.next_slot;
                self.next_slot += 1;
                self.jobs.insert(
                    target_id.to_string(),
                    JobInfo {
                        status,
                        slot,
                        size_bytes: None,
                    },
                );
                slot
            }
        };
        let progress = format!("[{}/{}]", self.done_count(), self.total_jobs.max(self.jobs.len()));
        let size = self
            .jobs
            .get(target_id)
            .and_then(|j| j.size_bytes)
            .map(format_bytes)
            .unwrap_or_default();
        println!(
            "{} {} {} {:<20} {}",
            progress.dimmed(),
            format!("#{slot:02}").cyan(),
            status.colored_state(),
            target_id.cyan(),
            detail.unwrap_or(size).dimmed()
        );
    }

    fn set_size(&mut self, target_id: &str, size_bytes: u64) {
        if let Some(job) = self.jobs.get_mut(target_id) {
            job.size_bytes = Some(size_bytes);
        }
    }

    fn handle(&mut self, event: PipelineEvent) -> bool {
        match event {
            PipelineEvent::PipelineStarted { total_jobs } => {
                self.total_jobs = total_jobs;
                self.start_time = Instant::now();
                println!(
                    "{}{}",
                    "==> ".bold().blue(),
                    format!("Installing {total_jobs} formula node(s)").bold()
                );
            }
            PipelineEvent::OptionWarning { message } => {
                eprintln!("{} {}", "Warning:".yellow().bold(), message);
            }
            PipelineEvent::JobDispatchedToCore { target_id } => {
                self.update(&target_id, JobStatus::Queued, None);
            }
            PipelineEvent::DownloadStarted { target_id, url } => {
                self.update(&target_id, JobStatus::Downloading, Some(url));
            }
            PipelineEvent::DownloadFinished {
                target_id,
                size_bytes,
                ..
            } => {
                self.set_size(&target_id, size_bytes);
                self.update(&target_id, JobStatus::Downloaded, None);
            }
            PipelineEvent::CacheHit { target_id, digest } => {
                let short = digest.chars().take(12).collect::<String>();
                self.update(&target_id, JobStatus::Downloaded, Some(format!("cached bottle {short}")));
            }
            PipelineEvent::IntegrityFailure { target_id, error } => {
                self.logs_buffer.push(format!(
                    "{} {}: {}",
                    "Integrity check failed:".yellow(),
                    target_id.cyan(),
                    error
                ));
            }
            PipelineEvent::BuildStarted { target_id } => {
                self.update(&target_id, JobStatus::Building, None);
            }
            PipelineEvent::StepStarted { target_id, step } => {
                self.update(&target_id, JobStatus::Building, Some(step));
            }
            PipelineEvent::LinkStarted { target_id } => {
                self.update(&target_id, JobStatus::Linking, None);
            }
            PipelineEvent::JobSuccess { target_id, keg } => {
                self.update(&target_id, JobStatus::Success, Some(keg.display().to_string()));
            }
            PipelineEvent::JobSkipped { target_id, reason } => {
                self.update(&target_id, JobStatus::Skipped, Some(reason));
            }
            PipelineEvent::JobFailed { target_id, error } => {
                self.update(&target_id, JobStatus::Failed, None);
                self.logs_buffer.push(format!(
                    "{} {}: {}",
                    "✗".red().bold(),
                    target_id.cyan(),
                    error.red()
                ));
            }
            PipelineEvent::LogInfo { message } => self.logs_buffer.push(message),
            PipelineEvent::LogWarn { message } => {
                self.logs_buffer.push(message.yellow().to_string());
            }
            PipelineEvent::LogError { message } => {
                self.logs_buffer.push(message.red().to_string());
            }
            PipelineEvent::PipelineFinished {
                duration_secs,
                success_count,
                skipped_count,
                fail_count,
            } => {
                if !self.logs_buffer.is_empty() {
                    println!();
                    for log in &self.logs_buffer {
                        println!("{log}");
                    }
                }
                println!(
                    "\n{}: {}  {}: {}  {}: {}  {}: {}  {}: {:.2}s",
                    "Total".bold(),
                    self.total_jobs,
                    "Installed".green().bold(),
                    success_count,
                    "Skipped".blue().bold(),
                    skipped_count,
                    "Failed".red().bold(),
                    fail_count,
                    "Elapsed".bold(),
                    duration_secs.max(self.start_time.elapsed().as_secs_f64())
                );
                return false;
            }
            PipelineEvent::JobProcessingStarted { .. } => {}
        }
        true
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;

    while value >= 1000.0 && unit_idx < UNITS.len() - 1 {
        value /= 1000.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{bytes}B")
    } else {
        format!("{:.1}{}", value, UNITS[unit_idx])
    }
}

/// Prints pipeline events until the run finishes or every sender is gone.
pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut printer = StatusPrinter::new();
    loop {
        match event_rx.recv().await {
            Ok(event) => {
                if !printer.handle(event) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Status printer lagged, {} event(s) dropped", skipped);
            }
        }
    }
}
