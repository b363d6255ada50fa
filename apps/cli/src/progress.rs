//! Progress bar utilities for CLI transfers

use bundlekit_core::TransferJob;
use bundlekit_types::EngineEvent;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use uuid::Uuid;

/// Manages progress bars for the jobs of one engine
pub struct TransferProgress {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
}

impl TransferProgress {
    /// Bars are drawn only when `visible`; JSON and table output stay clean
    pub fn new(visible: bool) -> Self {
        let multi = MultiProgress::new();
        if !visible {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self {
            multi,
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a job
    pub fn add_job(&mut self, job: &TransferJob) {
        let pb = self.multi.add(ProgressBar::new(job.size()));

        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:20} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }

        pb.set_message(job.name().to_string());
        self.bars.insert(job.id(), pb);
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::JobStarted {
                id,
                name,
                attempt,
                resumed_from,
                ..
            } => {
                if let Some(pb) = self.bars.get(id) {
                    pb.reset();
                    pb.set_position(*resumed_from);
                    if *attempt > 0 {
                        pb.println(format!(
                            "{} retrying {} (attempt {})",
                            style("↻").yellow(),
                            name,
                            attempt + 1
                        ));
                    }
                }
            }

            EngineEvent::Progress { id, bytes, total } => {
                if let Some(pb) = self.bars.get(id) {
                    if let Some(total) = total {
                        pb.set_length(*total);
                    }
                    pb.set_position(*bytes);
                }
            }

            EngineEvent::AttemptFailed { id, error, .. } => {
                if let Some(pb) = self.bars.get(id) {
                    pb.println(format!("{} {}", style("!").yellow(), error));
                }
            }

            EngineEvent::JobCompleted { id, name, error } => {
                if let Some(pb) = self.bars.get(id) {
                    match error {
                        None => pb.finish_with_message(format!(
                            "{} {}",
                            style("✓").green().bold(),
                            name
                        )),
                        Some(error) => pb.abandon_with_message(format!(
                            "{} {}: {}",
                            style("✗").red().bold(),
                            name,
                            error
                        )),
                    }
                }
            }
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}
