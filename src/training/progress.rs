//! Per-run step reporting: a progress bar when built with `progress-bar`,
//! periodic log lines otherwise.

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

pub struct StepProgress {
    label: String,
    total: usize,
    log_every: usize,
    #[cfg(feature = "progress-bar")]
    bar: ProgressBar,
}

impl StepProgress {
    pub fn new(label: impl Into<String>, total: usize, log_every: usize) -> Self {
        let label = label.into();
        #[cfg(feature = "progress-bar")]
        let bar = {
            let bar = ProgressBar::new(total as u64);
            if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} {elapsed_precise}") {
                bar.set_style(style.progress_chars("=> "));
            }
            bar.set_message(label.clone());
            bar
        };
        Self {
            label,
            total,
            log_every: log_every.max(1),
            #[cfg(feature = "progress-bar")]
            bar,
        }
    }

    /// Record a finished step (1-based) and its total loss.
    pub fn step(&self, step: usize, loss: f32) {
        #[cfg(feature = "progress-bar")]
        {
            self.bar.set_position(step as u64);
            self.bar.set_message(format!("{} loss {:.4}", self.label, loss));
        }
        if step % self.log_every == 0 || step == self.total {
            #[cfg(feature = "progress-bar")]
            log::debug!("{} | Step {}/{} | Loss: {:.4}", self.label, step, self.total, loss);
            #[cfg(not(feature = "progress-bar"))]
            log::info!("{} | Step {}/{} | Loss: {:.4}", self.label, step, self.total, loss);
        }
    }

    pub fn finish(&self, message: &str) {
        #[cfg(feature = "progress-bar")]
        self.bar.finish_and_clear();
        log::info!("{} | {}", self.label, message);
    }
}
