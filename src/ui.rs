//! Terminal progress reporting.
//!
//! One `MultiProgress` owns every bar, and tracing output is routed
//! through a writer that suspends the bars while a log line is printed,
//! so logs and progress don't fight over the terminal.

use std::{io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Shared UI state. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// A UI that draws nothing, for tests.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::with_draw_target(
                indicatif::ProgressDrawTarget::hidden(),
            )),
        }
    }

    /// A writer for `tracing` output that won't garble the bars.
    pub fn stderr_writer(&self) -> ProgressSafeStderr {
        ProgressSafeStderr { ui: self.clone() }
    }

    /// A determinate bar for a phase with a known item count.
    pub fn phase_bar(&self, message: &str, len: u64) -> ProgressBar {
        let bar = ProgressBar::new(len).with_style(
            ProgressStyle::default_bar()
                .template(
                    "  {msg:32} {pos:>5}/{len:5} {elapsed_precise} {wide_bar:.cyan/blue}",
                )
                .expect("bad progress bar template"),
        );
        let bar = self.multi_progress.add(bar);
        bar.set_message(message.to_owned());
        bar.enable_steady_tick(Duration::from_millis(250));
        bar
    }

    /// A spinner for work with no known length.
    pub fn spinner(&self, message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner().with_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {msg}")
                .expect("bad spinner template"),
        );
        let spinner = self.multi_progress.add(spinner);
        spinner.set_message(message.to_owned());
        spinner.enable_steady_tick(Duration::from_millis(250));
        spinner
    }
}

/// Writes to stderr with the progress bars suspended.
#[derive(Clone)]
pub struct ProgressSafeStderr {
    ui: Ui,
}

impl io::Write for ProgressSafeStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress
            .suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ProgressSafeStderr {
    type Writer = ProgressSafeStderr;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
