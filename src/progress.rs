use ffp_core::engine::ProgressObserver;
use indicatif::{ProgressBar, ProgressStyle};

/// Terminal progress bar for the chunks of one batch
pub struct BatchProgress {
    bar: ProgressBar,
}

impl BatchProgress {
    pub fn new(label: &str, total: usize) -> Self {
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} chunks ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let bar = ProgressBar::new(total as u64).with_style(style);
        bar.set_prefix(label.to_string());
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

impl ProgressObserver for BatchProgress {
    fn chunk_finished(&self, completed: usize, _total: usize) {
        // completions may be reported out of order
        if completed as u64 > self.bar.position() {
            self.bar.set_position(completed as u64);
        }
    }
}
