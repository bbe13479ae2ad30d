//! Terminal progress for chunked transfers

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Instant;

use crate::codec::OperationKind;
use crate::transfer::{ProgressObserver, TransferProgress};

/// Byte progress bar shown while an upload or download streams chunks.
pub struct TransferBar {
    bar: Option<ProgressBar>,
    start_time: Instant,
    quiet: bool,
}

impl TransferBar {
    pub fn new(quiet: bool) -> Self {
        Self {
            bar: None,
            start_time: Instant::now(),
            quiet,
        }
    }
}

impl ProgressObserver for TransferBar {
    fn started(&mut self, kind: OperationKind, name: &str, total: u64) {
        self.start_time = Instant::now();
        if self.quiet {
            return;
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.green/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(format!("{kind} {name}"));
        self.bar = Some(bar);
    }

    fn advanced(&mut self, progress: &TransferProgress) {
        if let Some(bar) = &self.bar {
            bar.set_position(progress.bytes_transferred);
        }
    }

    fn finished(&mut self, progress: &TransferProgress) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if let Some(bar) = self.bar.take() {
            let throughput = if elapsed > 0.0 {
                progress.bytes_transferred as f64 / elapsed / 1_048_576.0
            } else {
                0.0
            };
            bar.finish_with_message(format!(
                "done {:.1} MB in {:.1}s ({:.1} MB/s)",
                progress.bytes_transferred as f64 / 1_048_576.0,
                elapsed,
                throughput
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_bar_tracks_nothing() {
        let mut bar = TransferBar::new(true);
        bar.started(OperationKind::Upload, "a", 10);
        assert!(bar.bar.is_none());
        let p = TransferProgress::new(10, 4);
        bar.advanced(&p);
        bar.finished(&p);
    }

    #[test]
    fn test_bar_follows_progress() {
        let mut bar = TransferBar::new(false);
        bar.started(OperationKind::Download, "b", 10);
        let mut p = TransferProgress::new(10, 4);
        p.record(4).unwrap();
        bar.advanced(&p);
        assert_eq!(bar.bar.as_ref().unwrap().position(), 4);
        p.record(6).unwrap();
        bar.finished(&p);
        assert!(bar.bar.is_none());
    }
}
