//! Transfer progress reporting
//!
//! A [`ProgressReporter`] travels with a request (and its redirected or
//! resumed successors); the transport publishes byte counts into it and any
//! number of observers hold the receiving end of a `watch` channel.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Bytes moved so far for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes in the destination, including any resumed prefix
    pub received: u64,
    /// Total size when the server announced it
    pub expected: Option<u64>,
}

impl TransferProgress {
    pub fn new(received: u64, expected: Option<u64>) -> Self {
        Self { received, expected }
    }

    pub fn fraction(&self) -> Option<f64> {
        self.expected.map(|total| {
            if total == 0 {
                1.0
            } else {
                (self.received as f64 / total as f64).min(1.0)
            }
        })
    }
}

/// Publishing side of a progress channel
#[derive(Clone)]
pub struct ProgressReporter {
    sender: Arc<watch::Sender<TransferProgress>>,
}

impl ProgressReporter {
    /// A reporter and its first observer
    pub fn channel() -> (Self, watch::Receiver<TransferProgress>) {
        let (sender, receiver) = watch::channel(TransferProgress::default());
        (
            Self {
                sender: Arc::new(sender),
            },
            receiver,
        )
    }

    /// Another observer of the same transfer
    pub fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.sender.subscribe()
    }

    pub fn report(&self, progress: TransferProgress) {
        // Publishing with no observers left is fine
        self.sender.send_replace(progress);
    }

    pub fn current(&self) -> TransferProgress {
        *self.sender.borrow()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction() {
        assert_eq!(TransferProgress::new(5, None).fraction(), None);
        assert_eq!(TransferProgress::new(25, Some(100)).fraction(), Some(0.25));
        assert_eq!(TransferProgress::new(0, Some(0)).fraction(), Some(1.0));
    }

    #[tokio::test]
    async fn test_observers_see_latest_report() {
        let (reporter, mut first) = ProgressReporter::channel();
        let second = reporter.subscribe();

        reporter.report(TransferProgress::new(10, Some(40)));
        reporter.report(TransferProgress::new(40, Some(40)));

        first.changed().await.unwrap();
        assert_eq!(*first.borrow(), TransferProgress::new(40, Some(40)));
        assert_eq!(second.borrow().received, 40);
    }

    #[test]
    fn test_report_without_observers() {
        let (reporter, receiver) = ProgressReporter::channel();
        drop(receiver);
        reporter.report(TransferProgress::new(3, None));
        assert_eq!(reporter.current().received, 3);
    }
}
