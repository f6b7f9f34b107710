use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Upper bound for buffers sized from untrusted length hints.
pub(crate) const MAX_PREALLOCATION: u64 = 256 * 1024 * 1024;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared flag raised by the caller to abort a download or a running runtime.
pub type CancelFlag = Arc<AtomicBool>;

/// Check whether an optional cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: Option<&AtomicBool>) -> bool {
    cancel
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Resolve once `cancel` is raised; never resolves without a flag.
///
/// Meant to be raced with `tokio::select!` against work that has no
/// cancellation point of its own.
pub async fn wait_for_cancel(cancel: Option<&AtomicBool>) {
    let Some(flag) = cancel else {
        std::future::pending::<()>().await;
        return;
    };
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
    }
}

/// Initial buffer capacity for a payload announcing `hint` bytes.
pub(crate) fn preallocation(hint: u64) -> usize {
    usize::try_from(hint.min(MAX_PREALLOCATION)).unwrap_or(0)
}

/// Render a human-friendly byte count.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;

    let value = bytes as f64;
    if value < KIB {
        format!("{bytes} B")
    } else if value < MIB {
        format!("{:.1} KB", value / KIB)
    } else if value < GIB {
        format!("{:.1} MB", value / MIB)
    } else {
        format!("{:.1} GB", value / GIB)
    }
}

/// Compute download progress as a percentage, or `None` when the total is unknown.
#[must_use]
pub fn progress_percent(downloaded: u64, total: Option<u64>) -> Option<f32> {
    match total {
        Some(total) if total > 0 => Some((downloaded as f32 / total as f32) * 100.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_size_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2_048), "2.0 KB");
        assert_eq!(format_size(5_242_880), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn calculates_progress_percent() {
        assert_eq!(progress_percent(0, Some(10)), Some(0.0));
        assert_eq!(progress_percent(5, Some(10)), Some(50.0));
        assert_eq!(progress_percent(10, Some(10)), Some(100.0));
        assert_eq!(progress_percent(5, None), None);
        assert_eq!(progress_percent(5, Some(0)), None);
    }

    #[test]
    fn respects_optional_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!cancel_requested(Some(flag.as_ref())));
        flag.store(true, Ordering::SeqCst);
        assert!(cancel_requested(Some(flag.as_ref())));
        assert!(!cancel_requested(None));
    }

    #[test]
    fn caps_preallocation_from_untrusted_sizes() {
        assert_eq!(preallocation(1024), 1024);
        assert_eq!(preallocation(u64::MAX), MAX_PREALLOCATION as usize);
    }

    #[tokio::test]
    async fn wait_for_cancel_resolves_once_raised() {
        let flag = Arc::new(AtomicBool::new(false));
        let trigger = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.store(true, Ordering::SeqCst);
        });
        tokio::time::timeout(Duration::from_secs(5), wait_for_cancel(Some(flag.as_ref())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_cancel_without_flag_never_resolves() {
        let waited =
            tokio::time::timeout(Duration::from_millis(100), wait_for_cancel(None)).await;
        assert!(waited.is_err());
    }
}
