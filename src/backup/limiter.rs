// dbbackup/src/backup/limiter.rs
use std::sync::OnceLock;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Default cap on concurrently running dump subprocesses.
pub const DEFAULT_MAX_PROCESSES: usize = 10;

static LIMITER: OnceLock<Semaphore> = OnceLock::new();

/// Installs the process-wide subprocess limit. Only the first call takes
/// effect; later calls are ignored so the cap stays stable for the lifetime
/// of the run.
pub fn init(max_processes: usize) {
    let capacity = if max_processes == 0 {
        DEFAULT_MAX_PROCESSES
    } else {
        max_processes
    };
    let _ = LIMITER.set(Semaphore::new(capacity));
}

/// Waits for a free subprocess slot. The permit holds the slot until drop.
pub async fn acquire() -> SemaphorePermit<'static> {
    let semaphore = LIMITER.get_or_init(|| Semaphore::new(DEFAULT_MAX_PROCESSES));
    // The semaphore is never closed, so acquire can only fail if it were.
    semaphore
        .acquire()
        .await
        .unwrap_or_else(|_| unreachable!("subprocess limiter closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_limiter_bounds_concurrency() {
        init(5);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = acquire().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 5);
    }
}
