//! Per-key memoization of async lookups.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Runs each keyed lookup at most once; concurrent callers for the same key
/// wait on the first one. Failed lookups are not cached.
pub struct MemoizedLookup<T> {
    cells: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for MemoizedLookup<T> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> MemoizedLookup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_try_init<F, Fut, E>(&self, key: &str, init: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(cells.entry(key.to_string()).or_default())
        };
        cell.get_or_try_init(init).await.cloned()
    }

    /// Number of keys resolved so far.
    pub fn resolved(&self) -> usize {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.values().filter(|c| c.initialized()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_same_key_runs_once() {
        let memo = MemoizedLookup::<u64>::new();
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        for _ in 0..3 {
            let v: Result<u64, String> = memo
                .get_or_try_init("apache/lake", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await;
            assert_eq!(v.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.resolved(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_lookup() {
        let memo = Arc::new(MemoizedLookup::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let memo = Arc::clone(&memo);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                memo.get_or_try_init("job", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok::<_, String>("folder/job".to_string())
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "folder/job");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_retried() {
        let memo = MemoizedLookup::<u64>::new();
        let first: Result<u64, String> = memo
            .get_or_try_init("k", || async { Err("boom".to_string()) })
            .await;
        assert!(first.is_err());
        let second: Result<u64, String> = memo.get_or_try_init("k", || async { Ok(7) }).await;
        assert_eq!(second.unwrap(), 7);
        let other: Result<u64, String> = memo.get_or_try_init("k2", || async { Ok(1) }).await;
        assert_eq!(other.unwrap(), 1);
        assert_eq!(memo.resolved(), 2);
    }
}
