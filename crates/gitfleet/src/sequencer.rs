//! Bounded-parallel execution of homogeneous work items.
//!
//! Launching one subprocess per repository at once would exhaust file
//! descriptors on large fleets, so all fan-out goes through [`run_chunked`]:
//! strict chunks of `width` items run concurrently, chunks are issued in
//! order, and results come back in input order. The bound is a contract,
//! not a tuning knob.

use std::future::Future;

/// Default number of concurrently running work items.
pub const DEFAULT_WIDTH: usize = 2;

/// Apply `work` to every item, at most `width` in flight, preserving input
/// order in the result. The first error wins: the chunk it occurred in is
/// drained, no later chunk is started, and completed results are dropped.
pub async fn run_chunked<T, R, E, F, Fut>(
    items: Vec<T>,
    width: usize,
    work: F,
) -> std::result::Result<Vec<R>, E>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>>,
{
    let width = width.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut items = items.into_iter();

    loop {
        let chunk: Vec<T> = items.by_ref().take(width).collect();
        if chunk.is_empty() {
            return Ok(results);
        }
        let outcomes = futures::future::join_all(chunk.into_iter().map(&work)).await;
        for outcome in outcomes {
            results.push(outcome?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn results_preserve_input_order() {
        let out: Result<Vec<i32>, ()> = run_chunked(vec![3, 1, 2, 5, 4], 2, |n| async move {
            // Later chunk members finish first; order must still hold.
            tokio::time::sleep(std::time::Duration::from_millis(n as u64)).await;
            Ok(n * 10)
        })
        .await;
        assert_eq!(out.unwrap(), vec![30, 10, 20, 50, 40]);
    }

    #[tokio::test]
    async fn first_error_stops_later_chunks() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let out: Result<Vec<usize>, String> = run_chunked(vec![0, 1, 2, 3, 4, 5], 2, |n| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if n == 1 {
                    Err(format!("item {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap_err(), "item 1 failed");
        // The failing chunk ran to completion; chunks after it never started.
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn width_is_clamped_to_one() {
        let out: Result<Vec<u8>, ()> = run_chunked(vec![1, 2, 3], 0, |n| async move { Ok(n) }).await;
        assert_eq!(out.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let out: Result<Vec<u8>, ()> = run_chunked(Vec::new(), 2, |n| async move { Ok(n) }).await;
        assert!(out.unwrap().is_empty());
    }
}
