use anyhow::{Context, Result};
use futures::future::join_all;

/// Run two blocking calls on the blocking pool and wait for both.
/// The first error wins; the other call still runs to completion.
pub async fn join2<A, B, FA, FB>(a: FA, b: FB) -> Result<(A, B)>
where
    A: Send + 'static,
    B: Send + 'static,
    FA: FnOnce() -> Result<A> + Send + 'static,
    FB: FnOnce() -> Result<B> + Send + 'static,
{
    let left = tokio::task::spawn_blocking(a);
    let right = tokio::task::spawn_blocking(b);
    let (left, right) = tokio::join!(left, right);
    let left = left.context("blocking task panicked")??;
    let right = right.context("blocking task panicked")??;
    Ok((left, right))
}

/// One blocking call per item, all in flight at once. Results keep input
/// order and individual failures stay individual.
pub async fn map_blocking<I, T, F>(items: Vec<I>, f: F) -> Vec<Result<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Result<T> + Send + Sync + Clone + 'static,
{
    let tasks = items.into_iter().map(|item| {
        let f = f.clone();
        tokio::task::spawn_blocking(move || f(item))
    });
    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.context("blocking task panicked").and_then(|r| r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread")]
    async fn join2_runs_concurrently() {
        let started = Instant::now();
        let (a, b) = join2(
            || {
                std::thread::sleep(Duration::from_millis(150));
                Ok(1)
            },
            || {
                std::thread::sleep(Duration::from_millis(150));
                Ok("two")
            },
        )
        .await
        .unwrap();
        assert_eq!((a, b), (1, "two"));
        assert!(started.elapsed() < Duration::from_millis(290));
    }

    #[tokio::test]
    async fn join2_propagates_error() {
        let err = join2(|| Ok(1), || -> Result<u8> { anyhow::bail!("rules lookup failed") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rules lookup failed"));
    }

    #[tokio::test]
    async fn map_blocking_keeps_order_and_isolates_errors() {
        let results = map_blocking(vec![1, 2, 3], |n| {
            if n == 2 {
                anyhow::bail!("health check for {n} failed")
            }
            Ok(n * 10)
        })
        .await;
        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 10);
        assert!(results[1].is_err());
        assert_eq!(*results[2].as_ref().unwrap(), 30);
    }
}
