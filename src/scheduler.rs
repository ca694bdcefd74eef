//! Runs chunk work with bounded concurrency and fail-fast draining.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DownloadError, Result};
use crate::range::ChunkDescriptor;

/// Producer of chunk descriptors, pulled one at a time.
pub trait ChunkSource: Send {
    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<ChunkDescriptor>>>;
}

pub struct Scheduler {
    max_concurrency: usize,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(max_concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            cancel,
        }
    }

    /// Pull descriptors from `source` and run `work` on each, at most
    /// `max_concurrency` at a time. The source is only asked for the next
    /// descriptor once a slot is free.
    ///
    /// After the first failure nothing new is admitted; running work is left
    /// to finish, then the first error is returned.
    pub async fn run<S, W, Fut>(&self, source: &mut S, work: W) -> Result<()>
    where
        S: ChunkSource + ?Sized,
        W: Fn(ChunkDescriptor) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let slots = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut first_error: Option<DownloadError> = None;
        let mut admitted = 0usize;

        while first_error.is_none() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    record(&mut first_error, DownloadError::Cancelled);
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record_joined(&mut first_error, joined);
                    continue;
                }
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(DownloadError::Cancelled),
                next = source.next_chunk() => next,
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    record(&mut first_error, e);
                    break;
                }
            };

            admitted += 1;
            debug!(range = %chunk.range, admitted, "dispatching chunk");
            let fut = work(chunk);
            tasks.spawn(async move {
                let _permit = permit;
                fut.await
            });
        }

        if first_error.is_some() && !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "draining in-flight chunks");
        }
        while let Some(joined) = tasks.join_next().await {
            record_joined(&mut first_error, joined);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn record(first_error: &mut Option<DownloadError>, err: DownloadError) {
    if first_error.is_none() {
        if !err.is_cancelled() {
            warn!(error = %err, "chunk failed");
        }
        *first_error = Some(err);
    }
}

fn record_joined(
    first_error: &mut Option<DownloadError>,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => record(first_error, e),
        Err(e) => record(first_error, DownloadError::TaskJoin(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{Range, RemoteTarget};
    use crate::retry::RetryPolicy;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    struct VecSource {
        chunks: std::vec::IntoIter<ChunkDescriptor>,
        pulled: Arc<AtomicUsize>,
    }

    impl VecSource {
        fn new(count: u64, size: u64) -> Self {
            let target = Arc::new(RemoteTarget::new(
                Url::parse("http://example.com/f").unwrap(),
                Some(count * size),
            ));
            let chunks: Vec<_> = (0..count)
                .map(|i| {
                    ChunkDescriptor::new(
                        target.clone(),
                        Range::new(i * size, (i + 1) * size - 1),
                        RetryPolicy::default(),
                    )
                })
                .collect();
            Self {
                chunks: chunks.into_iter(),
                pulled: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ChunkSource for VecSource {
        fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<ChunkDescriptor>>> {
            let next = self.chunks.next();
            if next.is_some() {
                self.pulled.fetch_add(1, Ordering::SeqCst);
            }
            async move { Ok(next) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_bounded_and_disjoint() {
        let mut source = VecSource::new(20, 100);
        let active: Arc<Mutex<Vec<Range>>> = Arc::new(Mutex::new(Vec::new()));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(4, CancellationToken::new());

        scheduler
            .run(&mut source, |chunk| {
                let active = active.clone();
                let max_seen = max_seen.clone();
                let done = done.clone();
                async move {
                    {
                        let mut a = active.lock();
                        assert!(a.iter().all(|r| !r.overlaps(&chunk.range)));
                        a.push(chunk.range);
                        max_seen.fetch_max(a.len(), Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.lock().retain(|r| *r != chunk.range);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 20);
        let max = max_seen.load(Ordering::SeqCst);
        assert!(max <= 4 && max >= 2, "max concurrency {}", max);
    }

    #[tokio::test]
    async fn test_backpressure_limits_pulls() {
        let mut source = VecSource::new(50, 10);
        let pulled = source.pulled.clone();
        let release = CancellationToken::new();
        let scheduler = Scheduler::new(3, CancellationToken::new());

        let gate = release.clone();
        let run = async {
            scheduler
                .run(&mut source, |_chunk| {
                    let gate = gate.clone();
                    async move {
                        gate.cancelled().await;
                        Ok(())
                    }
                })
                .await
        };
        let check = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(pulled.load(Ordering::SeqCst), 3);
            release.cancel();
        };
        let (res, ()) = tokio::join!(run, check);
        res.unwrap();
        assert_eq!(pulled.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn test_first_error_stops_admission_and_drains() {
        let mut source = VecSource::new(100, 10);
        let pulled = source.pulled.clone();
        let finished = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(2, CancellationToken::new());

        let fin = finished.clone();
        let err = scheduler
            .run(&mut source, move |chunk| {
                let fin = fin.clone();
                async move {
                    if chunk.range.start == 30 {
                        return Err(DownloadError::RemoteRequest {
                            status: 500,
                            url: chunk.target.url.to_string(),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    fin.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(500));
        let pulled = pulled.load(Ordering::SeqCst);
        assert!(pulled < 10, "admitted {} chunks after failure", pulled);
        // every admitted sibling ran to completion
        assert_eq!(finished.load(Ordering::SeqCst), pulled - 1);
    }

    #[tokio::test]
    async fn test_cancellation_is_distinguished() {
        let mut source = VecSource::new(10, 10);
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(2, cancel.clone());

        let worker_cancel = cancel.clone();
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let run = scheduler.run(&mut source, move |_chunk| {
            let c = worker_cancel.clone();
            async move {
                c.cancelled().await;
                Err(DownloadError::Cancelled)
            }
        });
        let (res, ()) = tokio::join!(run, trigger);
        assert!(res.unwrap_err().is_cancelled());
    }
}
