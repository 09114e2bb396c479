//! Bounded polling for conditions that complete asynchronously and are not
//! directly observable, such as a freshly formatted partition showing up in
//! the mount table.

use crate::{FlashResult, OperationContext};
use std::future::Future;
use std::time::Duration;

/// Fixed-interval, bounded-attempt polling policy.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl FixedInterval {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Run `probe` once per attempt until it yields a value.
    ///
    /// The probe receives the 1-based attempt number, so callers can issue
    /// an explicit kick (e.g. a mount request) after a few failed probes.
    /// Exactly `max_attempts` probes are made, each followed by one interval
    /// sleep; `Ok(None)` means the attempts were exhausted. Cancellation is
    /// checked before every probe and surfaces as `FlashError::Cancelled`.
    pub async fn poll_until<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        mut probe: F,
    ) -> FlashResult<Option<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = FlashResult<Option<T>>>,
    {
        for attempt in 1..=self.max_attempts {
            ctx.check()?;
            if let Some(found) = probe(attempt).await? {
                return Ok(Some(found));
            }
            tokio::time::sleep(self.interval).await;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlashError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_returns_first_success() {
        let policy = FixedInterval::new(5, Duration::from_millis(1));
        let ctx = OperationContext::new();

        let result = policy
            .poll_until(&ctx, |attempt| async move {
                Ok(if attempt == 3 { Some("mounted") } else { None })
            })
            .await
            .unwrap();

        assert_eq!(result, Some("mounted"));
    }

    #[tokio::test]
    async fn test_exhausts_exactly_max_attempts() {
        let policy = FixedInterval::new(4, Duration::from_millis(1));
        let ctx = OperationContext::new();
        let probes = AtomicU32::new(0);

        let result: Option<()> = policy
            .poll_until(&ctx, |_| {
                probes.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await
            .unwrap();

        assert_eq!(result, None);
        assert_eq!(probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let policy = FixedInterval::new(100, Duration::from_millis(1));
        let ctx = OperationContext::new();
        let probes = AtomicU32::new(0);

        let result: FlashResult<Option<()>> = policy
            .poll_until(&ctx, |_| {
                let count = probes.fetch_add(1, Ordering::SeqCst) + 1;
                if count == 2 {
                    ctx.cancel();
                }
                async { Ok(None) }
            })
            .await;

        assert!(matches!(result, Err(FlashError::Cancelled)));
        assert!(probes.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_probe_errors_propagate() {
        let policy = FixedInterval::new(3, Duration::from_millis(1));
        let ctx = OperationContext::new();

        let result: FlashResult<Option<()>> = policy
            .poll_until(&ctx, |_| async {
                Err(FlashError::DeviceNotFound("disk9".to_string()))
            })
            .await;

        assert!(matches!(result, Err(FlashError::DeviceNotFound(_))));
    }
}
