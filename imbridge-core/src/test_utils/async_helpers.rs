//! Async test helpers
//!
//! Receiving framework events with timeouts, plus generic timeout wrappers.

use std::future::Future;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

use crate::framework::FrameworkEvent;

/// Receive the next event, giving up after `duration`
///
/// Lag is skipped over; only a timeout or a closed channel is an error.
pub async fn recv_timeout<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, async {
        loop {
            match rx.recv().await {
                Ok(value) => return Ok(value),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(RecvTimeoutError::Closed),
            }
        }
    })
    .await
    .map_err(|_| RecvTimeoutError::Timeout)?
}

/// Receive events until one matches `predicate`
pub async fn recv_matching<T, F>(
    rx: &mut broadcast::Receiver<T>,
    duration: Duration,
    mut predicate: F,
) -> Result<T, RecvTimeoutError>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    timeout(duration, async {
        loop {
            match rx.recv().await {
                Ok(value) if predicate(&value) => return Ok(value),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(RecvTimeoutError::Closed),
            }
        }
    })
    .await
    .map_err(|_| RecvTimeoutError::Timeout)?
}

/// Everything already queued for `rx`, without waiting
pub fn drain_events(rx: &mut broadcast::Receiver<FrameworkEvent>) -> Vec<FrameworkEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Run a future with a timeout, returning Ok(result) or Err on timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    Elapsed,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimeoutError {}

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::EventBroadcaster;

    #[tokio::test]
    async fn test_recv_timeout_elapses() {
        let events = EventBroadcaster::new(4);
        let mut rx = events.subscribe();
        let result = recv_timeout(&mut rx, Duration::from_millis(10)).await;
        assert_eq!(result, Err(RecvTimeoutError::Timeout));
    }

    #[tokio::test]
    async fn test_recv_matching_skips_other_events() {
        let events = EventBroadcaster::new(4);
        let mut rx = events.subscribe();
        events.emit(FrameworkEvent::RoomListingChanged { listing: true });
        events.emit(FrameworkEvent::RoomListingChanged { listing: false });

        let event = recv_matching(&mut rx, Duration::from_secs(1), |event| {
            matches!(event, FrameworkEvent::RoomListingChanged { listing: false })
        })
        .await
        .unwrap();
        assert_eq!(event, FrameworkEvent::RoomListingChanged { listing: false });
        assert!(drain_events(&mut rx).is_empty());
    }
}
