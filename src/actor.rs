//! Helpers for `tokio::select!` actor loops.
//!
//! Optional receivers, deadlines and tasks are polled as futures that stay
//! pending while absent, so a loop can list every source unconditionally.

use std::future::pending;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until};

/// Receives from `rx`, or never resolves if there is no receiver.
pub(crate) async fn recv_opt<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

/// Sleeps until `deadline`, or never resolves if there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Joins the task in `slot` and clears it, or never resolves if empty.
pub(crate) async fn join_opt<T>(slot: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    let output = match slot.as_mut() {
        Some(handle) => handle.await,
        None => pending().await,
    };
    *slot = None;
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio_test::{assert_pending, task};

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_opt_none_stays_pending() {
        let result = tokio::time::timeout(Duration::from_secs(60), sleep_until_opt(None)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_absent_sources_never_resolve() {
        let mut recv = task::spawn(recv_opt::<u8>(None));
        assert_pending!(recv.poll());
        assert_pending!(recv.poll());

        let mut sleep = task::spawn(sleep_until_opt(None));
        assert_pending!(sleep.poll());

        let mut slot: Option<JoinHandle<()>> = None;
        let mut join = task::spawn(join_opt(&mut slot));
        assert_pending!(join.poll());
    }

    #[tokio::test]
    async fn test_join_opt_clears_slot() {
        let mut slot = Some(tokio::spawn(async { 7 }));
        assert_eq!(join_opt(&mut slot).await.expect("join"), 7);
        assert!(slot.is_none());
    }

    #[tokio::test]
    async fn test_recv_opt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(1).expect("send");
        assert_eq!(recv_opt(Some(&mut rx)).await, Some(1));
        drop(tx);
        assert_eq!(recv_opt(Some(&mut rx)).await, None);
    }
}
