//! Wait helpers shared by the chat and call session drivers
//!
//! Each helper turns an optional source into a future that never resolves when the
//! source is absent, so a session can always `select!` over the same set of branches.

use std::future::pending;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::identity::IdentityStatus;

/// Next item from `rx`, or never when there is no receiver
pub(crate) async fn recv_or_pending<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

/// Resolve at `deadline`, or never when there is none
pub(crate) async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Resolve once the identity is released or its owner is gone
pub(crate) async fn identity_released(status: &mut watch::Receiver<IdentityStatus>) {
    loop {
        if status.borrow_and_update().is_released() {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_absent_sources_stay_pending() {
        let waited = tokio::time::timeout(
            Duration::from_millis(10),
            recv_or_pending::<u8>(None),
        )
        .await;
        assert!(waited.is_err());

        let waited =
            tokio::time::timeout(Duration::from_millis(10), sleep_until_or_pending(None)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_identity_released_on_status_or_drop() {
        let (tx, mut rx) = watch::channel(IdentityStatus::Unassigned);
        tx.send_replace(IdentityStatus::Released);
        identity_released(&mut rx).await;

        let (tx, mut rx) = watch::channel(IdentityStatus::Unassigned);
        drop(tx);
        identity_released(&mut rx).await;
    }
}
