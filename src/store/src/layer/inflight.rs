//! Per-digest coordination of concurrent layer creation.
//!
//! The first caller for a digest becomes the leader and does the unpack and
//! hash work; later callers for the same digest subscribe to the leader's
//! outcome. The leader publishes its result only after the index commit, and
//! the table entry is removed when the leader's guard drops, so a caller that
//! arrives afterwards finds the layer in the index instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use a3s_store_core::error::{Result, StoreError};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::record::LayerId;
use crate::digest::Digest;

type Outcome = Option<Result<LayerId>>;

#[derive(Default)]
pub(crate) struct InflightTable {
    entries: Mutex<HashMap<Digest, watch::Receiver<Outcome>>>,
}

pub(crate) enum Slot {
    Leader(InflightGuard),
    Follower(watch::Receiver<Outcome>),
}

impl InflightTable {
    pub(crate) fn join(self: &Arc<Self>, digest: &Digest) -> Slot {
        let mut entries = self.entries.lock();
        if let Some(rx) = entries.get(digest) {
            return Slot::Follower(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        entries.insert(digest.clone(), rx);
        Slot::Leader(InflightGuard {
            table: Arc::clone(self),
            digest: digest.clone(),
            tx,
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Held by the leader for the duration of a creation.
///
/// Dropping the guard without calling [`InflightGuard::complete`] (e.g. when
/// the leader's future is cancelled) closes the channel; followers then
/// retry and one of them takes over.
pub(crate) struct InflightGuard {
    table: Arc<InflightTable>,
    digest: Digest,
    tx: watch::Sender<Outcome>,
}

impl InflightGuard {
    pub(crate) fn complete(self, outcome: Result<LayerId>) {
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.table.entries.lock().remove(&self.digest);
    }
}

/// Wait for the leader's outcome.
///
/// Returns `Ok(None)` if the leader went away without publishing a result.
pub(crate) async fn wait_for_leader(
    mut rx: watch::Receiver<Outcome>,
    timeout: Duration,
    digest: &Digest,
) -> Result<Option<Result<LayerId>>> {
    match tokio::time::timeout(timeout, rx.wait_for(|outcome| outcome.is_some())).await {
        Err(_) => Err(StoreError::Timeout(format!(
            "waited {}s for in-flight creation of {}",
            timeout.as_secs(),
            digest
        ))),
        Ok(Err(_)) => Ok(None),
        Ok(Ok(outcome)) => Ok(outcome.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_slice;

    #[tokio::test]
    async fn test_follower_receives_leader_outcome() {
        let table = Arc::new(InflightTable::default());
        let digest = digest_slice(b"layer");

        let leader = match table.join(&digest) {
            Slot::Leader(guard) => guard,
            Slot::Follower(_) => panic!("first caller must lead"),
        };
        let follower = match table.join(&digest) {
            Slot::Follower(rx) => rx,
            Slot::Leader(_) => panic!("second caller must follow"),
        };

        let id = LayerId::from_digest(&digest);
        leader.complete(Ok(id.clone()));
        assert_eq!(table.len(), 0);

        let outcome = wait_for_leader(follower, Duration::from_secs(1), &digest)
            .await
            .unwrap();
        assert_eq!(outcome, Some(Ok(id)));
    }

    #[tokio::test]
    async fn test_follower_sees_failure() {
        let table = Arc::new(InflightTable::default());
        let digest = digest_slice(b"bad");

        let Slot::Leader(leader) = table.join(&digest) else {
            panic!("first caller must lead");
        };
        let Slot::Follower(rx) = table.join(&digest) else {
            panic!("second caller must follow");
        };

        leader.complete(Err(StoreError::StorageIo("disk full".to_string())));
        let outcome = wait_for_leader(rx, Duration::from_secs(1), &digest)
            .await
            .unwrap();
        assert!(matches!(outcome, Some(Err(StoreError::StorageIo(_)))));
    }

    #[tokio::test]
    async fn test_abandoned_leader_releases_followers() {
        let table = Arc::new(InflightTable::default());
        let digest = digest_slice(b"gone");

        let Slot::Leader(leader) = table.join(&digest) else {
            panic!("first caller must lead");
        };
        let Slot::Follower(rx) = table.join(&digest) else {
            panic!("second caller must follow");
        };

        drop(leader);
        let outcome = wait_for_leader(rx, Duration::from_secs(1), &digest)
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(matches!(table.join(&digest), Slot::Leader(_)));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let table = Arc::new(InflightTable::default());
        let digest = digest_slice(b"slow");

        let _leader = table.join(&digest);
        let Slot::Follower(rx) = table.join(&digest) else {
            panic!("second caller must follow");
        };

        let err = wait_for_leader(rx, Duration::from_millis(20), &digest)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }
}
