//! Per (kind, operation) work queues and per-kind key locks.

use crate::backoff::ExponentialBackoff;
use crate::keymutex::KeyMutex;
use crate::workqueue::WorkQueue;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Identifies one work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueId {
    AddOrUpdateVpc,
    DeleteVpc,
    UpdateVpcStatus,
    AddOrUpdateSubnet,
    DeleteSubnet,
    UpdateSubnetStatus,
    AddNode,
    UpdateNode,
    DeleteNode,
    AddNamespace,
    AddPod,
    UpdatePod,
    DeletePod,
    UpdateService,
    DeleteService,
    UpdateNp,
    DeleteNp,
}

/// Resource kind whose reconciliations share a key lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Vpc,
    Subnet,
    Node,
    Namespace,
    Pod,
    Service,
    NetworkPolicy,
}

impl QueueId {
    /// Every queue, in start-up order.
    pub const ALL: [QueueId; 17] = [
        QueueId::AddOrUpdateVpc,
        QueueId::DeleteVpc,
        QueueId::UpdateVpcStatus,
        QueueId::AddOrUpdateSubnet,
        QueueId::DeleteSubnet,
        QueueId::UpdateSubnetStatus,
        QueueId::AddNode,
        QueueId::UpdateNode,
        QueueId::DeleteNode,
        QueueId::AddNamespace,
        QueueId::AddPod,
        QueueId::UpdatePod,
        QueueId::DeletePod,
        QueueId::UpdateService,
        QueueId::DeleteService,
        QueueId::UpdateNp,
        QueueId::DeleteNp,
    ];

    /// Queue name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            QueueId::AddOrUpdateVpc => "add_or_update_vpc",
            QueueId::DeleteVpc => "delete_vpc",
            QueueId::UpdateVpcStatus => "update_vpc_status",
            QueueId::AddOrUpdateSubnet => "add_or_update_subnet",
            QueueId::DeleteSubnet => "delete_subnet",
            QueueId::UpdateSubnetStatus => "update_subnet_status",
            QueueId::AddNode => "add_node",
            QueueId::UpdateNode => "update_node",
            QueueId::DeleteNode => "delete_node",
            QueueId::AddNamespace => "add_namespace",
            QueueId::AddPod => "add_pod",
            QueueId::UpdatePod => "update_pod",
            QueueId::DeletePod => "delete_pod",
            QueueId::UpdateService => "update_service",
            QueueId::DeleteService => "delete_service",
            QueueId::UpdateNp => "update_np",
            QueueId::DeleteNp => "delete_np",
        }
    }

    /// Kind whose key lock this queue's workers take.
    pub fn lock_kind(self) -> LockKind {
        match self {
            QueueId::AddOrUpdateVpc | QueueId::DeleteVpc | QueueId::UpdateVpcStatus => LockKind::Vpc,
            QueueId::AddOrUpdateSubnet | QueueId::DeleteSubnet | QueueId::UpdateSubnetStatus => {
                LockKind::Subnet
            }
            QueueId::AddNode | QueueId::UpdateNode | QueueId::DeleteNode => LockKind::Node,
            QueueId::AddNamespace => LockKind::Namespace,
            QueueId::AddPod | QueueId::UpdatePod | QueueId::DeletePod => LockKind::Pod,
            QueueId::UpdateService | QueueId::DeleteService => LockKind::Service,
            QueueId::UpdateNp | QueueId::DeleteNp => LockKind::NetworkPolicy,
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// All work queues of the controller
#[derive(Debug)]
pub struct Queues {
    queues: HashMap<QueueId, WorkQueue>,
    locks: HashMap<LockKind, KeyMutex>,
}

impl Queues {
    /// One queue per `QueueId`, each with its own copy of `backoff`.
    ///
    /// Queues observe child tokens of `token`, so cancelling `token` stops
    /// them all while shutting one queue down leaves the others running.
    pub fn new(backoff: &ExponentialBackoff, token: &CancellationToken, lock_buckets: usize) -> Self {
        let queues = QueueId::ALL
            .iter()
            .map(|&id| (id, WorkQueue::new(id.name(), backoff.clone(), token.child_token())))
            .collect();
        let locks = [
            LockKind::Vpc,
            LockKind::Subnet,
            LockKind::Node,
            LockKind::Namespace,
            LockKind::Pod,
            LockKind::Service,
            LockKind::NetworkPolicy,
        ]
        .into_iter()
        .map(|kind| (kind, KeyMutex::new(lock_buckets)))
        .collect();
        Self { queues, locks }
    }

    /// Queue for `id`.
    pub fn get(&self, id: QueueId) -> &WorkQueue {
        // Every QueueId is inserted in `new`
        &self.queues[&id]
    }

    /// Shorthand for `get(id).enqueue(key)`.
    pub fn enqueue(&self, id: QueueId, key: &str) {
        self.get(id).enqueue(key);
    }

    /// Key lock shared by every queue of `id`'s kind.
    pub fn lock_for(&self, id: QueueId) -> &KeyMutex {
        &self.locks[&id.lock_kind()]
    }

    /// Shuts every queue down.
    pub fn shutdown_all(&self) {
        for queue in self.queues.values() {
            queue.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymutex::DEFAULT_BUCKETS;

    fn queues() -> Queues {
        Queues::new(&ExponentialBackoff::default(), &CancellationToken::new(), DEFAULT_BUCKETS)
    }

    #[test]
    fn test_every_queue_exists_with_unique_name() {
        let queues = queues();
        let mut names: Vec<_> = QueueId::ALL.iter().map(|id| queues.get(*id).name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), QueueId::ALL.len());
    }

    #[tokio::test]
    async fn test_add_and_delete_share_key_lock() {
        let queues = queues();
        let _held = queues.lock_for(QueueId::AddPod).lock("default/web").await;
        assert!(queues.lock_for(QueueId::DeletePod).try_lock("default/web").is_none());
        assert!(queues.lock_for(QueueId::AddNode).try_lock("default/web").is_some());
    }

    #[test]
    fn test_shutdown_one_queue_leaves_others() {
        let token = CancellationToken::new();
        let queues = Queues::new(&ExponentialBackoff::default(), &token, DEFAULT_BUCKETS);
        queues.get(QueueId::AddPod).shutdown();
        assert!(queues.get(QueueId::AddPod).is_shutting_down());
        assert!(!queues.get(QueueId::DeletePod).is_shutting_down());

        token.cancel();
        assert!(queues.get(QueueId::DeletePod).is_shutting_down());
    }
}
