//! Per-operation failure policy.
//!
//! The cache is an accelerator, the queue is the only record of a pending
//! write, and storage is the source of truth. Which failures a caller sees
//! follows from that and is spelled out here once:
//!
//! | Operation            | Policy  | Effect on caller                          |
//! |----------------------|---------|-------------------------------------------|
//! | `CacheGet`           | Absorb  | treated as a miss                         |
//! | `CacheSizeCheck`     | Absorb  | write attempted unconditionally           |
//! | `CacheSet`           | Absorb  | entry simply not cached                   |
//! | `CacheDelete`        | Surface | caller decides                            |
//! | `CacheInvalidate`    | Absorb  | counted, stale entry expires by TTL       |
//! | `CacheStats`         | Surface | stats endpoint reports the error          |
//! | `QueuePublish`       | Surface | write request fails                       |
//! | `QueueDepthRefresh`  | Absorb  | gauge keeps its previous value            |
//! | `StorageRead`        | Surface | read request fails                        |
//! | `StorageApply`       | Absorb  | logged, counted, message acknowledged     |
//! | `PayloadDecode`      | Absorb  | logged, counted, message acknowledged     |

use crate::error::Result;

/// A point where a subsystem failure must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CacheGet,
    CacheSizeCheck,
    CacheSet,
    CacheDelete,
    CacheInvalidate,
    CacheStats,
    QueuePublish,
    QueueDepthRefresh,
    StorageRead,
    StorageApply,
    PayloadDecode,
}

/// What happens to an error raised at an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and continue as if the operation produced nothing.
    Absorb,
    /// Return the error to the caller.
    Surface,
}

impl Operation {
    pub const fn policy(self) -> FailurePolicy {
        match self {
            Operation::CacheGet
            | Operation::CacheSizeCheck
            | Operation::CacheSet
            | Operation::CacheInvalidate
            | Operation::QueueDepthRefresh
            | Operation::StorageApply
            | Operation::PayloadDecode => FailurePolicy::Absorb,
            Operation::CacheDelete
            | Operation::CacheStats
            | Operation::QueuePublish
            | Operation::StorageRead => FailurePolicy::Surface,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Operation::CacheGet => "cache_get",
            Operation::CacheSizeCheck => "cache_size_check",
            Operation::CacheSet => "cache_set",
            Operation::CacheDelete => "cache_delete",
            Operation::CacheInvalidate => "cache_invalidate",
            Operation::CacheStats => "cache_stats",
            Operation::QueuePublish => "queue_publish",
            Operation::QueueDepthRefresh => "queue_depth_refresh",
            Operation::StorageRead => "storage_read",
            Operation::StorageApply => "storage_apply",
            Operation::PayloadDecode => "payload_decode",
        }
    }
}

/// Resolve `result` according to the policy of `op`.
///
/// `Ok(Some(v))` on success, `Ok(None)` for an absorbed failure, `Err` for a
/// surfaced one.
pub fn settle<T>(op: Operation, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) => match op.policy() {
            FailurePolicy::Absorb => {
                warn!("⚠ {} failed, continuing: {}", op.name(), e);
                Ok(None)
            }
            FailurePolicy::Surface => Err(e),
        },
    }
}

/// Convenience for absorbed operations whose result carries no value.
///
/// Returns `true` when the operation succeeded.
pub fn absorb(op: Operation, result: Result<()>) -> bool {
    debug_assert_eq!(op.policy(), FailurePolicy::Absorb);
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠ {} failed, continuing: {}", op.name(), e);
            false
        }
    }
}
