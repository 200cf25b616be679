//! AdmissionGate - ワーカープロセス内の同時実行数の上限
//!
//! タスク実行（in_flight の増減）とコントローラ（capacity の変更）の
//! 2 者から同時に触られる唯一の共有状態です。すべてアトミック操作で更新します。
//!
//! # 不変条件
//! - `try_admit()` は `in_flight < capacity` のときだけ成功する
//! - `resize()` は実行中のタスクを止めない（縮小直後は in_flight > capacity もありうる）
//! - capacity は常に `[min, max]` の範囲

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::domain::RelayError;
use crate::observability::WorkerStatus;

pub struct AdmissionGate {
    capacity: AtomicUsize,
    in_flight: AtomicUsize,
    min: usize,
    max: usize,
    /// Fired on release and resize.
    changed: Notify,

    admitted_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
}

impl AdmissionGate {
    /// `initial` is clamped into `[min, max]`.
    pub fn new(min: usize, max: usize, initial: usize) -> Result<Self, RelayError> {
        if min == 0 {
            return Err(RelayError::Config("min concurrency must be at least 1".into()));
        }
        if min > max {
            return Err(RelayError::Config(format!(
                "min concurrency {min} exceeds max concurrency {max}"
            )));
        }
        Ok(Self {
            capacity: AtomicUsize::new(initial.clamp(min, max)),
            in_flight: AtomicUsize::new(0),
            min,
            max,
            changed: Notify::new(),
            admitted_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn try_admit(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= self.capacity.load(Ordering::SeqCst) {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.admitted_total.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Never goes below zero, even on an unmatched call.
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.changed.notify_waiters();
    }

    /// Returns the capacity actually applied after clamping.
    pub fn resize(&self, new_capacity: usize) -> usize {
        let applied = new_capacity.clamp(self.min, self.max);
        self.capacity.store(applied, Ordering::SeqCst);
        self.changed.notify_waiters();
        applied
    }

    pub fn try_acquire(gate: &Arc<Self>) -> Option<AdmissionPermit> {
        gate.try_admit().then(|| AdmissionPermit {
            gate: Arc::clone(gate),
            outcome: PermitOutcome::Failed,
        })
    }

    /// Wait until a slot is free and take it.
    pub async fn admit(gate: &Arc<Self>) -> AdmissionPermit {
        loop {
            let notified = gate.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(permit) = Self::try_acquire(gate) {
                return permit;
            }
            notified.await;
        }
    }

    /// Wait until `in_flight < capacity` without taking the slot.
    pub async fn wait_for_slot(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() < self.capacity() {
                return;
            }
            notified.await;
        }
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            capacity: self.capacity(),
            in_flight: self.in_flight(),
            admitted_total: self.admitted_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitOutcome {
    Succeeded,
    Failed,
}

/// One admitted slot. Dropping it releases the slot; it counts as failed
/// unless `succeed()` was called first.
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
    outcome: PermitOutcome,
}

impl AdmissionPermit {
    pub fn succeed(mut self) {
        self.outcome = PermitOutcome::Succeeded;
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let gate = &self.gate;
        match self.outcome {
            PermitOutcome::Succeeded => {
                gate.completed_total.fetch_add(1, Ordering::Relaxed);
            }
            PermitOutcome::Failed => {
                gate.failed_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        gate.release();
    }
}
