//! Resource budget: token pools that bound concurrent attempts.
//!
//! Each [`ResourceClass`] has its own pool. An attempt holds a
//! [`ResourceToken`] for its whole duration; dropping the token (on success,
//! failure, watchdog cancellation or panic unwinding) returns the slot.
//!
//! Pools can be resized while tokens are outstanding. Shrinking below the
//! number of held tokens takes effect as those tokens are released.

mod memory;

pub use memory::{
    FixedProbe, HeadroomProbe, PoolLimits, PoolSizes, SystemProbe, parse_mem_available,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::strategy::ResourceClass;

/// Errors from the resource budget.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The budget was closed; no further tokens are issued.
    #[error("resource pool '{0}' is closed")]
    Closed(ResourceClass),
}

#[derive(Debug)]
struct Pool {
    class: ResourceClass,
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    /// Permits still to be retired after a shrink.
    debt: AtomicUsize,
}

impl Pool {
    fn new(class: ResourceClass, capacity: usize) -> Self {
        Self {
            class,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            debt: AtomicUsize::new(0),
        }
    }

    fn take_debt(&self, max: usize) -> usize {
        let mut taken = 0;
        let _ = self
            .debt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |debt| {
                taken = debt.min(max);
                Some(debt - taken)
            });
        taken
    }

    fn resize(&self, new_capacity: usize) {
        let old = self.capacity.swap(new_capacity, Ordering::SeqCst);
        if new_capacity > old {
            let grow = new_capacity - old;
            let repaid = self.take_debt(grow);
            self.semaphore.add_permits(grow - repaid);
        } else if new_capacity < old {
            let shrink = old - new_capacity;
            let retired = self.semaphore.forget_permits(shrink);
            self.debt.fetch_add(shrink - retired, Ordering::SeqCst);
        }
        if new_capacity != old {
            info!(class = %self.class, old, new = new_capacity, "resized resource pool");
        }
    }
}

/// A held slot in one pool. Released on drop.
#[derive(Debug)]
pub struct ResourceToken {
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<Pool>,
}

impl ResourceToken {
    #[must_use]
    pub fn class(&self) -> ResourceClass {
        self.pool.class
    }
}

impl Drop for ResourceToken {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        if let Some(permit) = self.permit.take() {
            if self.pool.take_debt(1) == 1 {
                permit.forget();
            }
        }
    }
}

/// The three token pools shared by every machine in a batch.
#[derive(Debug)]
pub struct ResourceBudget {
    general: Arc<Pool>,
    long_transfer: Arc<Pool>,
    interactive: Arc<Pool>,
}

impl ResourceBudget {
    #[must_use]
    pub fn new(sizes: PoolSizes) -> Self {
        info!(?sizes, "resource budget created");
        Self {
            general: Arc::new(Pool::new(ResourceClass::General, sizes.general)),
            long_transfer: Arc::new(Pool::new(ResourceClass::LongTransfer, sizes.long_transfer)),
            interactive: Arc::new(Pool::new(ResourceClass::Interactive, sizes.interactive)),
        }
    }

    fn pool(&self, class: ResourceClass) -> &Arc<Pool> {
        match class {
            ResourceClass::General => &self.general,
            ResourceClass::LongTransfer => &self.long_transfer,
            ResourceClass::Interactive => &self.interactive,
        }
    }

    /// Waits for a token in `class`'s pool.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] once the budget has been closed.
    pub async fn acquire(&self, class: ResourceClass) -> Result<ResourceToken, SchedulerError> {
        let pool = Arc::clone(self.pool(class));
        let permit = Arc::clone(&pool.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Closed(class))?;

        let in_use = pool.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        pool.peak.fetch_max(in_use, Ordering::SeqCst);
        debug!(%class, in_use, "resource token acquired");

        Ok(ResourceToken {
            permit: Some(permit),
            pool,
        })
    }

    /// Tokens currently held in a pool.
    #[must_use]
    pub fn in_use(&self, class: ResourceClass) -> usize {
        self.pool(class).in_use.load(Ordering::SeqCst)
    }

    /// Highest `in_use` observed for a pool.
    #[must_use]
    pub fn peak(&self, class: ResourceClass) -> usize {
        self.pool(class).peak.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn capacity(&self, class: ResourceClass) -> usize {
        self.pool(class).capacity.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sizes(&self) -> PoolSizes {
        PoolSizes {
            general: self.capacity(ResourceClass::General),
            long_transfer: self.capacity(ResourceClass::LongTransfer),
            interactive: self.capacity(ResourceClass::Interactive),
        }
    }

    /// Applies new pool sizes.
    pub fn resize(&self, sizes: PoolSizes) {
        self.general.resize(sizes.general.max(1));
        self.long_transfer.resize(sizes.long_transfer.max(1));
        self.interactive.resize(sizes.interactive.max(1));
    }

    /// Stops issuing tokens; pending `acquire` calls fail.
    pub fn close(&self) {
        for class in ResourceClass::ALL {
            self.pool(class).semaphore.close();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio_test::{assert_pending, assert_ready_ok, task};

    use super::*;

    fn budget(general: usize, long_transfer: usize) -> ResourceBudget {
        ResourceBudget::new(PoolSizes {
            general,
            long_transfer,
            interactive: 1,
        })
    }

    #[tokio::test]
    async fn test_tokens_track_in_use_and_peak() {
        let budget = budget(3, 1);
        let a = budget.acquire(ResourceClass::General).await.unwrap();
        let b = budget.acquire(ResourceClass::General).await.unwrap();
        assert_eq!(budget.in_use(ResourceClass::General), 2);
        assert_eq!(a.class(), ResourceClass::General);

        drop(a);
        drop(b);
        assert_eq!(budget.in_use(ResourceClass::General), 0);
        assert_eq!(budget.peak(ResourceClass::General), 2);
    }

    #[tokio::test]
    async fn test_pools_are_independent() {
        let budget = budget(1, 1);
        let _general = budget.acquire(ResourceClass::General).await.unwrap();
        let long = budget.acquire(ResourceClass::LongTransfer).await.unwrap();
        assert_eq!(long.class(), ResourceClass::LongTransfer);
        assert_eq!(budget.in_use(ResourceClass::LongTransfer), 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_when_pool_full() {
        let budget = budget(1, 1);
        let held = budget.acquire(ResourceClass::General).await.unwrap();

        let mut waiting = task::spawn(budget.acquire(ResourceClass::General));
        assert_pending!(waiting.poll());

        drop(held);
        assert!(waiting.is_woken());
        let token = assert_ready_ok!(waiting.poll());
        assert_eq!(token.class(), ResourceClass::General);
    }

    #[tokio::test]
    async fn test_resize_grow_admits_more() {
        let budget = budget(1, 1);
        let _a = budget.acquire(ResourceClass::General).await.unwrap();
        budget.resize(PoolSizes {
            general: 2,
            long_transfer: 1,
            interactive: 1,
        });
        let _b = budget.acquire(ResourceClass::General).await.unwrap();
        assert_eq!(budget.in_use(ResourceClass::General), 2);
        assert_eq!(budget.capacity(ResourceClass::General), 2);
    }

    #[tokio::test]
    async fn test_resize_shrink_below_held_retires_on_release() {
        let budget = budget(2, 1);
        let a = budget.acquire(ResourceClass::General).await.unwrap();
        let b = budget.acquire(ResourceClass::General).await.unwrap();

        budget.resize(PoolSizes {
            general: 1,
            long_transfer: 1,
            interactive: 1,
        });
        drop(a);

        let mut waiting = task::spawn(budget.acquire(ResourceClass::General));
        assert_pending!(waiting.poll());

        drop(b);
        let _c = assert_ready_ok!(waiting.poll());
        assert_eq!(budget.in_use(ResourceClass::General), 1);
    }

    #[tokio::test]
    async fn test_close_fails_pending_acquire() {
        let budget = budget(1, 1);
        let _held = budget.acquire(ResourceClass::General).await.unwrap();
        budget.close();
        let err = budget.acquire(ResourceClass::General).await.unwrap_err();
        assert_eq!(err, SchedulerError::Closed(ResourceClass::General));
    }
}
