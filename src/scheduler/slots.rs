/// Counting admission gate for concurrent migrations.
#[derive(Debug)]
pub struct SlotPool {
    capacity: usize,
    in_use: usize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: 0,
        }
    }

    /// Take one slot. Returns false when the pool is exhausted.
    pub fn try_acquire(&mut self) -> bool {
        if self.in_use >= self.capacity {
            return false;
        }
        self.in_use += 1;
        true
    }

    pub fn release(&mut self) {
        if self.in_use == 0 {
            tracing::error!("Slot released with no outstanding acquisitions");
            return;
        }
        self.in_use -= 1;
    }

    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_up_to_capacity() {
        let mut pool = SlotPool::new(2);
        assert!(pool.try_acquire());
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn release_frees_a_slot() {
        let mut pool = SlotPool::new(1);
        assert!(pool.try_acquire());
        pool.release();
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire());
    }

    #[test]
    fn release_without_acquire_does_not_underflow() {
        let mut pool = SlotPool::new(1);
        pool.release();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let pool = SlotPool::new(0);
        assert_eq!(pool.capacity(), 1);
    }
}
