//! Semaphore and lock primitives, grounded on `synch.c`. A semaphore is a
//! counter plus a FIFO waiter list; a lock is a binary semaphore with a
//! holder pointer for reentrancy diagnostics. Both bracket their critical
//! sections with the interrupt-state discipline in [`crate::trap`] rather
//! than a spinlock, since `down` may put the calling thread to sleep.

use crate::list::List;
use crate::sched::{self, ThreadPtr};
use crate::trap;

pub struct Semaphore {
    value: u64,
    waiters: List,
}

impl Semaphore {
    pub const fn new(value: u64) -> Self {
        Semaphore {
            value,
            waiters: List::new(),
        }
    }

    /// Must be called once before first use (the embedded sentinel needs its
    /// own address).
    pub fn init(&mut self) {
        self.waiters.init();
    }

    /// Blocks the calling thread until the counter is positive, then
    /// decrements it. Must not be called from interrupt context.
    pub fn down(&mut self) {
        let old = trap::intr_disable();
        while self.value == 0 {
            let current = sched::thread_current();
            unsafe { self.waiters.push_tail(sched::thread_list_node(current)) };
            sched::thread_block();
        }
        self.value -= 1;
        trap::intr_set_state(old);
    }

    /// Decrements the counter without blocking if it is positive; returns
    /// whether it succeeded.
    pub fn try_down(&mut self) -> bool {
        let old = trap::intr_disable();
        let ok = if self.value > 0 {
            self.value -= 1;
            true
        } else {
            false
        };
        trap::intr_set_state(old);
        ok
    }

    /// Increments the counter and, if a thread is waiting, wakes the oldest
    /// one. Safe to call from interrupt context.
    pub fn up(&mut self) {
        let old = trap::intr_disable();
        if let Some(node) = unsafe { self.waiters.pop_head() } {
            let thread = sched::thread_from_list_node(node.as_ptr());
            sched::thread_unblock(thread);
        }
        self.value += 1;
        trap::intr_set_state(old);
    }
}

unsafe impl Send for Semaphore {}

pub struct Lock {
    holder: Option<ThreadPtr>,
    sema: Semaphore,
}

impl Lock {
    pub const fn new() -> Self {
        Lock {
            holder: None,
            sema: Semaphore::new(1),
        }
    }

    pub fn init(&mut self) {
        self.sema.init();
    }

    pub fn held_by_current(&self) -> bool {
        self.holder == Some(sched::thread_current())
    }

    pub fn acquire(&mut self) {
        debug_assert!(!self.held_by_current(), "deadlock: self-acquire of held lock");
        self.sema.down();
        self.holder = Some(sched::thread_current());
    }

    pub fn try_acquire(&mut self) -> bool {
        debug_assert!(!self.held_by_current(), "deadlock: self-acquire of held lock");
        let ok = self.sema.try_down();
        if ok {
            self.holder = Some(sched::thread_current());
        }
        ok
    }

    pub fn release(&mut self) {
        debug_assert!(self.held_by_current(), "release of lock not held by caller");
        self.holder = None;
        self.sema.up();
    }
}

unsafe impl Send for Lock {}
