//! Preemption bracket around the system allocator.
//!
//! A preemption signal that lands while the allocator's internal lock is
//! held, and then schedules other user code on the same kernel thread, would
//! deadlock the thread against itself. Every allocation therefore runs with
//! interrupts masked; the allocator itself is untouched.

use std::alloc::{GlobalAlloc, Layout, System};

use crate::preempt::interrupts;

pub struct GuardedAllocator;

unsafe impl GlobalAlloc for GuardedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        interrupts::disable();
        let p = unsafe { System.alloc(layout) };
        interrupts::enable();
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        interrupts::disable();
        unsafe { System.dealloc(ptr, layout) };
        interrupts::enable();
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        interrupts::disable();
        let p = unsafe { System.alloc_zeroed(layout) };
        interrupts::enable();
        p
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        interrupts::disable();
        let p = unsafe { System.realloc(ptr, layout, new_size) };
        interrupts::enable();
        p
    }
}

#[global_allocator]
static ALLOCATOR: GuardedAllocator = GuardedAllocator;
