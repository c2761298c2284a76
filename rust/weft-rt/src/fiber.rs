//! Stackful cooperative contexts (fibers).
//!
//! A [`Fiber`] owns a register snapshot and, unless it is a proxy, a heap
//! stack. There is no implicit scheduling: [`swap`] is always an explicit
//! transfer between exactly two fibers. The snapshot is just the saved stack
//! pointer — all callee-saved registers are parked on the fiber's own stack
//! by the switch routine, so resuming a fiber is a stack-pointer exchange
//! plus a register reload.
//!
//! Two kinds of fiber exist:
//!
//! * created fibers ([`create`]) get a fresh stack seeded so that the first
//!   swap into them lands in a trampoline that calls the entry closure;
//! * proxy fibers ([`proxy`]) wrap the current OS thread's stack without
//!   allocating, so the thread can be swapped back to at shutdown.
//!
//! Every swap records the fiber we came from in the target's `prev` slot.
//! The scheduler uses that to reclaim fibers at the few points where `prev`
//! is provably abandoned (a finished work loop, a help-finish resume).
//!
//! # Entry discipline
//!
//! An entry closure must never return — it always ends by swapping away for
//! the last time. Fibers are reclaimed by freeing their stack without
//! unwinding, so an entry must also drop everything it owns before parking
//! in a work loop or performing its final swap; whatever is still live in
//! its frames at that point is leaked.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::Cell;
use std::fmt;
use std::ptr;

#[cfg(not(all(
    any(target_arch = "x86_64", target_arch = "aarch64"),
    target_os = "linux"
)))]
compile_error!("weft-rt fibers support x86_64/aarch64 Linux only");

/// Entry closure for a created fiber. Receives the fiber's own handle so it
/// can publish it as the thread's current context.
pub(crate) type FiberEntry = Box<dyn FnOnce(*mut Fiber) + Send + 'static>;

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// Heap stack for a created fiber. Allocated uninitialized so untouched
/// pages stay uncommitted, which keeps deeply nested scope chains cheap.
struct FiberStack {
    base: *mut u8,
    layout: Layout,
}

impl FiberStack {
    fn new(size: usize) -> Self {
        let size = size.max(16 * 1024) & !15;
        let layout = Layout::from_size_align(size, 16).expect("bad stack layout");
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            // Allocation failure during a spawn has no safe unwind path.
            handle_alloc_error(layout);
        }
        Self { base, layout }
    }

    /// Highest address of the stack; stacks grow downward.
    fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.layout.size()) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

// ---------------------------------------------------------------------------
// Fiber
// ---------------------------------------------------------------------------

pub(crate) struct Fiber {
    /// Saved stack pointer while the fiber is suspended. Garbage while it is
    /// running (the running fiber's state lives in machine registers).
    sp: *mut u8,
    /// The fiber that last swapped into this one.
    prev: Cell<*mut Fiber>,
    /// Taken by the trampoline on first entry.
    entry: Option<FiberEntry>,
    /// `None` for proxy fibers.
    stack: Option<FiberStack>,
}

impl Fiber {
    /// Allocate a fiber with a fresh stack. The first swap into it runs
    /// `entry` on that stack; `entry` must never return.
    pub(crate) fn create(stack_size: usize, entry: FiberEntry) -> *mut Fiber {
        let stack = FiberStack::new(stack_size);
        let top = stack.top();
        let fiber = Box::into_raw(Box::new(Fiber {
            sp: ptr::null_mut(),
            prev: Cell::new(ptr::null_mut()),
            entry: Some(entry),
            stack: Some(stack),
        }));
        unsafe { (*fiber).sp = arch::seed_stack(top, fiber) };
        fiber
    }

    /// Wrap the current OS thread's stack so it can be swapped back to.
    pub(crate) fn proxy() -> *mut Fiber {
        Box::into_raw(Box::new(Fiber {
            sp: ptr::null_mut(),
            prev: Cell::new(ptr::null_mut()),
            entry: None,
            stack: None,
        }))
    }

    pub(crate) fn prev(&self) -> *mut Fiber {
        self.prev.get()
    }

    pub(crate) fn is_proxy(&self) -> bool {
        self.stack.is_none()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("proxy", &self.is_proxy())
            .field("started", &self.entry.is_none())
            .finish()
    }
}

/// Swap execution from `from` to `to`, returning when something later swaps
/// back into `from`. Records `from` in `to.prev`.
///
/// # Safety
///
/// `from` must be the fiber currently executing on this thread and `to` a
/// live, suspended (or never-started) fiber that no other thread is about to
/// resume.
pub(crate) unsafe fn swap(from: *mut Fiber, to: *mut Fiber) {
    debug_assert!(!from.is_null() && !to.is_null() && from != to);
    (*to).prev.set(from);
    arch::weft_fiber_switch(ptr::addr_of_mut!((*from).sp), (*to).sp);
}

/// A fiber handle that may be captured by a `Send` closure.
///
/// Ownership of a suspended fiber travels with the swap protocol: exactly
/// one task ever holds the right to resume it, so moving the raw pointer
/// across threads is sound even though `Fiber` itself is not `Sync`.
#[derive(Clone, Copy)]
pub(crate) struct FiberPtr(pub(crate) *mut Fiber);

unsafe impl Send for FiberPtr {}

/// Free a fiber and its stack without unwinding.
///
/// # Safety
///
/// The fiber must be abandoned: either never started, or suspended with no
/// path left that could resume it. See the module docs for the entry
/// discipline that makes skipping `Drop`s on its stack acceptable.
pub(crate) unsafe fn destroy(fiber: *mut Fiber) {
    debug_assert!(!fiber.is_null());
    drop(Box::from_raw(fiber));
}

// ---------------------------------------------------------------------------
// First-entry path
// ---------------------------------------------------------------------------

/// Called by the arch trampoline on a fiber's first entry.
#[no_mangle]
extern "C" fn weft_fiber_start(fiber: *mut Fiber) -> ! {
    let entry = unsafe { (*fiber).entry.take() }.expect("fiber entered twice");
    entry(fiber);
    // Entries terminate with a final swap; falling out of one would resume
    // a dead frame on the next swap-in.
    log::error!("fiber entry returned; aborting");
    std::process::abort();
}

// ---------------------------------------------------------------------------
// Architecture backends
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::Fiber;
    use std::arch::global_asm;

    // The switch parks rbp/rbx/r12-r15 plus the return address on the old
    // stack, publishes the old stack pointer, and restores the same frame
    // from the new stack. A seeded stack mimics that frame with the fiber
    // handle in the r15 slot and the trampoline as the return address.
    global_asm!(
        ".text",
        ".globl weft_fiber_switch_impl",
        ".type weft_fiber_switch_impl, @function",
        "weft_fiber_switch_impl:",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        ".size weft_fiber_switch_impl, . - weft_fiber_switch_impl",
        ".globl weft_fiber_trampoline",
        ".type weft_fiber_trampoline, @function",
        "weft_fiber_trampoline:",
        "mov rdi, r15",
        "xor ebp, ebp",
        "call weft_fiber_start",
        "ud2",
        ".size weft_fiber_trampoline, . - weft_fiber_trampoline",
    );

    extern "C" {
        fn weft_fiber_switch_impl(save_slot: *mut *mut u8, target_sp: *mut u8);
        fn weft_fiber_trampoline();
    }

    pub(super) unsafe fn weft_fiber_switch(save_slot: *mut *mut u8, target_sp: *mut u8) {
        weft_fiber_switch_impl(save_slot, target_sp);
    }

    /// Lay out the initial switch frame on a fresh stack.
    ///
    /// Slot order matches the pop sequence in `weft_fiber_switch_impl`:
    /// r15, r14, r13, r12, rbx, rbp, return address. The resulting stack
    /// pointer keeps the SysV 16-byte alignment the trampoline's `call`
    /// expects.
    pub(super) unsafe fn seed_stack(top: *mut u8, fiber: *mut Fiber) -> *mut u8 {
        let sp = top.sub(7 * 8) as *mut u64;
        sp.write(fiber as u64); // r15
        for i in 1..6 {
            sp.add(i).write(0);
        }
        sp.add(6).write(weft_fiber_trampoline as usize as u64);
        sp as *mut u8
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::Fiber;
    use std::arch::global_asm;

    // AAPCS64 callee-saved set: x19-x28, fp, lr, and the low halves of
    // v8-v15. 160 bytes, keeping sp 16-aligned throughout.
    global_asm!(
        ".text",
        ".globl weft_fiber_switch_impl",
        ".type weft_fiber_switch_impl, @function",
        "weft_fiber_switch_impl:",
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
        ".size weft_fiber_switch_impl, . - weft_fiber_switch_impl",
        ".globl weft_fiber_trampoline",
        ".type weft_fiber_trampoline, @function",
        "weft_fiber_trampoline:",
        "mov x0, x19",
        "mov x29, xzr",
        "bl weft_fiber_start",
        "brk #0x1",
        ".size weft_fiber_trampoline, . - weft_fiber_trampoline",
    );

    extern "C" {
        fn weft_fiber_switch_impl(save_slot: *mut *mut u8, target_sp: *mut u8);
        fn weft_fiber_trampoline();
    }

    pub(super) unsafe fn weft_fiber_switch(save_slot: *mut *mut u8, target_sp: *mut u8) {
        weft_fiber_switch_impl(save_slot, target_sp);
    }

    /// Lay out the initial switch frame: fiber handle in the x19 slot,
    /// trampoline address in the x30 (lr) slot, everything else zero.
    pub(super) unsafe fn seed_stack(top: *mut u8, fiber: *mut Fiber) -> *mut u8 {
        let sp = top.sub(160) as *mut u64;
        for i in 0..20 {
            sp.add(i).write(0);
        }
        sp.write(fiber as u64); // x19
        sp.add(11).write(weft_fiber_trampoline as usize as u64); // x30
        sp as *mut u8
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
