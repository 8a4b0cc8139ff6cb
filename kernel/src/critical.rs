//! The nestable critical-section guard, and the cell type kernel state is
//! stored in.
//!
//! Global mutable kernel state (the scheduler, the task pool, every
//! primitive's control block) is process-wide `static` data. Per the
//! re-architecture guidance this is *not* protected by a sleeping lock: it
//! is wrapped in [`Cell`], a token-gated cell that can only be read or
//! written while holding a [`CriticalGuard`], i.e. while interrupts are
//! masked. `tokenlock` makes the token a genuine compile-time-checked
//! capability rather than a convention.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::port::{CriticalState, Port};

struct Tag<P>(P);

type Token<P> = tokenlock::UnsyncSingletonToken<Tag<P>>;
type Keyhole<P> = tokenlock::SingletonTokenId<Tag<P>>;

/// Cell type that can only be accessed while holding a [`CriticalGuard<P>`].
pub struct Cell<P, T: ?Sized>(UnsyncTokenLock<T, Keyhole<P>>);

impl<P, T> Cell<P, T> {
    pub const fn new(value: T) -> Self {
        Self(UnsyncTokenLock::new(Keyhole::INIT, value))
    }
}

impl<P: Port, T> Cell<P, T> {
    /// Run `f` with mutable access to the guarded value, borrowing the
    /// token from an already-held [`CriticalGuard`]. The closure form keeps
    /// every call site honest about the token never outliving the borrow of
    /// `guard` that produced it.
    #[inline]
    pub fn with<R>(&self, guard: &mut CriticalGuard<P>, f: impl FnOnce(&mut T) -> R) -> R {
        let mut token = guard.reborrow();
        f(self.0.borrow_mut(&mut token))
    }
}

impl<P, T: fmt::Debug> fmt::Debug for Cell<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cell(< critical-section-gated >)")
    }
}

impl<P, T> ops::Deref for Cell<P, T> {
    type Target = UnsyncTokenLock<T, Keyhole<P>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P, T> ops::DerefMut for Cell<P, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// RAII guard for a held critical section. Dropping it restores interrupts
/// to the state they were in before it was acquired (which, for a nested
/// `enter`, may still be masked: see [`Port::enter_critical`]).
pub struct CriticalGuard<P: Port> {
    state: CriticalState,
    token: Token<P>,
}

/// Borrowed version of [`CriticalGuard`], i.e. `&'a mut CriticalGuard`
/// without the extra indirection. Functions that only need to read/write
/// [`Cell`]s take this rather than `&mut CriticalGuard` so callers must
/// explicitly `reborrow()` when they want to keep the original alive.
pub type TokenRefMut<'a, P> = tokenlock::UnsyncSingletonTokenRefMut<'a, Tag<P>>;

impl<P: Port> CriticalGuard<P> {
    /// Enter a critical section. Nestable: calling this while already
    /// inside one simply masks further and remembers how to unwind.
    #[inline]
    pub fn enter() -> Self {
        let state = unsafe { P::enter_critical() };
        Self {
            state,
            // Safety: we hold a unique proof of entry via `state`; no two
            // `CriticalGuard`s can be alive with overlapping lifetimes
            // because `enter_critical`/`exit_critical` strictly nest.
            token: unsafe { Token::new_unchecked() },
        }
    }

    #[inline]
    pub fn reborrow(&mut self) -> TokenRefMut<'_, P> {
        self.token.borrow_mut()
    }
}

impl<P: Port> Drop for CriticalGuard<P> {
    fn drop(&mut self) {
        unsafe { P::exit_critical(self.state) };
    }
}
