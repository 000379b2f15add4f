//! Correlation handles for operations that wait on an out-of-band reply.
//!
//! Each cookie moves `Created -> AwaitingReply -> {Replied | Cancelled}` and
//! is removed by `delete`. The table lock is only held to look up, insert or
//! remove an entry; transitions take the entry's own lock, so work on one
//! cookie never waits on another.

use crate::backend::Backend;
use crate::error::{BridgeError, BridgeResult};
use crate::logger::{self, BreadcrumbFlags};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique cookie value handed to the managed side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(u64);

impl Cookie {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CookieState {
    Created,
    AwaitingReply,
    Replied,
    Cancelled,
    /// Only observed by a transition that raced with `delete`.
    Deleted,
}

struct CookieSlot {
    backend_handle: usize,
    /// Handles the backend created are released by the backend itself.
    adopted: bool,
    state: Mutex<CookieState>,
}

#[derive(Default)]
struct CookieTable {
    slots: FxHashMap<Cookie, Arc<CookieSlot>>,
    by_handle: FxHashMap<usize, Cookie>,
    /// Deleted handles and the cookie that last tracked them. Adopting one of
    /// these again is a stale reply, not a new operation.
    retired: FxHashMap<usize, Cookie>,
}

impl CookieTable {
    fn insert(&mut self, cookie: Cookie, slot: Arc<CookieSlot>) -> Option<Cookie> {
        let handle = slot.backend_handle;
        self.slots.insert(cookie, slot);
        self.retired.remove(&handle);
        self.by_handle.insert(handle, cookie)
    }

    fn remove(&mut self, cookie: Cookie) -> Option<Arc<CookieSlot>> {
        let slot = self.slots.remove(&cookie)?;
        if self.by_handle.get(&slot.backend_handle) == Some(&cookie) {
            self.by_handle.remove(&slot.backend_handle);
            self.retired.insert(slot.backend_handle, cookie);
        }
        Some(slot)
    }
}

pub struct CookieBroker {
    backend: Arc<dyn Backend>,
    next: AtomicU64,
    table: Mutex<CookieTable>,
}

impl CookieBroker {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            next: AtomicU64::new(1),
            table: Mutex::new(CookieTable::default()),
        }
    }

    /// Allocates a cookie backed by a fresh backend handle.
    pub fn new_cookie(&self) -> Cookie {
        let handle = self.backend.cookie_new();
        self.track(handle)
    }

    /// Tracks a handle the backend created on its own (for example one
    /// delivered inside a state payload). It is already awaiting a reply, and
    /// deleting it only stops tracking: `CookieDelete` is left to the backend.
    ///
    /// A handle that is still tracked maps to its existing cookie. A handle
    /// whose cookie was deleted fails with `UnknownCookie` naming that cookie;
    /// the backend never hands the same handle out twice.
    pub fn adopt(&self, backend_handle: usize) -> BridgeResult<Cookie> {
        let mut table = self.table.lock();
        if let Some(cookie) = table.by_handle.get(&backend_handle) {
            return Ok(*cookie);
        }
        if let Some(previous) = table.retired.get(&backend_handle).copied() {
            drop(table);
            logger::warn(format!(
                "backend handle {backend_handle} used again after cookie {previous} was deleted"
            ));
            return Err(BridgeError::UnknownCookie(previous));
        }
        let cookie = self.allocate();
        table.insert(
            cookie,
            Self::slot_for(backend_handle, CookieState::AwaitingReply, true),
        );
        drop(table);
        logger::breadcrumb(
            BreadcrumbFlags::COOKIE,
            format!("cookie {cookie} adopts backend handle {backend_handle}"),
        );
        Ok(cookie)
    }

    fn allocate(&self) -> Cookie {
        Cookie(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn slot_for(backend_handle: usize, state: CookieState, adopted: bool) -> Arc<CookieSlot> {
        Arc::new(CookieSlot {
            backend_handle,
            adopted,
            state: Mutex::new(state),
        })
    }

    fn track(&self, backend_handle: usize) -> Cookie {
        let cookie = self.allocate();
        let slot = Self::slot_for(backend_handle, CookieState::Created, false);
        let shadowed = self.table.lock().insert(cookie, slot);
        if let Some(previous) = shadowed {
            logger::warn(format!(
                "backend handle {backend_handle} reused while cookie {previous} is still tracked"
            ));
        }
        logger::breadcrumb(
            BreadcrumbFlags::COOKIE,
            format!("cookie {cookie} tracks backend handle {backend_handle}"),
        );
        cookie
    }

    /// Runs the backend operation that consumes `cookie`.
    ///
    /// The cookie is marked as awaiting a reply before `op` runs and is not
    /// locked meanwhile, so `reply`/`cancel` reach it while `op` blocks (the
    /// proxy guard runs until its cookie is cancelled). If `op` fails and
    /// nothing finished the cookie in between, it goes back to `Created`.
    pub fn issue<T>(
        &self,
        cookie: Cookie,
        op: impl FnOnce(usize) -> BridgeResult<T>,
    ) -> BridgeResult<T> {
        let slot = self.slot(cookie)?;
        {
            let mut state = slot.state.lock();
            if *state != CookieState::Created {
                return Err(BridgeError::UnknownCookie(cookie));
            }
            *state = CookieState::AwaitingReply;
        }
        let result = op(slot.backend_handle);
        if result.is_err() {
            let mut state = slot.state.lock();
            if *state == CookieState::AwaitingReply {
                *state = CookieState::Created;
            }
        }
        result
    }

    /// Delivers `data` to whatever waits on `cookie`.
    pub fn reply(&self, cookie: Cookie, data: &str) -> BridgeResult<()> {
        self.finish(cookie, CookieState::Replied, |backend, handle| {
            backend.cookie_reply(handle, data)
        })
    }

    /// Cancels the operation waiting on `cookie`.
    pub fn cancel(&self, cookie: Cookie) -> BridgeResult<()> {
        self.finish(cookie, CookieState::Cancelled, |backend, handle| {
            backend.cookie_cancel(handle)
        })
    }

    /// A backend failure leaves the cookie awaiting, so the caller may still
    /// cancel it.
    fn finish(
        &self,
        cookie: Cookie,
        terminal: CookieState,
        forward: impl FnOnce(&dyn Backend, usize) -> BridgeResult<()>,
    ) -> BridgeResult<()> {
        let slot = self.slot(cookie)?;
        let mut state = slot.state.lock();
        if *state != CookieState::AwaitingReply {
            logger::breadcrumb(
                BreadcrumbFlags::COOKIE,
                format!("rejecting {terminal:?} for cookie {cookie} in state {:?}", *state),
            );
            return Err(BridgeError::UnknownCookie(cookie));
        }
        forward(self.backend.as_ref(), slot.backend_handle)?;
        *state = terminal;
        logger::breadcrumb(
            BreadcrumbFlags::COOKIE,
            format!("cookie {cookie} -> {terminal:?}"),
        );
        Ok(())
    }

    /// Releases `cookie` in whatever state it is in. Deleting twice is a
    /// caller bug and fails with `UnknownCookie`.
    pub fn delete(&self, cookie: Cookie) -> BridgeResult<()> {
        let removed = self.table.lock().remove(cookie);
        let Some(slot) = removed else {
            if cookie.0 != 0 && cookie.0 < self.next.load(Ordering::Relaxed) {
                logger::warn(format!("cookie {cookie} deleted twice"));
            }
            return Err(BridgeError::UnknownCookie(cookie));
        };
        let previous = std::mem::replace(&mut *slot.state.lock(), CookieState::Deleted);
        self.release_handle(&slot);
        logger::breadcrumb(
            BreadcrumbFlags::COOKIE,
            format!("cookie {cookie} deleted from {previous:?}"),
        );
        Ok(())
    }

    /// Deletes every cookie still tracked. Returns how many there were.
    pub fn retire_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.table.lock();
            let by_handle = std::mem::take(&mut table.by_handle);
            table.retired.extend(by_handle);
            table.slots.drain().collect()
        };
        for (cookie, slot) in &drained {
            *slot.state.lock() = CookieState::Deleted;
            self.release_handle(slot);
            logger::breadcrumb(
                BreadcrumbFlags::COOKIE,
                format!("cookie {cookie} retired at teardown"),
            );
        }
        if !drained.is_empty() {
            logger::warn(format!("{} cookies were never deleted", drained.len()));
        }
        drained.len()
    }

    pub fn state(&self, cookie: Cookie) -> Option<CookieState> {
        let slot = self.slot(cookie).ok()?;
        let state = *slot.state.lock();
        Some(state)
    }

    pub fn backend_handle(&self, cookie: Cookie) -> BridgeResult<usize> {
        Ok(self.slot(cookie)?.backend_handle)
    }

    /// Cookie currently tracking `backend_handle`, if any.
    pub fn find_by_handle(&self, backend_handle: usize) -> Option<Cookie> {
        self.table.lock().by_handle.get(&backend_handle).copied()
    }

    pub fn outstanding(&self) -> usize {
        self.table.lock().slots.len()
    }

    fn release_handle(&self, slot: &CookieSlot) {
        if !slot.adopted {
            self.backend.cookie_delete(slot.backend_handle);
        }
    }

    fn slot(&self, cookie: Cookie) -> BridgeResult<Arc<CookieSlot>> {
        self.table
            .lock()
            .slots
            .get(&cookie)
            .cloned()
            .ok_or(BridgeError::UnknownCookie(cookie))
    }
}
