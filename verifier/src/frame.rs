//! Scoped root registration on the host value stack.

use crate::Host;

/// Slot of a value registered in a [`RootFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Local(usize);

/// Registers host values as GC roots for the lifetime of the frame.
///
/// Values read back through [`RootFrame::get`] reflect any collection that ran
/// in between. The root stack is restored to its opening depth when the frame
/// is dropped, whichever way the scope is left.
pub struct RootFrame<'h, H: Host + ?Sized> {
    host: &'h mut H,
    base: usize,
}

impl<'h, H: Host + ?Sized> RootFrame<'h, H> {
    /// Opens a frame at the current root depth.
    pub fn new(host: &'h mut H) -> Self {
        let base = host.roots_len();
        log::trace!("root frame opened at depth {base}");
        Self { host, base }
    }

    /// Registers `value` and returns its slot.
    pub fn root(&mut self, value: H::Value) -> Local {
        let slot = self.host.roots_len();
        self.host.push_root(value);
        Local(slot)
    }

    /// Current value of a rooted slot.
    pub fn get(&self, local: Local) -> H::Value {
        self.host.root(local.0)
    }

    pub fn set(&mut self, local: Local, value: H::Value) {
        self.host.set_root(local.0, value);
    }

    pub fn host(&self) -> &H {
        &*self.host
    }

    /// Host access for allocations. Only rooted values survive them.
    pub fn host_mut(&mut self) -> &mut H {
        &mut *self.host
    }

    /// Reads `local` and closes the frame.
    pub fn finish(self, local: Local) -> H::Value {
        self.get(local)
    }
}

impl<H: Host + ?Sized> Drop for RootFrame<'_, H> {
    fn drop(&mut self) {
        self.host.truncate_roots(self.base);
        log::trace!("root frame closed at depth {}", self.base);
    }
}
