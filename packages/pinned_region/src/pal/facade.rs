use std::fmt::Debug;
use std::io;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockBindings;
use crate::pal::{Bindings, BuildTargetBindings};

/// Enum to hide the real/mock choice behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum BindingsFacade {
    Target(&'static BuildTargetBindings),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

impl BindingsFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetBindings)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockBindings) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Bindings for BindingsFacade {
    fn allocation_granularity(&self) -> usize {
        match self {
            Self::Target(bindings) => bindings.allocation_granularity(),
            #[cfg(test)]
            Self::Mock(mock) => mock.allocation_granularity(),
        }
    }

    fn reserve(&self, len: usize) -> Result<*mut u8, io::Error> {
        match self {
            Self::Target(bindings) => bindings.reserve(len),
            #[cfg(test)]
            Self::Mock(mock) => mock.reserve(len),
        }
    }

    unsafe fn commit(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.commit(ptr, len) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(mock) => unsafe { mock.commit(ptr, len) },
        }
    }

    unsafe fn decommit(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.decommit(ptr, len) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(mock) => unsafe { mock.decommit(ptr, len) },
        }
    }

    unsafe fn release(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error> {
        match self {
            // SAFETY: Forwarding safety requirements to caller.
            Self::Target(bindings) => unsafe { bindings.release(ptr, len) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to caller.
            Self::Mock(mock) => unsafe { mock.release(ptr, len) },
        }
    }
}

impl Debug for BindingsFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
