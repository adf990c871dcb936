//! Platform Abstraction Layer (PAL). This is private API; all virtual-memory
//! syscalls made by this crate go through here, enabling them to be mocked.

mod abstractions;
pub(crate) use abstractions::*;

mod facade;
pub(crate) use facade::*;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("pinned_region requires the virtual-memory facilities of Linux or Windows");
