//! Core Location and CPU Pinning
//!
//! Answers "which processor core is running this thread right now" via
//! `sched_getcpu` on Linux, and pins threads to cores via
//! `sched_setaffinity`. Other platforms report [`CoreId::UNKNOWN`] and treat
//! pinning as a no-op.

use std::fmt;

/// OS identifier of a processing core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CoreId(pub i32);

impl CoreId {
    /// Placeholder for a core that could not be determined.
    pub const UNKNOWN: CoreId = CoreId(-1);

    /// Whether this is a real core number.
    #[inline]
    pub fn is_known(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            // Delegate so width/alignment flags apply
            fmt::Display::fmt(&self.0, f)
        } else {
            f.pad("?")
        }
    }
}

impl From<i32> for CoreId {
    fn from(value: i32) -> Self {
        CoreId(value)
    }
}

/// Reports the core executing the calling thread.
///
/// Called concurrently from every thread of a team, hence `Sync`.
pub trait CoreLocator: Sync {
    /// Core currently executing the calling thread.
    fn current(&self) -> CoreId;
}

impl<F> CoreLocator for F
where
    F: Fn() -> CoreId + Sync,
{
    fn current(&self) -> CoreId {
        self()
    }
}

/// Locator backed by the `sched_getcpu` syscall.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedLocator;

impl CoreLocator for SchedLocator {
    #[cfg(target_os = "linux")]
    fn current(&self) -> CoreId {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            CoreId::UNKNOWN
        } else {
            CoreId(cpu)
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn current(&self) -> CoreId {
        CoreId::UNKNOWN
    }
}

/// Number of logical CPUs available to this process.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Set CPU affinity to pin the current thread to a specific core
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) -> Result<(), std::io::Error> {
    use std::mem::MaybeUninit;

    unsafe {
        let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed();
        let set_ref = set.assume_init_mut();

        libc::CPU_ZERO(set_ref);
        libc::CPU_SET(cpu, set_ref);

        let result = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set_ref);

        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// CPU pinning is not supported on this platform.
#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_cpu: usize) -> Result<(), std::io::Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sched_locator_in_range() {
        let core = SchedLocator.current();
        if cfg!(target_os = "linux") {
            assert!(core.is_known());
        }
    }

    #[test]
    fn test_closure_locator() {
        let locator = || CoreId(7);
        assert_eq!(locator.current(), CoreId(7));
    }

    #[test]
    fn test_display_unknown() {
        assert_eq!(format!("{:>3}", CoreId::UNKNOWN), "  ?");
        assert_eq!(format!("{:>3}", CoreId(5)), "  5");
    }

    #[test]
    fn test_available_cpus() {
        assert!(available_cpus() >= 1);
    }
}
