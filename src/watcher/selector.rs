//! Backend selection along the fallback chain.
//!
//! Drivers are tried strictly in priority order (privileged, user-space,
//! polling) and the first one that passes its probe and opens successfully
//! is committed for the whole session.

use std::time::Duration;

use {anyhow::Error, tracing::debug};

use crate::{
    error::{DriverError, ErrorReporter},
    watcher::drivers::{
        Driver, PollingDriver, PrivilegedDriver, UserSpaceDriver, WatchRoot, privileged, userspace,
    },
};

/// Environment capabilities consulted by the selector.
pub trait CapabilityProbe: Send + Sync {
    /// Whether the process holds root-equivalent privilege.
    fn has_elevated_privilege(&self) -> bool;

    /// Whether the kernel notification facility can be initialized.
    ///
    /// # Errors
    ///
    /// Returns the reason the facility is unusable.
    fn probe_kernel_notifications(&self) -> Result<(), DriverError>;

    /// Whether the user-space watcher library works on this platform.
    ///
    /// # Errors
    ///
    /// Returns the reason the library is unusable.
    fn probe_userspace_library(&self) -> Result<(), DriverError>;
}

/// Probes the real operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl CapabilityProbe for SystemProbe {
    fn has_elevated_privilege(&self) -> bool {
        privileged::has_elevated_privilege()
    }

    fn probe_kernel_notifications(&self) -> Result<(), DriverError> {
        privileged::probe()
    }

    fn probe_userspace_library(&self) -> Result<(), DriverError> {
        userspace::probe()
    }
}

/// Picks exactly one driver for a session.
pub struct BackendSelector<'a> {
    probe: &'a dyn CapabilityProbe,
}

impl<'a> BackendSelector<'a> {
    pub fn new(probe: &'a dyn CapabilityProbe) -> Self {
        Self { probe }
    }

    /// Opens the highest-priority usable driver.
    ///
    /// Never fails: the polling driver is the terminal fallback.
    ///
    /// # Arguments
    ///
    /// * `roots` - Resolved directories to watch.
    /// * `enable_privileged` - User opt-in for the kernel-level backend.
    /// * `poll_interval` - Cadence used if polling is selected.
    pub fn select(
        &self,
        roots: &[WatchRoot],
        enable_privileged: bool,
        poll_interval: Duration,
    ) -> Driver {
        match self.try_privileged(roots, enable_privileged) {
            Ok(driver) => return Driver::Privileged(driver),
            Err(reason) => ErrorReporter::info(
                &Error::new(reason).context("privileged backend not used"),
                "backend selection",
            ),
        }

        match self.try_userspace(roots) {
            Ok(driver) => return Driver::UserSpace(driver),
            Err(e) => ErrorReporter::warn(
                &Error::new(e).context("user-space watcher unavailable, falling back to polling"),
                "backend selection",
            ),
        }

        debug!("Using polling backend every {:?}", poll_interval);
        Driver::Polling(PollingDriver::new(roots.to_vec(), poll_interval))
    }

    fn try_privileged(
        &self,
        roots: &[WatchRoot],
        enable_privileged: bool,
    ) -> Result<PrivilegedDriver, DriverError> {
        if !enable_privileged {
            return Err(DriverError::unavailable("not enabled in configuration"));
        }
        if !self.probe.has_elevated_privilege() {
            return Err(DriverError::unavailable("process is not privileged"));
        }
        self.probe.probe_kernel_notifications()?;
        PrivilegedDriver::new(roots.to_vec())
    }

    fn try_userspace(&self, roots: &[WatchRoot]) -> Result<UserSpaceDriver, DriverError> {
        self.probe.probe_userspace_library()?;
        UserSpaceDriver::new(roots)
    }
}
