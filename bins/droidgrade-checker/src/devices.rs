//! Device discovery and exclusive reservation.

use std::sync::Arc;
use std::time::Duration;

use droidgrade_common::locks::{Lease, LockProvider};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adb::{Device, DeviceControl};
use crate::cancel::{cancelled, is_cancelled};
use crate::error::CheckError;

/// Lock attempts against an individual device never block: a busy device
/// must not stall acquisition of a free one further down the listing.
const TRY_LOCK_TIMEOUT: Duration = Duration::ZERO;
const RELIST_BACKOFF: Duration = Duration::from_millis(500);

pub fn device_lock_name(serial: &str) -> String {
    format!("device:{serial}")
}

/// Exposes the devices currently reachable and online.
pub struct DeviceRegistry {
    control: Arc<dyn DeviceControl>,
}

impl DeviceRegistry {
    pub fn new(control: Arc<dyn DeviceControl>) -> Self {
        Self { control }
    }

    /// Snapshot of the online devices. Callers re-query to observe changes.
    ///
    /// An unreachable device-control channel degrades to an empty listing:
    /// for every caller, "no devices right now" is an ordinary retryable
    /// condition, not an error.
    pub async fn online_devices(&self) -> Vec<Device> {
        match self.control.devices().await {
            Ok(devices) => devices.into_iter().filter(|d| d.is_online()).collect(),
            Err(err) => {
                warn!(error = %err, "failed to list devices");
                Vec::new()
            }
        }
    }
}

/// One device bound to one in-flight submission, backed by a held lease.
pub struct ReservedDevice {
    device: Device,
    lease: Option<Box<dyn Lease>>,
}

impl ReservedDevice {
    pub fn serial(&self) -> &str {
        &self.device.serial
    }

    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(err) = lease.release().await {
                warn!(serial = %self.device.serial, error = %err, "failed to release device lease");
            }
        }
    }
}

pub struct DeviceReservations {
    registry: DeviceRegistry,
    locks: Arc<dyn LockProvider>,
}

impl DeviceReservations {
    pub fn new(registry: DeviceRegistry, locks: Arc<dyn LockProvider>) -> Self {
        Self { registry, locks }
    }

    /// Claim exclusive use of one online device for the lifetime of a check.
    ///
    /// Walks the current listing with non-blocking lock attempts and returns
    /// the first device it wins; when everything is locked (or nothing is
    /// attached) it backs off briefly and re-lists until cancellation.
    pub async fn reserve(&self, cancel: watch::Receiver<bool>) -> Result<ReservedDevice, CheckError> {
        loop {
            if is_cancelled(&cancel) {
                return Err(CheckError::Cancelled);
            }

            for device in self.registry.online_devices().await {
                let lock_name = device_lock_name(&device.serial);
                match self.locks.try_acquire(&lock_name, TRY_LOCK_TIMEOUT).await? {
                    Some(lease) => {
                        info!(serial = %device.serial, "reserved device");
                        return Ok(ReservedDevice {
                            device,
                            lease: Some(lease),
                        });
                    }
                    None => continue,
                }
            }

            debug!("no lockable device; backing off before re-listing");
            tokio::select! {
                _ = sleep(RELIST_BACKOFF) => {}
                _ = cancelled(cancel.clone()) => return Err(CheckError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use droidgrade_common::locks::MemoryLockProvider;
    use tokio::sync::watch;

    use super::*;
    use crate::adb::{AdbError, DeviceState};

    struct StaticControl {
        devices: Vec<Device>,
    }

    impl StaticControl {
        fn with_serials(serials: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                devices: serials
                    .iter()
                    .map(|serial| Device {
                        serial: serial.to_string(),
                        state: DeviceState::Online,
                    })
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl DeviceControl for StaticControl {
        async fn devices(&self) -> Result<Vec<Device>, AdbError> {
            Ok(self.devices.clone())
        }

        async fn install_package(&self, _serial: &str, _apk: &Path) -> Result<(), AdbError> {
            Ok(())
        }

        async fn uninstall_package(&self, _serial: &str, _package: &str) -> Result<(), AdbError> {
            Ok(())
        }

        async fn run_remote_command(
            &self,
            _serial: &str,
            _command: &str,
            _cancel: watch::Receiver<bool>,
        ) -> Result<String, AdbError> {
            Ok(String::new())
        }
    }

    fn reservations(control: Arc<StaticControl>, locks: MemoryLockProvider) -> DeviceReservations {
        DeviceReservations::new(DeviceRegistry::new(control), Arc::new(locks))
    }

    #[tokio::test]
    async fn reserves_distinct_devices() {
        let control = StaticControl::with_serials(&["a", "b"]);
        let locks = MemoryLockProvider::new();
        let reservations = reservations(control, locks);
        let (_tx, cancel) = watch::channel(false);

        let first = reservations.reserve(cancel.clone()).await.unwrap();
        let second = reservations.reserve(cancel.clone()).await.unwrap();

        assert_ne!(first.serial(), second.serial());
    }

    #[tokio::test]
    async fn concurrent_reservations_never_exceed_device_count() {
        let control = StaticControl::with_serials(&["a", "b"]);
        let locks = MemoryLockProvider::new();
        let reservations = Arc::new(reservations(control, locks));
        let (_tx, cancel) = watch::channel(false);

        let held = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let reservations = reservations.clone();
            let cancel = cancel.clone();
            let held = held.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let reserved = reservations.reserve(cancel).await.unwrap();
                let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                held.fetch_sub(1, Ordering::SeqCst);
                reserved.release().await;
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "more holders than devices");
    }

    #[tokio::test]
    async fn reserve_fails_once_cancelled() {
        let control = StaticControl::with_serials(&[]);
        let locks = MemoryLockProvider::new();
        let reservations = reservations(control, locks);
        let (tx, cancel) = watch::channel(false);

        let waiter = tokio::spawn(async move { reservations.reserve(cancel).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CheckError::Cancelled)));
    }

    #[tokio::test]
    async fn released_device_can_be_reserved_again() {
        let control = StaticControl::with_serials(&["only"]);
        let locks = MemoryLockProvider::new();
        let reservations = reservations(control, locks);
        let (_tx, cancel) = watch::channel(false);

        let first = reservations.reserve(cancel.clone()).await.unwrap();
        first.release().await;

        let second = reservations.reserve(cancel).await.unwrap();
        assert_eq!(second.serial(), "only");
    }
}
