//! Ordered launch queue in front of a device.
//!
//! Launches submitted to a [`DeviceStream`] run one at a time, in submission
//! order, on a dedicated worker thread. Joining a [`LaunchHandle`] or calling
//! [`DeviceStream::synchronize`] is the barrier between consecutive steps: once
//! it returns, every write of the earlier launches is visible.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error};

use crate::device::{Device, StepLaunch};
use crate::error::DeviceError;

enum Job {
    Launch {
        launch: StepLaunch,
        reply: Sender<Result<Vec<f64>, DeviceError>>,
    },
    Barrier {
        reply: Sender<()>,
    },
}

/// A single-worker launch queue.
pub struct DeviceStream {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    queue_capacity: usize,
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("queue_capacity", &self.queue_capacity)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl DeviceStream {
    /// Starts the worker thread.
    pub fn start(device: Arc<dyn Device>, queue_capacity: usize) -> Result<Self, DeviceError> {
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);
        let name = format!("myriad-stream-{}", device.name());

        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || run(&*device, &rx))
            .map_err(|err| DeviceError::LaunchFailed {
                reason: format!("failed to spawn stream worker: {err}"),
            })?;

        debug!(queue_capacity, "device stream started");
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            queue_capacity,
        })
    }

    /// Maximum number of queued launches.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn sender(&self) -> Result<&Sender<Job>, DeviceError> {
        self.tx.as_ref().ok_or(DeviceError::Disconnected)
    }

    /// Queues a launch without blocking.
    pub fn submit(&self, launch: StepLaunch) -> Result<LaunchHandle, DeviceError> {
        let (reply, rx) = bounded(1);
        match self.sender()?.try_send(Job::Launch { launch, reply }) {
            Ok(()) => Ok(LaunchHandle { rx }),
            Err(TrySendError::Full(_)) => Err(DeviceError::QueueFull {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(DeviceError::Disconnected),
        }
    }

    /// Blocks until every launch queued before this call has finished.
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        let (reply, rx) = bounded(1);
        self.sender()?
            .send(Job::Barrier { reply })
            .map_err(|_| DeviceError::Disconnected)?;
        rx.recv().map_err(|_| DeviceError::Disconnected)
    }

    fn shutdown(&mut self) {
        // Closing the channel lets the worker drain queued launches and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("device stream worker panicked");
            }
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(device: &dyn Device, rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Launch { launch, reply } => {
                let result = device.launch(&launch);
                if let Err(err) = &result {
                    error!(device = device.name(), step = launch.step, %err, "kernel launch failed");
                }
                let _ = reply.send(result);
            }
            Job::Barrier { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Completion handle for a queued launch.
#[derive(Debug)]
pub struct LaunchHandle {
    rx: Receiver<Result<Vec<f64>, DeviceError>>,
}

impl LaunchHandle {
    /// Waits for the launch and returns its currents.
    pub fn join(self) -> Result<Vec<f64>, DeviceError> {
        self.rx.recv().map_err(|_| DeviceError::Disconnected)?
    }

    /// Waits at most `timeout` for the launch.
    pub fn join_timeout(self, timeout: Duration) -> Result<Vec<f64>, DeviceError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => DeviceError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => DeviceError::Disconnected,
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::{DeviceAddress, SimulatedDevice};

    #[derive(Debug)]
    struct SlowDevice {
        delay: Duration,
    }

    impl Device for SlowDevice {
        fn name(&self) -> &str {
            "slow"
        }
        fn is_available(&self) -> bool {
            true
        }
        fn allocate(&self, _len: usize) -> Result<DeviceAddress, DeviceError> {
            Err(DeviceError::AllocationFailed {
                requested: 0,
                available: 0,
            })
        }
        fn free(&self, address: DeviceAddress) -> Result<(), DeviceError> {
            Err(DeviceError::InvalidAddress { address })
        }
        fn copy_to_device(&self, address: DeviceAddress, _bytes: &[u8]) -> Result<(), DeviceError> {
            Err(DeviceError::InvalidAddress { address })
        }
        fn copy_from_device(&self, address: DeviceAddress, _len: usize) -> Result<Vec<u8>, DeviceError> {
            Err(DeviceError::InvalidAddress { address })
        }
        fn read_symbol(&self, symbol: &str) -> Result<DeviceAddress, DeviceError> {
            Err(DeviceError::SymbolNotFound {
                symbol: symbol.to_string(),
            })
        }
        fn write_symbol(&self, _symbol: &str, _value: DeviceAddress) -> Result<(), DeviceError> {
            Ok(())
        }
        fn launch(&self, launch: &StepLaunch) -> Result<Vec<f64>, DeviceError> {
            thread::sleep(self.delay);
            Ok(vec![launch.global_time; launch.entries.len()])
        }
    }

    fn empty_launch(step: usize) -> StepLaunch {
        StepLaunch {
            dt: 0.1,
            global_time: step as f64 * 0.1,
            step,
            entries: Vec::new(),
        }
    }

    #[test]
    fn empty_launch_completes() {
        let device: Arc<dyn Device> = Arc::new(SimulatedDevice::new(&DeviceConfig::default()));
        let stream = DeviceStream::start(device, 4).unwrap();
        let handle = stream.submit(empty_launch(1)).unwrap();
        assert!(handle.join().unwrap().is_empty());
        stream.synchronize().unwrap();
    }

    #[test]
    fn full_queue_is_reported() {
        let device: Arc<dyn Device> = Arc::new(SlowDevice {
            delay: Duration::from_millis(200),
        });
        let stream = DeviceStream::start(device, 1).unwrap();

        let mut saw_full = false;
        let mut handles = Vec::new();
        for step in 1..=8 {
            match stream.submit(empty_launch(step)) {
                Ok(h) => handles.push(h),
                Err(DeviceError::QueueFull { capacity }) => {
                    assert_eq!(capacity, 1);
                    saw_full = true;
                    break;
                }
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert!(saw_full);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn join_timeout_expires() {
        let device: Arc<dyn Device> = Arc::new(SlowDevice {
            delay: Duration::from_millis(300),
        });
        let stream = DeviceStream::start(device, 2).unwrap();
        let handle = stream.submit(empty_launch(1)).unwrap();
        let err = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { duration_ms: 10 }));
    }

    #[test]
    fn synchronize_waits_for_earlier_launches() {
        let device: Arc<dyn Device> = Arc::new(SlowDevice {
            delay: Duration::from_millis(20),
        });
        let stream = DeviceStream::start(device, 4).unwrap();
        let first = stream.submit(empty_launch(1)).unwrap();
        let second = stream.submit(empty_launch(2)).unwrap();
        stream.synchronize().unwrap();

        // Both results are already available once the barrier returns.
        assert!(first.join_timeout(Duration::from_millis(1)).is_ok());
        assert!(second.join_timeout(Duration::from_millis(1)).is_ok());
    }
}
