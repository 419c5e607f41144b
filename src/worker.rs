// SPDX-License-Identifier: LGPL-3.0-only

//! Offloading of expensive computations to a separate thread. The task owns all of its inputs and
//! produces exactly one result, delivered over a channel.

use std::{sync::mpsc, thread};

use crate::OTRError;

/// `offload` runs `task` on a new thread and returns a handle to its pending result.
pub fn offload<T, F>(task: F) -> Pending<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = mpsc::sync_channel::<T>(1);
    thread::spawn(move || {
        let result = task();
        if sender.send(result).is_err() {
            log::debug!("Offloaded task finished after cancellation. Result discarded.");
        }
    });
    Pending { receiver }
}

/// `Pending` is the handle to the result of an offloaded task.
pub struct Pending<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> Pending<T> {
    /// `wait` blocks until the result is available. Fails with `OffloadFailed` if the task ended
    /// without producing a result, i.e. it panicked.
    pub fn wait(self) -> Result<T, OTRError> {
        self.receiver.recv().map_err(|_| OTRError::OffloadFailed)
    }

    /// `poll` returns the result if it is available, without blocking.
    pub fn poll(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// `cancel` abandons the task. Its result is discarded upon completion.
    pub fn cancel(self) {
        log::trace!("Cancelling offloaded task.");
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use crate::OTRError;

    use super::offload;

    #[test]
    fn test_offload_wait() {
        let pending = offload(|| 21 * 2);
        assert_eq!(Ok(42), pending.wait());
    }

    #[test]
    fn test_offload_poll() {
        let (release, gate) = mpsc::channel::<()>();
        let pending = offload(move || {
            gate.recv().unwrap();
            "done"
        });
        assert_eq!(None, pending.poll());
        release.send(()).unwrap();
        let mut result = None;
        for _ in 0..100 {
            result = pending.poll();
            if result.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(Some("done"), result);
    }

    #[test]
    fn test_offload_panicking_task() {
        let pending = offload(|| -> u32 { panic!("task failure") });
        assert_eq!(Err(OTRError::OffloadFailed), pending.wait());
    }

    #[test]
    fn test_offload_cancel() {
        let (done, finished) = mpsc::channel::<()>();
        let pending = offload(move || {
            thread::sleep(Duration::from_millis(20));
            done.send(()).unwrap();
            7u8
        });
        pending.cancel();
        finished.recv().unwrap();
    }
}
