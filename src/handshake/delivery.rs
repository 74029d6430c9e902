//! Getting a posted phase to the thread that owns a record.
//!
//! The phase itself is always stored in the record's mailbox before `notify` is called. A
//! delivery only has to make the owning thread run the phase handler.

use crate::{
    error::{ConfigError, SignalError},
    handshake::record::MutatorRecord,
};
#[cfg(unix)]
use crate::{handshake::dispatch, internal::current};
use core::fmt::Debug;

/// Wakes the owner of a record to handle its mailbox.
pub trait Delivery: Send + Sync + Debug + 'static {
    /// Returns true if `notify` interrupts the target thread, false if the target only notices
    /// at its next safepoint.
    fn is_asynchronous(&self) -> bool;

    /// Notifies the thread owning `record`.
    fn notify(&self, record: &MutatorRecord) -> Result<(), SignalError>;
}

/// Cooperative delivery: the mailbox is polled by
/// [`Mutator::safepoint`](crate::mutator::Mutator::safepoint).
#[derive(Copy, Clone, Debug, Default)]
pub struct PollDelivery;

impl Delivery for PollDelivery {
    #[inline]
    fn is_asynchronous(&self) -> bool {
        false
    }

    #[inline]
    fn notify(&self, _: &MutatorRecord) -> Result<(), SignalError> {
        Ok(())
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn signal_range() -> (i32, i32) {
            (libc::SIGRTMIN(), libc::SIGRTMAX())
        }
    } else if #[cfg(unix)] {
        fn signal_range() -> (i32, i32) {
            (libc::SIGUSR2, libc::SIGUSR2)
        }
    } else {
        fn signal_range() -> (i32, i32) {
            (0, -1)
        }
    }
}

/// The signal number used for phase delivery with the given offset.
pub fn phase_signal(offset: i32) -> Result<i32, ConfigError> {
    let (first, last) = signal_range();
    let available = last - first + 1;
    if offset < 0 || offset >= available {
        Err(ConfigError::SignalOffset { offset, available })
    } else {
        Ok(first + offset)
    }
}

#[cfg(unix)]
pub use self::signal::SignalDelivery;

#[cfg(unix)]
mod signal {
    use super::*;
    use crossbeam_utils::Backoff;
    use std::{
        io,
        mem,
        os::raw::{c_int, c_void},
        ptr,
        sync::atomic::{
            AtomicI32,
            Ordering::{Acquire, Release},
        },
    };
    use tracing::info;

    const NOT_INSTALLED: i32 = 0;
    const INSTALLING: i32 = -1;

    /// The signal number the process wide handler is installed for.
    static INSTALLED: AtomicI32 = AtomicI32::new(NOT_INSTALLED);

    /// Delivery through a real-time (or user) signal sent with `pthread_kill`.
    ///
    /// The handler is installed once per process, and stays installed. Every `SignalDelivery` in
    /// a process must use the same signal.
    #[derive(Copy, Clone, Debug)]
    pub struct SignalDelivery {
        signo: c_int,
    }

    impl SignalDelivery {
        /// Installs the phase handler for `signo` if it isn't already.
        pub fn install(signo: c_int) -> Result<Self, SignalError> {
            let backoff = Backoff::new();
            loop {
                match INSTALLED.load(Acquire) {
                    NOT_INSTALLED => {
                        if crate::cas::change(&INSTALLED, NOT_INSTALLED, INSTALLING).succeeded {
                            let result = unsafe { install_handler(signo) };
                            INSTALLED.store(
                                if result.is_ok() { signo } else { NOT_INSTALLED },
                                Release,
                            );
                            result?;
                            info!(signo, "phase signal handler installed");
                            return Ok(SignalDelivery { signo });
                        }
                    }
                    INSTALLING => backoff.snooze(),
                    installed if installed == signo => return Ok(SignalDelivery { signo }),
                    installed => {
                        return Err(SignalError::Conflict {
                            installed,
                            requested: signo,
                        })
                    }
                }
            }
        }

        #[inline]
        pub fn signo(&self) -> c_int {
            self.signo
        }
    }

    impl Delivery for SignalDelivery {
        #[inline]
        fn is_asynchronous(&self) -> bool {
            true
        }

        fn notify(&self, record: &MutatorRecord) -> Result<(), SignalError> {
            let rc = unsafe { libc::pthread_kill(record.pthread(), self.signo) };
            if rc == 0 {
                Ok(())
            } else {
                Err(SignalError::Send {
                    signo:  self.signo,
                    source: io::Error::from_raw_os_error(rc),
                })
            }
        }
    }

    unsafe fn install_handler(signo: c_int) -> Result<(), SignalError> {
        let mut action: libc::sigaction = mem::zeroed();
        let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) = on_signal;
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        let _ = libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signo, &action, ptr::null_mut()) != 0 {
            return Err(SignalError::Install {
                signo,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    extern "C" fn on_signal(_: c_int, _: *mut libc::siginfo_t, _: *mut c_void) {
        abort_on_panic! {
            let errno = Errno::save();
            let _ = current::with(dispatch::deliver);
            errno.restore();
        }
    }

    /// The interrupted code's errno, which the handler must not clobber.
    struct Errno(c_int);

    impl Errno {
        #[inline]
        fn save() -> Self {
            Errno(unsafe { errno_location().map_or(0, |p| *p) })
        }

        #[inline]
        fn restore(self) {
            if let Some(p) = unsafe { errno_location() } {
                unsafe { *p = self.0 }
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "emscripten"))]
    unsafe fn errno_location() -> Option<*mut c_int> {
        Some(libc::__errno_location())
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    unsafe fn errno_location() -> Option<*mut c_int> {
        Some(libc::__error())
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "emscripten",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    )))]
    unsafe fn errno_location() -> Option<*mut c_int> {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn offsets() {
        let (first, last) = signal_range();
        if first <= last {
            assert_eq!(phase_signal(0), Ok(first));
            assert_eq!(phase_signal(last - first), Ok(last));
        }
        assert!(phase_signal(last - first + 1).is_err());
        assert!(phase_signal(-1).is_err());
    }

    #[test]
    fn polling_never_fails() {
        let record = MutatorRecord::new(0, &Default::default(), std::ptr::null_mut());
        assert!(!PollDelivery.is_asynchronous());
        assert!(PollDelivery.notify(&record).is_ok());
    }
}
