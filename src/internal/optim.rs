cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[doc(hidden)]
        #[inline(always)]
        pub fn _unlikely(b: bool) -> bool {
            #[allow(unused_unsafe)]
            unsafe {
                core::intrinsics::unlikely(b)
            }
        }
    } else {
        #[cold]
        #[inline(always)]
        fn cold() {}

        #[doc(hidden)]
        #[inline(always)]
        pub fn _unlikely(b: bool) -> bool {
            if b {
                cold()
            }
            b
        }
    }
}

macro_rules! unlikely {
    ($e:expr) => {
        $crate::internal::optim::_unlikely($e)
    };
}

/// Aborts the process if dropped. Unwinding out of a signal handler is never sound.
#[doc(hidden)]
pub struct AbortOnPanic([(); 0]);

impl AbortOnPanic {
    #[doc(hidden)]
    #[inline(always)]
    pub const fn begin() -> Self {
        AbortOnPanic([(); 0])
    }

    #[doc(hidden)]
    #[inline(always)]
    pub fn end(self) {
        std::mem::forget(self)
    }
}

impl Drop for AbortOnPanic {
    #[inline(never)]
    #[cold]
    fn drop(&mut self) {
        std::process::abort()
    }
}

macro_rules! abort_on_panic {
    ($($t:tt)*) => {
        {
            let _no_panic = $crate::internal::optim::AbortOnPanic::begin();
            let result = {
                $($t)*
            };
            $crate::internal::optim::AbortOnPanic::end(_no_panic);
            result
        }
    };
}
