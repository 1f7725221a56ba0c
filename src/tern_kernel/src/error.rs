//! Status codes and per-operation error types.
//!
//! Every kernel operation fails with a value drawn from the closed set
//! [`ResultCode`]. Each public operation gets its own narrow enum listing
//! only the codes it can actually produce, so `match`es stay exhaustive and
//! impossible errors stay unrepresentable.
use core::fmt;

/// The closed set of status codes a kernel operation can produce.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation completed.
    Success = 0,
    /// A counter or queue would exceed its maximum value.
    Overflow = -1,
    /// The operation is not permitted in the calling context (interrupt
    /// context, CPU Lock active, or the scheduler is not running).
    BadContext = -2,
    /// The object is not in a state that permits the operation.
    BadState = -3,
    /// The wait expired, or a polling operation found the condition
    /// unsatisfied.
    Timeout = -4,
    /// A parameter has an invalid value.
    BadParam = -5,
    /// A counter would fall below zero.
    Underflow = -6,
    /// No room in the object's storage.
    OutOfMemory = -7,
    /// The operation is forbidden by the object's attributes (e.g. a
    /// recursive lock of a non-recursive mutex).
    IllegalUse = -8,
    /// The control block is not initialized, or was deleted.
    NoExist = -9,
    /// The object was deleted while the caller was waiting on it.
    Deleted = -10,
    /// The wait was forcibly released by another thread.
    Released = -11,
    /// The mutex was abandoned by a terminated owner and has not been marked
    /// consistent yet.
    Abandoned = -12,
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Super:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as i8 ),*
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_error! {
            @into
            $( #[into( $Super )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Super0:path )]
        $( #[into( $Super:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Super0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error! {
            @into
            $( #[into( $Super )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

// Public per-operation error types
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`thread::create`](crate::thread::create).
    pub enum CreateThreadError {
        BadContext,
        BadParam,
        BadState,
    }
}

define_error! {
    /// Error type for [`thread::delete`](crate::thread::delete).
    pub enum DeleteThreadError {
        BadContext,
        NoExist,
        BadState,
    }
}

define_error! {
    /// Error type for [`thread::activate`](crate::thread::activate).
    pub enum ActivateThreadError {
        BadContext,
        NoExist,
        Overflow,
    }
}

define_error! {
    /// Error type for [`thread::terminate`](crate::thread::terminate).
    pub enum TerminateThreadError {
        BadContext,
        NoExist,
        BadState,
        IllegalUse,
    }
}

define_error! {
    /// Error type for [`thread::exit`](crate::thread::exit).
    pub enum ExitThreadError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`thread::sleep`](crate::thread::sleep).
    pub enum SleepError {
        BadContext,
        BadParam,
        Released,
    }
}

define_error! {
    /// Error type for [`thread::wakeup`](crate::thread::wakeup).
    pub enum WakeupError {
        BadContext,
        NoExist,
        BadState,
    }
}

define_error! {
    /// Error type for [`thread::release_wait`](crate::thread::release_wait).
    pub enum ReleaseWaitError {
        BadContext,
        NoExist,
        BadState,
    }
}

define_error! {
    /// Error type for [`thread::suspend`](crate::thread::suspend).
    pub enum SuspendThreadError {
        BadContext,
        NoExist,
        BadState,
        Overflow,
    }
}

define_error! {
    /// Error type for [`thread::resume`](crate::thread::resume).
    pub enum ResumeThreadError {
        BadContext,
        NoExist,
        BadState,
    }
}

define_error! {
    /// Error type for [`thread::set_priority`](crate::thread::set_priority).
    pub enum SetPriorityError {
        BadContext,
        NoExist,
        BadParam,
        BadState,
    }
}

define_error! {
    /// Error type for the thread state queries.
    pub enum QueryThreadError {
        BadContext,
        NoExist,
        BadState,
    }
}

define_error! {
    /// Error type for object creation on semaphores, event flags, mutexes,
    /// pools, queues, and timers.
    pub enum CreateError {
        BadContext,
        BadParam,
        BadState,
    }
}

define_error! {
    /// Error type for object deletion.
    pub enum DeleteError {
        BadContext,
        NoExist,
    }
}

define_error! {
    /// Error type for non-mutating object queries.
    pub enum QueryError {
        BadContext,
        NoExist,
    }
}

define_error! {
    /// Error type for [`semaphore::acquire`](crate::semaphore::acquire).
    pub enum AcquireError {
        BadContext,
        NoExist,
        BadParam,
        Timeout,
        Released,
        Deleted,
    }
}

define_error! {
    /// Error type for [`semaphore::release`](crate::semaphore::release).
    pub enum SignalError {
        BadContext,
        NoExist,
        Overflow,
    }
}

define_error! {
    /// Error type for [`event_flags::wait`](crate::event_flags::wait).
    pub enum WaitFlagsError {
        BadContext,
        NoExist,
        BadParam,
        Timeout,
        Released,
        Deleted,
    }
}

define_error! {
    /// Error type for [`event_flags::set`](crate::event_flags::set) and
    /// [`event_flags::clear`](crate::event_flags::clear).
    pub enum UpdateFlagsError {
        BadContext,
        NoExist,
    }
}

define_error! {
    /// Error type for [`mutex::lock`](crate::mutex::lock).
    pub enum LockError {
        BadContext,
        NoExist,
        BadParam,
        IllegalUse,
        Timeout,
        Released,
        Deleted,
        Abandoned,
    }
}

define_error! {
    /// Error type for [`mutex::unlock`](crate::mutex::unlock).
    pub enum UnlockError {
        BadContext,
        NoExist,
        BadState,
    }
}

define_error! {
    /// Error type for [`mutex::mark_consistent`](crate::mutex::mark_consistent).
    pub enum MarkConsistentError {
        BadContext,
        NoExist,
        BadState,
    }
}

define_error! {
    /// Error type for [`mem_pool::get`](crate::mem_pool::get).
    pub enum GetBlockError {
        BadContext,
        NoExist,
        BadParam,
        Timeout,
        Released,
        Deleted,
    }
}

define_error! {
    /// Error type for [`mem_pool::release`](crate::mem_pool::release).
    pub enum ReleaseBlockError {
        BadContext,
        NoExist,
        BadParam,
        Overflow,
    }
}

define_error! {
    /// Error type for the blocking send operations of the data and message
    /// queues.
    pub enum SendError {
        BadContext,
        NoExist,
        BadParam,
        Timeout,
        Released,
        Deleted,
    }
}

define_error! {
    /// Error type for the blocking receive operations of the data and
    /// message queues.
    pub enum ReceiveError {
        BadContext,
        NoExist,
        BadParam,
        Timeout,
        Released,
        Deleted,
    }
}

define_error! {
    /// Error type for [`timer::alarm_start`](crate::timer::alarm_start),
    /// [`timer::cyclic_start`](crate::timer::cyclic_start), and their `stop`
    /// counterparts.
    pub enum TimerOpError {
        BadContext,
        NoExist,
        BadParam,
    }
}

// The result of a completed wait, delivered through the thread control
// block's result slot by whoever ended the wait.
// ---------------------------------------------------------------------------

define_error! {
    /// The reason a wait operation ended unsuccessfully.
    ///
    /// `sleep` maps its wait result by hand (an expired sleep is a success
    /// there), so `SleepError` is absent from this conversion list.
    #[into(AcquireError)]
    #[into(WaitFlagsError)]
    #[into(LockError)]
    #[into(GetBlockError)]
    #[into(SendError)]
    #[into(ReceiveError)]
    pub enum WaitError {
        Timeout,
        Released,
        Deleted,
    }
}

// Internal cross-cutting subsets. Each converts into every public error type
// that includes the corresponding code.
// ---------------------------------------------------------------------------

define_error! {
    /// `BadContext`
    #[into(CreateThreadError)]
    #[into(DeleteThreadError)]
    #[into(ActivateThreadError)]
    #[into(TerminateThreadError)]
    #[into(ExitThreadError)]
    #[into(SleepError)]
    #[into(WakeupError)]
    #[into(ReleaseWaitError)]
    #[into(SuspendThreadError)]
    #[into(ResumeThreadError)]
    #[into(SetPriorityError)]
    #[into(QueryThreadError)]
    #[into(CreateError)]
    #[into(DeleteError)]
    #[into(QueryError)]
    #[into(AcquireError)]
    #[into(SignalError)]
    #[into(WaitFlagsError)]
    #[into(UpdateFlagsError)]
    #[into(LockError)]
    #[into(UnlockError)]
    #[into(MarkConsistentError)]
    #[into(GetBlockError)]
    #[into(ReleaseBlockError)]
    #[into(SendError)]
    #[into(ReceiveError)]
    #[into(TimerOpError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_error! {
    /// `NoExist`
    #[into(DeleteThreadError)]
    #[into(ActivateThreadError)]
    #[into(TerminateThreadError)]
    #[into(WakeupError)]
    #[into(ReleaseWaitError)]
    #[into(SuspendThreadError)]
    #[into(ResumeThreadError)]
    #[into(SetPriorityError)]
    #[into(QueryThreadError)]
    #[into(DeleteError)]
    #[into(QueryError)]
    #[into(AcquireError)]
    #[into(SignalError)]
    #[into(WaitFlagsError)]
    #[into(UpdateFlagsError)]
    #[into(LockError)]
    #[into(UnlockError)]
    #[into(MarkConsistentError)]
    #[into(GetBlockError)]
    #[into(ReleaseBlockError)]
    #[into(SendError)]
    #[into(ReceiveError)]
    #[into(TimerOpError)]
    pub(crate) enum NoExistError {
        NoExist,
    }
}

define_error! {
    /// `BadParam`
    #[into(CreateThreadError)]
    #[into(SleepError)]
    #[into(SetPriorityError)]
    #[into(CreateError)]
    #[into(AcquireError)]
    #[into(WaitFlagsError)]
    #[into(LockError)]
    #[into(GetBlockError)]
    #[into(ReleaseBlockError)]
    #[into(SendError)]
    #[into(ReceiveError)]
    #[into(TimerOpError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_error! {
    /// `BadState`
    #[into(CreateThreadError)]
    #[into(DeleteThreadError)]
    #[into(TerminateThreadError)]
    #[into(WakeupError)]
    #[into(ReleaseWaitError)]
    #[into(SuspendThreadError)]
    #[into(ResumeThreadError)]
    #[into(SetPriorityError)]
    #[into(QueryThreadError)]
    #[into(CreateError)]
    #[into(UnlockError)]
    #[into(MarkConsistentError)]
    pub(crate) enum BadStateError {
        BadState,
    }
}
