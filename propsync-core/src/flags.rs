//! Per-property behavior flags.

use bitflags::bitflags;

bitflags! {
    /// Behavior flags, declared identically on master and slaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropertyFlags: u16 {
        /// Value lives in process memory and travels in `Set` requests
        /// instead of the shared segment.
        const USE_LOCAL_COPY = 1 << 0;
        /// Apply and notify even when the new value equals the current one.
        const NOTIFY_EVEN_IF_UNCHANGED = 1 << 1;
        /// Never notify clients of changes.
        const SUPPRESS_CLIENT_NOTIFICATION = 1 << 2;
        /// Do not notify the client whose request caused the change.
        const SUPPRESS_NOTIFY_ORIGINATING_CLIENT = 1 << 3;
        /// Do not notify a client when it first subscribes.
        const SUPPRESS_INITIAL_NOTIFY_ON_CONNECT = 1 << 4;
    }
}

impl Default for PropertyFlags {
    fn default() -> Self {
        Self::empty()
    }
}
