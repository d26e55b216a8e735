//! Identifier types
//!
//! Channel ids are issued by the registry under its lock and are never
//! reused, so a late callback that looks an id up again can only ever
//! find the channel it was scheduled for, or nothing.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identifier of a channel.
///
/// Zero is reserved as the "no channel" sentinel; the registry starts
/// issuing at 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Sentinel value indicating no channel
    pub const NONE: ChannelId = ChannelId(0);

    #[inline]
    pub const fn new(id: u64) -> Self {
        ChannelId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The id issued after this one.
    #[inline]
    pub const fn next(self) -> Self {
        ChannelId(self.0 + 1)
    }
}

impl From<u64> for ChannelId {
    #[inline]
    fn from(id: u64) -> Self {
        ChannelId(id)
    }
}

impl From<ChannelId> for u64 {
    #[inline]
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ChannelId(NONE)")
        } else {
            write!(f, "ChannelId({})", self.0)
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        ChannelId::NONE
    }
}

macro_rules! plain_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(id: u64) -> Self {
                $name(id)
            }
        }
    };
}

plain_id!(
    /// Identifier of a listening socket created by `listen`.
    AcceptorId
);

plain_id!(
    /// Caller-chosen tag reported with every event of a channel created
    /// by `connect` or `import`. Accepted channels carry their acceptor id.
    SourceId
);

plain_id!(
    /// Caller-chosen identifier of a periodic or one-shot clock.
    ClockId
);

/// Handle returned by `EventManager::register_timer`, used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl TimerId {
    /// Generate a new unique timer id
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_basics() {
        let id = ChannelId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert!(!id.is_none());
        assert_eq!(id.next(), ChannelId::new(43));
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_channel_id_none() {
        assert!(ChannelId::NONE.is_none());
        assert_eq!(ChannelId::default(), ChannelId::NONE);
        assert_eq!(format!("{:?}", ChannelId::NONE), "ChannelId(NONE)");
    }

    #[test]
    fn test_timer_id_uniqueness() {
        let ids: Vec<_> = (0..1000).map(|_| TimerId::next()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
    }
}
