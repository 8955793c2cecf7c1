use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use mio::event::Event;

/// Interest and readiness bits for a [`Channel`](crate::channel::Channel).
///
/// The same type serves as the interest mask a channel asks the poller for
/// and as the ready mask the poller reports back, abstracting away the
/// platform event layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ready(u8);

impl Ready {
    pub const NONE: Ready = Ready(0);
    pub const READABLE: Ready = Ready(1 << 0);
    pub const WRITABLE: Ready = Ready(1 << 1);
    pub const PRIORITY: Ready = Ready(1 << 2);
    /// Peer shut down its write side.
    pub const READ_CLOSED: Ready = Ready(1 << 3);
    /// Both directions are closed.
    pub const HUP: Ready = Ready(1 << 4);
    pub const ERROR: Ready = Ready(1 << 5);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: Ready) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    /// The mio registration for this interest mask, `None` when empty.
    pub(crate) fn to_interest(self) -> Option<mio::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        let mut ready = Ready::NONE;
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_priority() {
            ready |= Ready::PRIORITY;
        }
        if event.is_read_closed() {
            ready |= Ready::READ_CLOSED;
        }
        if event.is_read_closed() && event.is_write_closed() {
            ready |= Ready::HUP;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        ready
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

impl Not for Ready {
    type Output = Ready;

    fn not(self) -> Ready {
        Ready(!self.0)
    }
}

impl fmt::Display for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Ready, &str); 6] = [
            (Ready::READABLE, "IN"),
            (Ready::PRIORITY, "PRI"),
            (Ready::WRITABLE, "OUT"),
            (Ready::READ_CLOSED, "RDHUP"),
            (Ready::HUP, "HUP"),
            (Ready::ERROR, "ERR"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ready({self})")
    }
}
