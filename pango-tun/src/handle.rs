//! Tunnel interface handle

use std::fmt;

/// Raw descriptor number of the utun control socket
///
/// Discovery yields `Option<TunnelHandle>`: `None` means nothing was found,
/// while [`TunnelHandle::SENTINEL`] is the explicit "unset" value handed to the
/// engine when the controller proceeds without a discovered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelHandle(i32);

impl TunnelHandle {
    /// Placeholder handle used when discovery found nothing
    pub const SENTINEL: TunnelHandle = TunnelHandle(0);

    pub const fn new(fd: i32) -> Self {
        Self(fd)
    }

    /// The raw descriptor number
    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_sentinel(self) -> bool {
        self.0 == Self::SENTINEL.0
    }
}

#[cfg(unix)]
impl From<std::os::unix::io::RawFd> for TunnelHandle {
    fn from(fd: std::os::unix::io::RawFd) -> Self {
        Self(fd)
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sentinel() {
            write!(f, "fd:unset")
        } else {
            write!(f, "fd:{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel() {
        assert!(TunnelHandle::SENTINEL.is_sentinel());
        assert_eq!(TunnelHandle::SENTINEL.raw(), 0);
        assert!(!TunnelHandle::new(7).is_sentinel());
    }

    #[test]
    fn test_display() {
        assert_eq!(TunnelHandle::new(7).to_string(), "fd:7");
        assert_eq!(TunnelHandle::SENTINEL.to_string(), "fd:unset");
    }
}
