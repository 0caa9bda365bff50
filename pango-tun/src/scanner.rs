//! utun control-socket discovery
//!
//! After the OS has applied the tunnel network settings, the extension process
//! holds a connected kernel control socket for the new `utun` interface. Its
//! descriptor number is not published anywhere, so it is found by walking the
//! descriptor table and checking each candidate's peer address:
//!
//! 1. `getpeername` must succeed and report the `AF_SYSTEM` family.
//! 2. The peer's control id must equal the id the kernel assigned to
//!    [`UTUN_CONTROL_NAME`], resolved once with `CTLIOCGINFO`.
//!
//! The walk is bounded. The descriptor is usually low, but nothing guarantees
//! it, so the bound is configurable and a miss is not an error.

use std::io;

use once_cell::sync::OnceCell;

use crate::handle::TunnelHandle;

/// Kernel control name registered by the utun driver
pub const UTUN_CONTROL_NAME: &str = "com.apple.net.utun_control";

/// Highest descriptor number scanned by default
pub const DEFAULT_SCAN_LIMIT: i32 = 1024;

/// Read-only view of the process descriptor table
pub trait DescriptorTable: Send + Sync {
    /// Control id of the peer of `fd`
    ///
    /// Returns `None` when the descriptor is closed, is not a socket, or its
    /// peer is not in the system-control family.
    fn peer_control_id(&self, fd: i32) -> Option<u32>;

    /// Resolve the numeric id of a kernel control by name, using `fd` as the
    /// socket to issue the query on
    fn resolve_control_id(&self, fd: i32, name: &str) -> io::Result<u32>;
}

/// Source of the tunnel interface handle
pub trait HandleDiscovery: Send + Sync {
    /// Look for the handle; `None` if nothing matched
    fn discover(&self) -> Option<TunnelHandle>;

    /// Highest descriptor number inspected
    fn scan_limit(&self) -> i32;
}

/// Scanner for the utun control socket
pub struct ControlSocketScanner<T: DescriptorTable = SystemDescriptors> {
    table: T,
    limit: i32,
    control_name: String,
    control_id: OnceCell<u32>,
}

impl ControlSocketScanner<SystemDescriptors> {
    /// Create a scanner over this process's descriptor table
    pub fn new() -> Self {
        Self::with_table(SystemDescriptors)
    }
}

impl Default for ControlSocketScanner<SystemDescriptors> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DescriptorTable> ControlSocketScanner<T> {
    /// Create a scanner over an arbitrary descriptor table
    pub fn with_table(table: T) -> Self {
        Self {
            table,
            limit: DEFAULT_SCAN_LIMIT,
            control_name: UTUN_CONTROL_NAME.to_string(),
            control_id: OnceCell::new(),
        }
    }

    /// Set the highest descriptor number to inspect (inclusive)
    pub fn with_limit(mut self, limit: i32) -> Self {
        self.limit = limit.max(0);
        self
    }

    /// Match a different kernel control than utun
    pub fn with_control_name(mut self, name: impl Into<String>) -> Self {
        self.control_name = name.into();
        self.control_id = OnceCell::new();
        self
    }

    /// Highest descriptor number inspected
    pub fn limit(&self) -> i32 {
        self.limit
    }

    /// Control id resolved so far, if any
    pub fn cached_control_id(&self) -> Option<u32> {
        self.control_id.get().copied()
    }

    /// Find the utun control socket
    ///
    /// Returns the first descriptor in `0..=limit` whose peer is the utun
    /// control, or `None` if no descriptor matches.
    pub fn discover(&self) -> Option<TunnelHandle> {
        for fd in 0..=self.limit {
            let Some(peer_id) = self.table.peer_control_id(fd) else {
                continue;
            };

            let wanted = match self
                .control_id
                .get_or_try_init(|| self.table.resolve_control_id(fd, &self.control_name))
            {
                Ok(id) => *id,
                Err(e) => {
                    log::debug!("Failed to resolve control id via fd {}: {}", fd, e);
                    continue;
                }
            };

            if peer_id == wanted {
                log::debug!("Found {} socket on fd {}", self.control_name, fd);
                return Some(TunnelHandle::new(fd));
            }
        }

        log::debug!(
            "No {} socket among descriptors 0..={}",
            self.control_name,
            self.limit
        );
        None
    }
}

impl<T: DescriptorTable> HandleDiscovery for ControlSocketScanner<T> {
    fn discover(&self) -> Option<TunnelHandle> {
        ControlSocketScanner::discover(self)
    }

    fn scan_limit(&self) -> i32 {
        self.limit
    }
}

/// The real descriptor table of this process
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDescriptors;

#[cfg(any(target_os = "macos", target_os = "ios"))]
impl DescriptorTable for SystemDescriptors {
    fn peer_control_id(&self, fd: i32) -> Option<u32> {
        use std::mem::{size_of, zeroed};

        let mut addr: libc::sockaddr_ctl = unsafe { zeroed() };
        let mut len = size_of::<libc::sockaddr_ctl>() as libc::socklen_t;

        let rc = unsafe {
            libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 || i32::from(addr.sc_family) != libc::AF_SYSTEM {
            return None;
        }

        Some(addr.sc_id)
    }

    fn resolve_control_id(&self, fd: i32, name: &str) -> io::Result<u32> {
        use std::mem::zeroed;

        let mut info: libc::ctl_info = unsafe { zeroed() };
        let bytes = name.as_bytes();
        // ctl_name must stay NUL terminated
        if bytes.len() >= info.ctl_name.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("control name too long: {}", name),
            ));
        }
        for (slot, byte) in info.ctl_name.iter_mut().zip(bytes) {
            *slot = *byte as libc::c_char;
        }

        let rc = unsafe { libc::ioctl(fd, libc::CTLIOCGINFO, &mut info) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(info.ctl_id)
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
impl DescriptorTable for SystemDescriptors {
    fn peer_control_id(&self, _fd: i32) -> Option<u32> {
        None
    }

    fn resolve_control_id(&self, _fd: i32, name: &str) -> io::Result<u32> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("kernel control {} is only available on Apple platforms", name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Descriptor table backed by a map of fd -> peer control id
    #[derive(Default)]
    struct FakeTable {
        peers: HashMap<i32, u32>,
        utun_id: u32,
        fail_resolve_on: Vec<i32>,
        resolves: AtomicUsize,
    }

    impl DescriptorTable for FakeTable {
        fn peer_control_id(&self, fd: i32) -> Option<u32> {
            self.peers.get(&fd).copied()
        }

        fn resolve_control_id(&self, fd: i32, _name: &str) -> io::Result<u32> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            if self.fail_resolve_on.contains(&fd) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            Ok(self.utun_id)
        }
    }

    #[test]
    fn test_finds_matching_descriptor() {
        let table = FakeTable {
            peers: HashMap::from([(3, 11), (7, 42), (9, 42)]),
            utun_id: 42,
            ..Default::default()
        };
        let scanner = ControlSocketScanner::with_table(table);

        assert_eq!(scanner.discover(), Some(TunnelHandle::new(7)));
        assert_eq!(scanner.cached_control_id(), Some(42));
    }

    #[test]
    fn test_nothing_to_find() {
        let scanner = ControlSocketScanner::with_table(FakeTable::default());
        assert_eq!(scanner.discover(), None);
        assert_eq!(scanner.cached_control_id(), None);
    }

    #[test]
    fn test_descriptor_beyond_limit_is_invisible() {
        let table = FakeTable {
            peers: HashMap::from([(2000, 42)]),
            utun_id: 42,
            ..Default::default()
        };
        let scanner = ControlSocketScanner::with_table(table);
        assert_eq!(scanner.discover(), None);

        let table = FakeTable {
            peers: HashMap::from([(2000, 42)]),
            utun_id: 42,
            ..Default::default()
        };
        let scanner = ControlSocketScanner::with_table(table).with_limit(4096);
        assert_eq!(scanner.discover(), Some(TunnelHandle::new(2000)));
    }

    #[test]
    fn test_limit_is_inclusive() {
        let table = FakeTable {
            peers: HashMap::from([(16, 42)]),
            utun_id: 42,
            ..Default::default()
        };
        let scanner = ControlSocketScanner::with_table(table).with_limit(16);
        assert_eq!(scanner.discover(), Some(TunnelHandle::new(16)));
    }

    #[test]
    fn test_control_id_resolved_once() {
        let table = FakeTable {
            peers: HashMap::from([(3, 11), (4, 12), (5, 42)]),
            utun_id: 42,
            ..Default::default()
        };
        let scanner = ControlSocketScanner::with_table(table);

        assert_eq!(scanner.discover(), Some(TunnelHandle::new(5)));
        assert_eq!(scanner.discover(), Some(TunnelHandle::new(5)));
        assert_eq!(scanner.table.resolves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_resolution_is_retried() {
        let table = FakeTable {
            peers: HashMap::from([(3, 42), (8, 42)]),
            utun_id: 42,
            fail_resolve_on: vec![3],
            ..Default::default()
        };
        let scanner = ControlSocketScanner::with_table(table);

        // fd 3 cannot resolve, so it is skipped and resolution retried on fd 8
        assert_eq!(scanner.discover(), Some(TunnelHandle::new(8)));
        assert_eq!(scanner.table.resolves.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_negative_limit_clamped() {
        let scanner = ControlSocketScanner::with_table(FakeTable::default()).with_limit(-5);
        assert_eq!(scanner.limit(), 0);
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    #[test]
    fn test_system_table_finds_nothing_off_apple() {
        assert_eq!(ControlSocketScanner::new().with_limit(64).discover(), None);
    }
}
