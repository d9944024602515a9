//! OS primitives the controller depends on.
//!
//! [`System`] is the narrow seam between the connectivity engine and the
//! host: radio-kill, USB presence, data-port discovery, link carrier,
//! interface addresses and the DHCP client process. [`LinuxSystem`] talks to
//! sysfs, `getifaddrs` and external tools; the simulated implementation lives
//! in [`crate::sim`].

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::{UsbId, WwanConfig};
use crate::types::IpVersion;

/// How long a DHCP client gets to exit after SIGTERM.
const DHCP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running DHCP client. Dropping the handle terminates the process.
pub trait DhcpProcess: Send + 'static {
    fn terminate(&mut self);
}

pub trait System: Send + Sync + 'static {
    type Dhcp: DhcpProcess;

    /// Engage (`true`) or release the WWAN radio-kill switch.
    fn rfkill(&self, block: bool) -> io::Result<()>;

    fn usb_present(&self, id: &UsbId) -> bool;

    /// Serial data port of the modem, once enumerated.
    fn modem_port(&self) -> Option<PathBuf>;

    fn carrier(&self, iface: &str) -> bool;

    /// First global address of `version` on `iface`.
    fn ip_address(&self, iface: &str, version: IpVersion) -> Option<IpAddr>;

    fn spawn_dhcp(&self, iface: &str) -> io::Result<Self::Dhcp>;
}

// ─── Linux ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LinuxSystem {
    sysfs: PathBuf,
    port: Option<PathBuf>,
    port_label: String,
    dhcp_command: Vec<String>,
}

impl LinuxSystem {
    pub fn new(config: &WwanConfig) -> Self {
        LinuxSystem {
            sysfs: PathBuf::from("/sys"),
            port: config.port.clone(),
            port_label: config.port_label.clone(),
            dhcp_command: config.dhcp_command.clone(),
        }
    }

    /// Read sysfs from somewhere other than `/sys`.
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs = root.into();
        self
    }

    fn read_attr(&self, rel: impl AsRef<Path>) -> Option<String> {
        std::fs::read_to_string(self.sysfs.join(rel))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl System for LinuxSystem {
    type Dhcp = DhcpClient;

    fn rfkill(&self, block: bool) -> io::Result<()> {
        let action = if block { "block" } else { "unblock" };
        let status = Command::new("rfkill")
            .args([action, "wwan"])
            .stdout(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(io::Error::other(format!("rfkill {action} wwan exited with {status}")));
        }
        tracing::debug!(action, "rfkill");
        Ok(())
    }

    fn usb_present(&self, id: &UsbId) -> bool {
        let Ok(entries) = std::fs::read_dir(self.sysfs.join("bus/usb/devices")) else {
            return false;
        };
        let vendor = format!("{:04x}", id.vendor);
        let product = format!("{:04x}", id.product);
        entries.flatten().any(|entry| {
            let dir = entry.path();
            let attr = |name: &str| {
                std::fs::read_to_string(dir.join(name))
                    .map(|s| s.trim().to_ascii_lowercase())
                    .ok()
            };
            attr("idVendor").as_deref() == Some(vendor.as_str())
                && attr("idProduct").as_deref() == Some(product.as_str())
        })
    }

    fn modem_port(&self) -> Option<PathBuf> {
        if let Some(port) = &self.port {
            return port.exists().then(|| port.clone());
        }
        let entries = std::fs::read_dir(self.sysfs.join("class/tty")).ok()?;
        let mut candidates: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with("ttyACM"))
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .find(|name| {
                self.read_attr(format!("class/tty/{name}/device/interface"))
                    .is_some_and(|label| label == self.port_label)
            })
            .map(|name| PathBuf::from("/dev").join(name))
    }

    fn carrier(&self, iface: &str) -> bool {
        // Reading `carrier` on a down interface fails with EINVAL.
        self.read_attr(format!("class/net/{iface}/carrier"))
            .is_some_and(|v| v == "1")
    }

    fn ip_address(&self, iface: &str, version: IpVersion) -> Option<IpAddr> {
        interface_address(iface, version)
    }

    fn spawn_dhcp(&self, iface: &str) -> io::Result<DhcpClient> {
        DhcpClient::spawn(&self.dhcp_command, iface)
    }
}

/// IPv6 `fe80::/10`.
pub fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Resolve the first address of `version` on `iface` via `getifaddrs`,
/// skipping IPv6 link-local addresses.
pub fn interface_address(iface: &str, version: IpVersion) -> Option<IpAddr> {
    let family = match version {
        IpVersion::V4 => libc::AF_INET,
        IpVersion::V6 => libc::AF_INET6,
    };

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return None;
        }

        let mut current = ifaddrs;
        let mut result = None;

        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;
            if ifa.ifa_addr.is_null() || i32::from((*ifa.ifa_addr).sa_family) != family {
                continue;
            }
            let name = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy();
            if name != iface {
                continue;
            }
            let ip = match version {
                IpVersion::V4 => {
                    let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)))
                }
                IpVersion::V6 => {
                    let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                    let v6 = Ipv6Addr::from(addr.sin6_addr.s6_addr);
                    if is_link_local_v6(&v6) {
                        continue;
                    }
                    IpAddr::V6(v6)
                }
            };
            result = Some(ip);
            break;
        }

        libc::freeifaddrs(ifaddrs);
        result
    }
}

// ─── DHCP client ────────────────────────────────────────────────────────

/// A DHCP client process bound to one interface.
pub struct DhcpClient {
    child: Option<Child>,
    iface: String,
}

impl DhcpClient {
    pub fn spawn(command: &[String], iface: &str) -> io::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty DHCP command"))?;
        let child = Command::new(program)
            .args(args)
            .arg(iface)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?;
        tracing::info!(pid = child.id(), iface, program = %program, "DHCP client started");
        Ok(DhcpClient {
            child: Some(child),
            iface: iface.to_string(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

impl DhcpProcess for DhcpClient {
    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        // SAFETY: `child.id()` is the pid of a process we spawned and have
        // not yet reaped, so it cannot have been recycled.
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }

        match wait_with_timeout(&mut child, DHCP_STOP_TIMEOUT) {
            Ok(()) => tracing::info!(iface = %self.iface, "DHCP client stopped"),
            Err(e) => {
                tracing::warn!(iface = %self.iface, error = %e, "DHCP client did not exit, killing");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl Drop for DhcpClient {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "child still running"));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
