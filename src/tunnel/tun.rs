//! TUN device backed by tun-rs
//!
//! Supports macOS (utun), Linux (/dev/net/tun), and Windows (Wintun).

use std::io;
use std::net::Ipv4Addr;
use std::ops::Deref;

use async_trait::async_trait;
use tun_rs::{AsyncDevice, DeviceBuilder};

use super::TunIo;
use crate::error::{PointGuardError, TunnelError};

/// Async TUN device wrapper
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Create a TUN device carrying `address/prefix_len`
    pub fn create(address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self, PointGuardError> {
        check_privileges()?;

        #[allow(unused_mut)]
        let mut builder = DeviceBuilder::new();

        #[cfg(target_os = "windows")]
        {
            builder = builder.name("PointGuard");
        }

        let device = builder
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device.deref().name().map_err(|e| TunnelError::CreateFailed {
            reason: format!("Failed to get device name: {}", e),
        })?;

        tracing::info!(
            "Created TUN device: {} with address {}/{} (mtu {})",
            name,
            address,
            prefix_len,
            mtu
        );

        Ok(Self { device, name, mtu })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl TunIo for TunDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.device.send(packet).await
    }

    fn mtu(&self) -> usize {
        self.mtu as usize
    }
}

/// Check for required privileges to create TUN devices
fn check_privileges() -> Result<(), PointGuardError> {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./pointguard");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(TunnelError::InsufficientPrivileges {
                    message: "Root privileges required on macOS. Run with sudo.".to_string(),
                }
                .into());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        if !is_elevated_windows() {
            return Err(TunnelError::InsufficientPrivileges {
                message: "Administrator privileges required on Windows.".to_string(),
            }
            .into());
        }
    }

    Ok(())
}

/// Check if running as Administrator on Windows
#[cfg(target_os = "windows")]
fn is_elevated_windows() -> bool {
    use std::mem::MaybeUninit;
    use std::ptr::null_mut;

    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

    unsafe {
        let mut token: HANDLE = null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation: MaybeUninit<TOKEN_ELEVATION> = MaybeUninit::uninit();
        let mut size: u32 = std::mem::size_of::<TOKEN_ELEVATION>() as u32;

        let result = GetTokenInformation(
            token,
            TokenElevation,
            elevation.as_mut_ptr() as *mut _,
            size,
            &mut size,
        );

        CloseHandle(token);

        if result == 0 {
            return false;
        }

        elevation.assume_init().TokenIsElevated != 0
    }
}
