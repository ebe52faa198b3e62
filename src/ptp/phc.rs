//! Linux PTP Hardware Clock (PHC) access.
//!
//! Grounded on `original_source/core/ptp_clock.c`'s hardware-mode path:
//! a PHC is addressed either by device path (`/dev/ptpN`) or discovered
//! from a network interface via the `ETHTOOL_GET_TS_INFO` ioctl, and
//! read with `clock_gettime` against a dynamic clock id synthesized
//! from the open file descriptor (the `CLOCKFD` encoding documented in
//! `clock_gettime(2)`: `((~fd) << 3) | 3`).

use crate::error::{AudynError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

/// `((~fd) << 3) | 3`, per the Linux dynamic-clockid convention.
fn fd_to_clockid(fd: i32) -> libc::clockid_t {
    ((!fd) << 3) | 3
}

pub struct PhcHandle {
    file: File,
    clock_id: libc::clockid_t,
}

impl PhcHandle {
    pub fn open(device_path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|e| AudynError::IoOpen {
                what: format!("PHC device {device_path}"),
                source: e,
            })?;
        let clock_id = fd_to_clockid(file.as_raw_fd());
        Ok(Self { file, clock_id })
    }

    /// Reads the PHC's current time via `clock_gettime` against the
    /// synthesized dynamic clock id.
    pub fn gettime_ns(&self) -> Option<u64> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `clock_id` is derived from a file descriptor we hold
        // open for the lifetime of `self`, and `ts` is a valid out-param.
        let rc = unsafe { libc::clock_gettime(self.clock_id, &mut ts) };
        if rc != 0 {
            return None;
        }
        if ts.tv_sec < 0 || ts.tv_nsec < 0 {
            return None;
        }
        Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
    }

    /// Keeps the open PHC fd alive alongside the clock id without
    /// exposing it; used only to assert liveness in health checks.
    pub fn is_open(&self) -> bool {
        self.file.as_raw_fd() >= 0
    }
}

#[repr(C)]
struct EthtoolTsInfo {
    cmd: u32,
    so_timestamping: u32,
    phc_index: i32,
    tx_types: u32,
    tx_reserved: [u32; 3],
    rx_filters: u32,
    rx_reserved: [u32; 3],
}

#[repr(C)]
struct IfReqTsInfo {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_data: *mut libc::c_void,
}

const ETHTOOL_GET_TS_INFO: u32 = 0x0000_0041;
const SIOCETHTOOL: libc::c_ulong = 0x8946;

/// Discovers the PHC index (`/dev/ptp<index>`) bound to a network
/// interface via the `ETHTOOL_GET_TS_INFO` ioctl, per
/// `original_source/core/ptp_clock.c::audyn_ptp_get_phc_index`.
pub fn phc_index_for_interface(interface: &str) -> Option<i32> {
    if interface.len() >= libc::IFNAMSIZ {
        return None;
    }

    // SAFETY: opens a plain UDP socket purely to issue an ioctl on it;
    // standard Linux idiom for ethtool/network ioctls.
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return None;
    }

    let mut ts_info = EthtoolTsInfo {
        cmd: ETHTOOL_GET_TS_INFO,
        so_timestamping: 0,
        phc_index: -1,
        tx_types: 0,
        tx_reserved: [0; 3],
        rx_filters: 0,
        rx_reserved: [0; 3],
    };

    let mut ifr_name = [0 as libc::c_char; libc::IFNAMSIZ];
    for (i, b) in interface.bytes().enumerate() {
        ifr_name[i] = b as libc::c_char;
    }

    let mut ifr = IfReqTsInfo {
        ifr_name,
        ifr_data: &mut ts_info as *mut EthtoolTsInfo as *mut libc::c_void,
    };

    // SAFETY: `ifr` is a valid, correctly-sized struct for SIOCETHTOOL;
    // the kernel writes into `ts_info` via `ifr_data`.
    let rc = unsafe { libc::ioctl(sock, SIOCETHTOOL, &mut ifr as *mut IfReqTsInfo) };
    // SAFETY: `sock` was returned by `socket(2)` above.
    unsafe {
        libc::close(sock);
    }

    if rc < 0 || ts_info.phc_index < 0 {
        return None;
    }
    Some(ts_info.phc_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clockid_encoding_matches_convention() {
        // fd=3 -> ~3 = -4 (two's complement) -> (-4 << 3) | 3 = -29
        assert_eq!(fd_to_clockid(3), -29);
    }

    #[test]
    fn overlong_interface_name_rejected() {
        let name: String = std::iter::repeat('x').take(64).collect();
        assert!(phc_index_for_interface(&name).is_none());
    }
}
