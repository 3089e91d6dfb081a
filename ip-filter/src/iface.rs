use std::{ffi::CStr, io, net::Ipv4Addr, ptr};

use anyhow::{Context, Result, anyhow};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IfaceCandidate {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub ipv4: Option<Ipv4Addr>,
}

/// First interface that is up, not loopback, and carries a non-loopback
/// IPv4 address.
pub fn pick_interface<I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = IfaceCandidate>,
{
    candidates
        .into_iter()
        .find(|c| c.up && !c.loopback && c.ipv4.is_some_and(|addr| !addr.is_loopback()))
        .map(|c| c.name)
}

pub fn default_interface() -> Result<String> {
    pick_interface(list_interfaces()?)
        .ok_or_else(|| anyhow!("no up, non-loopback interface with an IPv4 address found"))
}

fn list_interfaces() -> Result<Vec<IfaceCandidate>> {
    let mut head: *mut libc::ifaddrs = ptr::null_mut();
    let rc = unsafe { libc::getifaddrs(&mut head) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("failed to enumerate interfaces");
    }

    let mut out = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // getifaddrs hands out a linked list valid until freeifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_name.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let flags = entry.ifa_flags as libc::c_int;
        let ipv4 = if entry.ifa_addr.is_null() {
            None
        } else if unsafe { (*entry.ifa_addr).sa_family } as libc::c_int == libc::AF_INET {
            let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
            Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
        } else {
            None
        };

        out.push(IfaceCandidate {
            name,
            up: flags & libc::IFF_UP != 0,
            loopback: flags & libc::IFF_LOOPBACK != 0,
            ipv4,
        });
    }

    unsafe { libc::freeifaddrs(head) };
    Ok(out)
}
