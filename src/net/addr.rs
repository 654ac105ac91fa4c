//! Address helpers: local IP discovery and advertised address derivation.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Best-effort local non-loopback IPv4 address.
///
/// Connecting a UDP socket sends no packets; it only asks the kernel which
/// source address it would route from. Falls back to 127.0.0.1 on hosts
/// without a route.
pub fn internal_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1))?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Derive the address other processes should dial for `listen`.
///
/// A wildcard listen address is replaced by [`internal_ip`]; a concrete one
/// is advertised as-is.
pub fn advertised_address(listen: &str) -> io::Result<String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let ip = if addr.ip().is_unspecified() {
        internal_ip()
    } else {
        addr.ip()
    };

    Ok(SocketAddr::new(ip, addr.port()).to_string())
}

/// Hostname of this machine, or `unknown-host`.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }

    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_address_is_kept() {
        assert_eq!(advertised_address("127.0.0.1:5001").unwrap(), "127.0.0.1:5001");
    }

    #[test]
    fn wildcard_keeps_port() {
        let advertised: SocketAddr = advertised_address("0.0.0.0:5001").unwrap().parse().unwrap();
        assert_eq!(advertised.port(), 5001);
        assert!(!advertised.ip().is_unspecified());
    }

    #[test]
    fn rejects_garbage() {
        assert!(advertised_address("not-an-address").is_err());
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }
}
