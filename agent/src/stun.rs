use anyhow::{anyhow, Result};
use getrandom::getrandom;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const STUN_TIMEOUT: Duration = Duration::from_secs(2);

/// NAT classification from two consecutive STUN observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    FullCone,
    PortRestrictedCone,
    Symmetric,
    Unknown,
}

impl NatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::FullCone => "full_cone",
            NatType::PortRestrictedCone => "port_restricted_cone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        }
    }
}

/// A STUN-discovered public endpoint for the local WireGuard port.
#[derive(Debug, Clone)]
pub struct PublicEndpoint {
    pub addr: SocketAddr,
    pub nat: NatType,
}

/// Discover the public mapping of `local_port`, trying each STUN server in
/// order. Must run before the tunnel binds the port; ephemeral ports cannot
/// be probed afterwards without port reuse.
pub fn discover_public_endpoint(servers: &[String], local_port: u16) -> Result<PublicEndpoint> {
    let sock = UdpSocket::bind(("0.0.0.0", local_port))?;
    sock.set_read_timeout(Some(STUN_TIMEOUT))?;

    let mut last_err = anyhow!("no STUN servers configured");

    for server in servers {
        let addr = match resolve_ipv4(server) {
            Ok(addr) => addr,
            Err(e) => {
                last_err = e;
                continue;
            }
        };

        match probe(&sock, addr) {
            Ok(ep) => return Ok(ep),
            Err(e) => last_err = e,
        }
    }

    Err(last_err)
}

fn resolve_ipv4(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| anyhow!("STUN server {} has no IPv4 address", server))
}

fn probe(sock: &UdpSocket, stun_addr: SocketAddr) -> Result<PublicEndpoint> {
    let first = binding_request(sock, stun_addr)?;
    std::thread::sleep(Duration::from_millis(200));
    let second = binding_request(sock, stun_addr)?;

    Ok(PublicEndpoint {
        addr: first,
        nat: classify(first, second),
    })
}

/// One RFC 5389 binding request/response exchange.
fn binding_request(sock: &UdpSocket, stun_addr: SocketAddr) -> Result<SocketAddr> {
    let mut tx = [0u8; 20];
    tx[1] = 0x01; // Binding Request, message length 0
    tx[4..8].copy_from_slice(&MAGIC_COOKIE);
    getrandom(&mut tx[8..])?;

    sock.send_to(&tx, stun_addr)?;

    let mut buf = [0u8; 256];
    loop {
        let (size, _from) = sock
            .recv_from(&mut buf)
            .map_err(|_| anyhow!("STUN timeout waiting for {}", stun_addr))?;

        if let Some(addr) = parse_binding_response(&buf[..size], &tx[8..20]) {
            return Ok(addr);
        }
    }
}

/// Scan a binding response for XOR-MAPPED-ADDRESS; None when the frame is
/// not a response to our transaction or carries no usable mapping.
fn parse_binding_response(buf: &[u8], transaction_id: &[u8]) -> Option<SocketAddr> {
    if buf.len() < 20 || &buf[8..20] != transaction_id {
        return None;
    }

    let mut i = 20;
    while i + 4 <= buf.len() {
        let attr_type = u16::from_be_bytes([buf[i], buf[i + 1]]);
        let attr_len = u16::from_be_bytes([buf[i + 2], buf[i + 3]]) as usize;
        i += 4;
        if i + attr_len > buf.len() {
            return None;
        }

        if attr_type == ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 {
            // Family byte at i+1; only IPv4 mappings are used.
            if buf[i + 1] != 0x01 {
                return None;
            }

            let port = u16::from_be_bytes([buf[i + 2], buf[i + 3]]) ^ 0x2112;
            let ip = [
                buf[i + 4] ^ MAGIC_COOKIE[0],
                buf[i + 5] ^ MAGIC_COOKIE[1],
                buf[i + 6] ^ MAGIC_COOKIE[2],
                buf[i + 7] ^ MAGIC_COOKIE[3],
            ];

            return Some(SocketAddr::from((ip, port)));
        }

        i += attr_len;
        // Attributes are 32-bit aligned.
        i += (4 - attr_len % 4) % 4;
    }

    None
}

/// Two identical mappings look like a cone NAT; same IP with a drifting
/// port is port-restricted; anything else is symmetric.
fn classify(first: SocketAddr, second: SocketAddr) -> NatType {
    if first == second {
        NatType::FullCone
    } else if first.ip() == second.ip() {
        NatType::PortRestrictedCone
    } else {
        NatType::Symmetric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(tx_id: &[u8; 12], ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 20];
        frame[0] = 0x01;
        frame[1] = 0x01; // Binding Success Response
        frame[2] = 0x00;
        frame[3] = 12; // one attribute
        frame[4..8].copy_from_slice(&MAGIC_COOKIE);
        frame[8..20].copy_from_slice(tx_id);

        frame.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        frame.extend_from_slice(&8u16.to_be_bytes());
        frame.push(0x00);
        frame.push(0x01); // IPv4
        frame.extend_from_slice(&(port ^ 0x2112).to_be_bytes());
        frame.push(ip[0] ^ MAGIC_COOKIE[0]);
        frame.push(ip[1] ^ MAGIC_COOKIE[1]);
        frame.push(ip[2] ^ MAGIC_COOKIE[2]);
        frame.push(ip[3] ^ MAGIC_COOKIE[3]);
        frame
    }

    #[test]
    fn parses_xor_mapped_address() {
        let tx_id = [7u8; 12];
        let frame = response(&tx_id, [203, 0, 113, 9], 40404);

        let addr = parse_binding_response(&frame, &tx_id).unwrap();
        assert_eq!(addr, "203.0.113.9:40404".parse().unwrap());
    }

    #[test]
    fn rejects_foreign_transaction() {
        let tx_id = [7u8; 12];
        let frame = response(&tx_id, [203, 0, 113, 9], 40404);

        assert!(parse_binding_response(&frame, &[8u8; 12]).is_none());
    }

    #[test]
    fn classification_rules() {
        let a: SocketAddr = "1.2.3.4:1000".parse().unwrap();
        let b: SocketAddr = "1.2.3.4:1001".parse().unwrap();
        let c: SocketAddr = "5.6.7.8:1000".parse().unwrap();

        assert_eq!(classify(a, a), NatType::FullCone);
        assert_eq!(classify(a, b), NatType::PortRestrictedCone);
        assert_eq!(classify(a, c), NatType::Symmetric);
    }
}
