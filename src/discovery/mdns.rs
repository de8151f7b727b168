//! One-shot mDNS DNS-SD queries for LXI and HiSLIP instruments.
//!
//! A PTR query for the service type is multicast to `224.0.0.251:5353`,
//! then responses are collected for a short window and their PTR/SRV/A
//! records are associated by name into `(instance, host, port, IPv4)`
//! tuples. Wire format per RFC 1035, including compression pointers.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;
const LISTEN_WINDOW: Duration = Duration::from_millis(2500);
const RESPONSE_BUF_LEN: usize = 4096;

const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_SRV: u16 = 33;
const CLASS_IN: u16 = 1;

/// Everything learned about one advertised service instance.
#[derive(Debug, Default, Clone)]
struct Record {
    instance: String,
    host: String,
    port: u16,
    ipv4: Option<Ipv4Addr>,
}

#[derive(Debug, Default)]
struct RecordSet {
    records: Vec<Record>,
}

impl RecordSet {
    fn entry(&mut self, instance: &str) -> &mut Record {
        if let Some(index) = self
            .records
            .iter()
            .position(|r| r.instance.eq_ignore_ascii_case(instance))
        {
            return &mut self.records[index];
        }
        self.records.push(Record {
            instance: instance.to_string(),
            ..Record::default()
        });
        self.records.last_mut().expect("just pushed")
    }
}

/// Build a PTR query for `service` (e.g. `_lxi._tcp.local`): a 12-byte
/// header with QDCOUNT=1, the QNAME as length-prefixed labels, QTYPE=PTR,
/// QCLASS=IN.
fn build_query(service: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12 + service.len() + 6);
    packet.extend_from_slice(&[
        0x00, 0x00, // transaction ID (0 for mDNS)
        0x00, 0x00, // flags
        0x00, 0x01, // QDCOUNT = 1
        0x00, 0x00, // ANCOUNT
        0x00, 0x00, // NSCOUNT
        0x00, 0x00, // ARCOUNT
    ]);
    for label in service.split('.').filter(|l| !l.is_empty()) {
        packet.push(u8::try_from(label.len()).unwrap_or(63));
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0); // root label
    packet.extend_from_slice(&TYPE_PTR.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    packet
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(offset)?, *buf.get(offset + 1)?]))
}

/// Parse a possibly-compressed DNS name starting at `offset`. Returns the
/// dotted name and the offset just past the name in the original stream.
/// Pointer chains are bounded against the buffer length so malformed
/// responses cannot loop.
fn parse_name(buf: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut resume: Option<usize> = None;
    let mut jumps = 0usize;

    loop {
        let len = *buf.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = *buf.get(offset + 1)? as usize;
            if resume.is_none() {
                resume = Some(offset + 2);
            }
            offset = ((len & 0x3F) << 8) | low;
            jumps += 1;
            if jumps > buf.len() {
                return None;
            }
            continue;
        }
        let label = buf.get(offset + 1..offset + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        offset += 1 + len;
    }

    Some((name, resume.unwrap_or(offset)))
}

/// Walk one response: skip the questions, then collect PTR, SRV, and A
/// records from the answer and additional sections.
fn parse_response(buf: &[u8], set: &mut RecordSet) {
    if buf.len() < 12 {
        return;
    }
    let Some(qdcount) = read_u16(buf, 4) else { return };
    let Some(ancount) = read_u16(buf, 6) else { return };
    let Some(arcount) = read_u16(buf, 10) else { return };

    let mut pos = 12usize;

    for _ in 0..qdcount {
        let Some((_, next)) = parse_name(buf, pos) else {
            return;
        };
        pos = next + 4; // QTYPE + QCLASS
    }

    for _ in 0..u32::from(ancount) + u32::from(arcount) {
        let Some((name, next)) = parse_name(buf, pos) else {
            return;
        };
        pos = next;

        let Some(rtype) = read_u16(buf, pos) else { return };
        let Some(rdlen) = read_u16(buf, pos + 8) else { return };
        pos += 10;
        let rdlen = rdlen as usize;
        if buf.len() < pos + rdlen {
            return;
        }

        match rtype {
            TYPE_PTR => {
                // Service type -> instance name; creates the entry.
                if let Some((target, _)) = parse_name(buf, pos) {
                    trace!(%target, "PTR");
                    set.entry(&target);
                }
            }
            TYPE_SRV => {
                // priority(2) weight(2) port(2) target.
                if rdlen >= 7 {
                    if let (Some(port), Some((target, _))) =
                        (read_u16(buf, pos + 4), parse_name(buf, pos + 6))
                    {
                        trace!(%name, %target, port, "SRV");
                        let record = set.entry(&name);
                        record.port = port;
                        record.host = target;
                    }
                }
            }
            TYPE_A => {
                if rdlen == 4 {
                    let ip = Ipv4Addr::new(buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]);
                    trace!(%name, %ip, "A");
                    // Attach to every record advertising this hostname,
                    // whether keyed by SRV target or instance name.
                    for record in &mut set.records {
                        if record.host.eq_ignore_ascii_case(&name)
                            || record.instance.eq_ignore_ascii_case(&name)
                        {
                            record.ipv4 = Some(ip);
                        }
                    }
                    let record = set.entry(&name);
                    if record.ipv4.is_none() {
                        record.ipv4 = Some(ip);
                    }
                }
            }
            _ => {}
        }
        pos += rdlen;
    }
}

/// A multicast listener on 0.0.0.0:5353: reuse-addr (and reuse-port where
/// available) so we can coexist with a system mDNS responder, TTL 255,
/// loopback disabled.
fn open_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    socket.join_multicast_v4(&MDNS_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_read_timeout(Some(LISTEN_WINDOW))?;
    Ok(socket.into())
}

fn sweep(service: &str) -> std::io::Result<RecordSet> {
    let socket = open_socket()?;
    let query = build_query(service);
    socket.send_to(&query, (MDNS_GROUP, MDNS_PORT))?;

    let mut set = RecordSet::default();
    let mut buf = [0u8; RESPONSE_BUF_LEN];
    // Collect until the listen window closes.
    while let Ok((len, _)) = socket.recv_from(&mut buf) {
        parse_response(&buf[..len], &mut set);
    }
    Ok(set)
}

fn emit(set: &RecordSet, is_hislip: bool, results: &mut Vec<String>) {
    for record in &set.records {
        let Some(ip) = record.ipv4 else { continue };
        if is_hislip {
            results.push(format!("TCPIP0::{ip}::hislip0::INSTR"));
        } else {
            results.push(format!("TCPIP0::{ip}::inst0::INSTR"));
            if record.port > 0 {
                results.push(format!("TCPIP0::{ip}::{}::SOCKET", record.port));
            }
        }
    }
}

/// Query one service type and append the resource strings of every
/// instance that resolved to an IPv4 address. Network failures only skip
/// this sub-discoverer.
pub(crate) fn discover_service(service: &str, is_hislip: bool, results: &mut Vec<String>) {
    match sweep(service) {
        Ok(set) => {
            debug!(service, instances = set.records.len(), "mDNS sweep");
            emit(&set, is_hislip, results);
        }
        Err(e) => debug!(service, "mDNS sweep unavailable: {e}"),
    }
}

#[cfg(test)]
mod unit {
    use std::net::Ipv4Addr;

    use super::{build_query, emit, parse_name, parse_response, RecordSet};

    #[test]
    fn queries_carry_one_ptr_question() {
        let q = build_query("_lxi._tcp.local");
        assert_eq!(&q[..12], &[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
        // QNAME: 4"_lxi" 4"_tcp" 5"local" 0
        let mut expected = vec![4u8];
        expected.extend_from_slice(b"_lxi");
        expected.push(4);
        expected.extend_from_slice(b"_tcp");
        expected.push(5);
        expected.extend_from_slice(b"local");
        expected.push(0);
        expected.extend_from_slice(&[0x00, 0x0C, 0x00, 0x01]); // PTR, IN
        assert_eq!(&q[12..], expected.as_slice());
    }

    #[test]
    fn compressed_names_follow_pointers() {
        // Offset 0: "scope.local" labels; offset 20: pointer to offset 0.
        let mut buf = vec![5u8];
        buf.extend_from_slice(b"scope");
        buf.push(5);
        buf.extend_from_slice(b"local");
        buf.push(0);
        while buf.len() < 20 {
            buf.push(0xAA);
        }
        buf.extend_from_slice(&[0xC0, 0x00]);

        let (name, next) = parse_name(&buf, 20).expect("pointer should resolve");
        assert_eq!(name, "scope.local");
        assert_eq!(next, 22);
    }

    #[test]
    fn pointer_loops_are_rejected() {
        // A pointer that points at itself.
        let buf = [0xC0u8, 0x00];
        assert!(parse_name(&buf, 0).is_none());
    }

    /// A synthetic response carrying PTR + SRV + A records for one LXI
    /// instrument.
    fn sample_response() -> Vec<u8> {
        let mut buf = Vec::new();
        // Header: response, 0 questions, 2 answers, 1 additional.
        buf.extend_from_slice(&[0, 0, 0x84, 0, 0, 0, 0, 2, 0, 0, 0, 1]);

        // Answer 1: PTR "_lxi._tcp.local" -> "scope._lxi._tcp.local"
        let service_name_offset = buf.len();
        for label in ["_lxi", "_tcp", "local"] {
            buf.push(u8::try_from(label.len()).unwrap());
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&[0, 12, 0, 1]); // PTR, IN
        buf.extend_from_slice(&[0, 0, 0, 120]); // TTL
        let instance_labels = {
            let mut v = vec![5u8];
            v.extend_from_slice(b"scope");
            v.extend_from_slice(&[0xC0, u8::try_from(service_name_offset).unwrap()]);
            v
        };
        buf.extend_from_slice(&u16::try_from(instance_labels.len()).unwrap().to_be_bytes());
        let instance_name_offset = buf.len();
        buf.extend_from_slice(&instance_labels);

        // Answer 2: SRV for the instance -> port 5025, target "scope.local"
        buf.extend_from_slice(&[0xC0, u8::try_from(instance_name_offset).unwrap()]);
        buf.extend_from_slice(&[0, 33, 0, 1]); // SRV, IN
        buf.extend_from_slice(&[0, 0, 0, 120]); // TTL
        let target_labels = {
            let mut v = vec![5u8];
            v.extend_from_slice(b"scope");
            v.push(5);
            v.extend_from_slice(b"local");
            v.push(0);
            v
        };
        let rdata_len = 6 + target_labels.len();
        buf.extend_from_slice(&u16::try_from(rdata_len).unwrap().to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]); // priority, weight
        buf.extend_from_slice(&5025u16.to_be_bytes());
        let target_name_offset = buf.len();
        buf.extend_from_slice(&target_labels);

        // Additional: A "scope.local" -> 192.168.1.80
        buf.extend_from_slice(&[0xC0, u8::try_from(target_name_offset).unwrap()]);
        buf.extend_from_slice(&[0, 1, 0, 1]); // A, IN
        buf.extend_from_slice(&[0, 0, 0, 120]); // TTL
        buf.extend_from_slice(&[0, 4]);
        buf.extend_from_slice(&[192, 168, 1, 80]);

        buf
    }

    #[test]
    fn ptr_srv_a_records_associate_by_name() {
        let mut set = RecordSet::default();
        parse_response(&sample_response(), &mut set);

        let record = set
            .records
            .iter()
            .find(|r| r.instance == "scope._lxi._tcp.local")
            .expect("PTR should have created the instance");
        assert_eq!(record.host, "scope.local");
        assert_eq!(record.port, 5025);
        assert_eq!(record.ipv4, Some(Ipv4Addr::new(192, 168, 1, 80)));
    }

    #[test]
    fn resolved_records_emit_instr_and_socket_strings() {
        let mut set = RecordSet::default();
        parse_response(&sample_response(), &mut set);

        let mut results = Vec::new();
        emit(&set, false, &mut results);
        assert!(results.contains(&"TCPIP0::192.168.1.80::inst0::INSTR".to_string()));
        assert!(results.contains(&"TCPIP0::192.168.1.80::5025::SOCKET".to_string()));

        let mut hislip_results = Vec::new();
        emit(&set, true, &mut hislip_results);
        assert!(
            hislip_results.contains(&"TCPIP0::192.168.1.80::hislip0::INSTR".to_string())
        );
    }
}
