//! End-to-end tests against in-process mock instruments.
//!
//! A loopback server speaking VXI-11 (ONC-RPC over TCP) and one speaking
//! HiSLIP (sync + async channels) are built directly from the wire
//! formats; the full `open -> write("*IDN?") -> read -> close` flow must
//! round-trip the injected payloads through the public API.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use visa_native::{AccessMode, ReadTermination, ResourceManager};

const IDN_REPLY: &[u8] = b"Mock Instruments,MODEL 9000,SN0001,1.0.0\n";

// ---------------------------------------------------------------------
// VXI-11 mock
// ---------------------------------------------------------------------

fn be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_rpc_record(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut record = Vec::new();
    loop {
        let mut mark = [0u8; 4];
        stream.read_exact(&mut mark)?;
        let mark = u32::from_be_bytes(mark);
        let fragment_len = (mark & 0x7FFF_FFFF) as usize;
        let start = record.len();
        record.resize(start + fragment_len, 0);
        stream.read_exact(&mut record[start..])?;
        if mark & 0x8000_0000 != 0 {
            return Ok(record);
        }
    }
}

fn send_rpc_reply(stream: &mut TcpStream, xid: u32, result: &[u8]) -> std::io::Result<()> {
    let mut reply = Vec::new();
    reply.extend_from_slice(&xid.to_be_bytes());
    reply.extend_from_slice(&1u32.to_be_bytes()); // REPLY
    reply.extend_from_slice(&0u32.to_be_bytes()); // MSG_ACCEPTED
    reply.extend_from_slice(&0u32.to_be_bytes()); // verifier flavor
    reply.extend_from_slice(&0u32.to_be_bytes()); // verifier length
    reply.extend_from_slice(&0u32.to_be_bytes()); // ACCEPT_SUCCESS
    reply.extend_from_slice(result);

    let mark = 0x8000_0000u32 | u32::try_from(reply.len()).unwrap();
    stream.write_all(&mark.to_be_bytes())?;
    stream.write_all(&reply)
}

/// One recorded `device_write` call: the flags word and the payload.
type WriteLog = Vec<(u32, Vec<u8>)>;

/// Serve one VXI-11 core connection: create_link, device_write,
/// device_read (answering with `response`), device_readstb, device_clear,
/// destroy_link.
fn spawn_vxi11_core(
    max_recv_size: u32,
    response: &'static [u8],
) -> Result<(u16, JoinHandle<WriteLog>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let handle = std::thread::spawn(move || {
        let mut writes: WriteLog = Vec::new();
        let (mut stream, _) = listener.accept().expect("client should connect");
        let mut response_sent = false;

        loop {
            let Ok(call) = read_rpc_record(&mut stream) else {
                break;
            };
            let xid = be32(&call, 0);
            let procedure = be32(&call, 20);
            let params = &call[40..]; // past the AUTH_NULL call header

            match procedure {
                // create_link -> { error, lid, abort_port, max_recv_size }
                10 => {
                    let mut result = Vec::new();
                    result.extend_from_slice(&0u32.to_be_bytes());
                    result.extend_from_slice(&77u32.to_be_bytes());
                    result.extend_from_slice(&0u32.to_be_bytes());
                    result.extend_from_slice(&max_recv_size.to_be_bytes());
                    send_rpc_reply(&mut stream, xid, &result).unwrap();
                }
                // device_write -> { error, size }
                11 => {
                    let flags = be32(params, 12);
                    let data_len = be32(params, 16) as usize;
                    let data = params[20..20 + data_len].to_vec();
                    let mut result = Vec::new();
                    result.extend_from_slice(&0u32.to_be_bytes());
                    result.extend_from_slice(&u32::try_from(data.len()).unwrap().to_be_bytes());
                    writes.push((flags, data));
                    send_rpc_reply(&mut stream, xid, &result).unwrap();
                }
                // device_read -> { error, reason, data }
                12 => {
                    let payload: &[u8] = if response_sent { b"" } else { response };
                    response_sent = true;
                    let mut result = Vec::new();
                    result.extend_from_slice(&0u32.to_be_bytes());
                    result.extend_from_slice(&4u32.to_be_bytes()); // reason = END
                    result.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
                    result.extend_from_slice(payload);
                    result.resize(result.len() + ((4 - payload.len() % 4) % 4), 0);
                    send_rpc_reply(&mut stream, xid, &result).unwrap();
                }
                // device_readstb -> { error, stb }
                13 => {
                    let mut result = Vec::new();
                    result.extend_from_slice(&0u32.to_be_bytes());
                    result.extend_from_slice(&0x47u32.to_be_bytes());
                    send_rpc_reply(&mut stream, xid, &result).unwrap();
                }
                // device_clear -> { error }
                15 => {
                    send_rpc_reply(&mut stream, xid, &0u32.to_be_bytes()).unwrap();
                }
                // destroy_link -> { error }, then the link is gone
                23 => {
                    send_rpc_reply(&mut stream, xid, &0u32.to_be_bytes()).unwrap();
                    break;
                }
                other => panic!("unexpected VXI-11 procedure {other}"),
            }
        }
        writes
    });

    Ok((port, handle))
}

#[test]
fn vxi11_open_write_read_close_round_trip() -> Result<()> {
    let (port, server) = spawn_vxi11_core(65_536, IDN_REPLY)?;

    let mut rm = ResourceManager::new();
    let vi = rm.open(
        &format!("TCPIP0::127.0.0.1::{port}::INSTR"),
        AccessMode::NoLock,
        Duration::from_secs(2),
    )?;

    assert_eq!(rm.write(vi, b"*IDN?")?, 5);

    let mut buf = [0u8; 256];
    let (count, termination) = rm.read(vi, &mut buf)?;
    assert_eq!(&buf[..count], IDN_REPLY);
    assert_eq!(termination, ReadTermination::TermChar);

    assert_eq!(rm.read_status_byte(vi)?, 0x47);
    rm.clear(vi)?;
    rm.close(vi)?;

    let writes = server.join().expect("server thread should finish");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, 0x08, "single write carries the END flag");
    assert_eq!(writes[0].1, b"*IDN?");
    Ok(())
}

#[test]
fn vxi11_writes_chunk_to_max_recv_size_with_end_on_last() -> Result<()> {
    let (port, server) = spawn_vxi11_core(8, b"")?;

    let mut rm = ResourceManager::new();
    let vi = rm.open(
        &format!("TCPIP0::127.0.0.1::{port}::INSTR"),
        AccessMode::NoLock,
        Duration::from_secs(2),
    )?;

    assert_eq!(rm.write(vi, b"0123456789ABCDEFGHIJ")?, 20);
    rm.close(vi)?;

    let writes = server.join().expect("server thread should finish");
    let payloads: Vec<&[u8]> = writes.iter().map(|(_, d)| d.as_slice()).collect();
    assert_eq!(payloads, [&b"01234567"[..], &b"89ABCDEF"[..], &b"GHIJ"[..]]);
    assert_eq!(
        writes.iter().map(|(f, _)| *f).collect::<Vec<_>>(),
        [0, 0, 0x08],
        "only the final chunk may carry END"
    );
    Ok(())
}

#[test]
fn portmapper_getport_resolves_the_core_port() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("client should connect");
        let call = read_rpc_record(&mut stream).expect("one GETPORT call");
        assert_eq!(be32(&call, 12), 100_000, "portmapper program");
        assert_eq!(be32(&call, 20), 3, "GETPORT procedure");
        assert_eq!(be32(&call, 40), 0x0006_07AF, "queried program");
        send_rpc_reply(&mut stream, be32(&call, 0), &4242u32.to_be_bytes()).unwrap();
    });

    let core_port = visa_native::transport::vxi11::rpc::get_port(
        "127.0.0.1",
        port,
        0x0006_07AF,
        1,
        Duration::from_secs(2),
    )?;
    assert_eq!(core_port, 4242);
    server.join().unwrap();
    Ok(())
}

// ---------------------------------------------------------------------
// HiSLIP mock
// ---------------------------------------------------------------------

fn hislip_header(message_type: u8, control: u8, parameter: u32, payload_len: u64) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[0] = b'H';
    raw[1] = b'S';
    raw[2] = message_type;
    raw[3] = control;
    raw[4..8].copy_from_slice(&parameter.to_be_bytes());
    raw[8..16].copy_from_slice(&payload_len.to_be_bytes());
    raw
}

fn hislip_send(
    stream: &mut TcpStream,
    message_type: u8,
    control: u8,
    parameter: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&hislip_header(
        message_type,
        control,
        parameter,
        payload.len() as u64,
    ))?;
    stream.write_all(payload)
}

struct HislipMessage {
    message_type: u8,
    control: u8,
    parameter: u32,
    payload: Vec<u8>,
}

fn hislip_recv(stream: &mut TcpStream) -> std::io::Result<HislipMessage> {
    let mut raw = [0u8; 16];
    stream.read_exact(&mut raw)?;
    assert_eq!(&raw[..2], b"HS", "client sent a bad prologue");
    let parameter = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let payload_len = u64::from_be_bytes([
        raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
    ]);
    let mut payload = vec![0u8; usize::try_from(payload_len).unwrap()];
    stream.read_exact(&mut payload)?;
    Ok(HislipMessage {
        message_type: raw[2],
        control: raw[3],
        parameter,
        payload,
    })
}

/// Everything the mock device observed, for assertions after the fact.
#[derive(Default)]
struct HislipObservations {
    /// (message id, complete message payload) per client message.
    messages: Vec<(u32, Vec<u8>)>,
    /// Control codes echoed back in DeviceClearAcknowledge.
    clear_acks: Vec<u8>,
}

const MOCK_SESSION_ID: u16 = 0x0B0B;
const MOCK_STB: u8 = 0x5A;

/// Synchronous channel: accumulate Data/DataEnd into messages, answer
/// `*IDN?`, and participate in the device-clear dance when the async
/// thread signals one.
fn serve_hislip_sync(
    mut stream: TcpStream,
    clear_rx: &mpsc::Receiver<()>,
) -> HislipObservations {
    let mut observed = HislipObservations::default();
    let mut pending: Vec<u8> = Vec::new();
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    loop {
        if clear_rx.try_recv().is_ok() {
            // Step 3 of the clear dance: DeviceClearComplete with feature
            // flags in the control code.
            hislip_send(&mut stream, 8, 0x01, 0, &[]).unwrap();
        }

        let message = match hislip_recv(&mut stream) {
            Ok(message) => message,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break, // client hung up
        };

        match message.message_type {
            // Data: intermediate fragment.
            6 => pending.extend_from_slice(&message.payload),
            // DataEnd: message boundary.
            7 => {
                pending.extend_from_slice(&message.payload);
                let complete = std::mem::take(&mut pending);
                let is_idn = complete == b"*IDN?";
                observed.messages.push((message.parameter, complete));
                if is_idn {
                    hislip_send(&mut stream, 7, 0, message.parameter, IDN_REPLY).unwrap();
                }
            }
            // DeviceClearAcknowledge: step 4 of the clear dance.
            9 => observed.clear_acks.push(message.control),
            other => panic!("unexpected sync-channel message type {other}"),
        }
    }
    observed
}

/// Asynchronous channel: status queries and device-clear initiation.
fn serve_hislip_async(mut stream: TcpStream, clear_tx: &mpsc::Sender<()>) {
    loop {
        let Ok(message) = hislip_recv(&mut stream) else {
            break; // client hung up
        };
        match message.message_type {
            // AsyncStatusQuery -> AsyncStatusResponse, STB in the control
            // code.
            21 => hislip_send(&mut stream, 22, MOCK_STB, message.parameter, &[]).unwrap(),
            // AsyncDeviceClear -> AsyncDeviceClearAcknowledge, then hand
            // the sync channel its half of the dance.
            19 => {
                hislip_send(&mut stream, 23, 0, 0, &[]).unwrap();
                clear_tx.send(()).unwrap();
            }
            other => panic!("unexpected async-channel message type {other}"),
        }
    }
}

fn spawn_hislip_device() -> Result<(u16, JoinHandle<HislipObservations>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let handle = std::thread::spawn(move || {
        // Handshake, step 1: sync channel.
        let (mut sync_stream, _) = listener.accept().expect("sync connect");
        let init = hislip_recv(&mut sync_stream).expect("Initialize");
        assert_eq!(init.message_type, 0, "first sync message must be Initialize");
        assert_eq!(init.parameter >> 24, 1, "client major version");
        assert_eq!(init.payload, b"hislip0", "sub-address payload");
        let response_parameter = 0x0100_0000 | u32::from(MOCK_SESSION_ID);
        hislip_send(&mut sync_stream, 1, 0, response_parameter, &[]).unwrap();

        // Handshake, step 2: async channel.
        let (mut async_stream, _) = listener.accept().expect("async connect");
        let async_init = hislip_recv(&mut async_stream).expect("AsyncInitialize");
        assert_eq!(async_init.message_type, 17);
        assert_eq!(async_init.parameter, u32::from(MOCK_SESSION_ID));
        hislip_send(&mut async_stream, 18, 0, 0, &[]).unwrap();

        let (clear_tx, clear_rx) = mpsc::channel();
        let async_thread = std::thread::spawn(move || {
            serve_hislip_async(async_stream, &clear_tx);
        });
        let observed = serve_hislip_sync(sync_stream, &clear_rx);
        async_thread.join().expect("async channel thread");
        observed
    });

    Ok((port, handle))
}

#[test]
fn hislip_full_session_with_clear_resets_message_ids() -> Result<()> {
    let (port, device) = spawn_hislip_device()?;

    let mut rm = ResourceManager::new();
    let vi = rm.open(
        &format!("TCPIP0::127.0.0.1::hislip0,{port}::INSTR"),
        AccessMode::NoLock,
        Duration::from_secs(2),
    )?;

    // Query before the clear.
    rm.write(vi, b"*IDN?")?;
    let mut buf = [0u8; 256];
    let (count, termination) = rm.read(vi, &mut buf)?;
    assert_eq!(&buf[..count], IDN_REPLY);
    assert_eq!(termination, ReadTermination::Complete);

    assert_eq!(rm.read_status_byte(vi)?, u16::from(MOCK_STB));

    rm.write(vi, b"SYST:ERR?")?;
    rm.clear(vi)?;

    // After a device clear the message ID sequence restarts at 2.
    rm.write(vi, b"*RST")?;
    rm.close(vi)?;

    let observed = device.join().expect("device thread should finish");
    let (ids, payloads): (Vec<u32>, Vec<Vec<u8>>) = observed.messages.into_iter().unzip();

    assert_eq!(
        payloads,
        [b"*IDN?".to_vec(), b"SYST:ERR?".to_vec(), b"*RST".to_vec()]
    );
    assert_eq!(ids, [2, 4, 2], "even, increasing, reset to 2 after clear");
    assert!(ids.iter().all(|id| id % 2 == 0));
    assert_eq!(
        observed.clear_acks,
        [0x01],
        "client must echo the device feature flags"
    );
    Ok(())
}

#[test]
fn hislip_read_truncates_to_the_buffer_and_reports_max_count() -> Result<()> {
    let (port, device) = spawn_hislip_device()?;

    let mut rm = ResourceManager::new();
    let vi = rm.open(
        &format!("TCPIP0::127.0.0.1::hislip0,{port}::INSTR"),
        AccessMode::NoLock,
        Duration::from_secs(2),
    )?;

    rm.write(vi, b"*IDN?")?;
    let mut buf = [0u8; 8]; // far smaller than the reply
    let (count, termination) = rm.read(vi, &mut buf)?;
    assert_eq!(count, 8);
    assert_eq!(&buf[..], &IDN_REPLY[..8]);
    assert_eq!(termination, ReadTermination::MaxCount);

    rm.close(vi)?;
    drop(device); // device thread exits on EOF
    Ok(())
}
