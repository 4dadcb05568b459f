use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use bytemuck::{Pod, Zeroable, bytes_of};
use hawser::{
    ConnectionHandle, Error, TcpClient, TcpClientNotify, TcpServer,
    assemble::{
        BodyLengthCalcMode, DataReadResult, FrameHeader, HeaderBodyAssemble,
        HeaderBodyAssembleNotify,
    },
    byte_order,
};

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct MessageHeader {
    magic: u32,
    len: u32,
}

impl FrameHeader for MessageHeader {
    type Length = u32;
    const LENGTH_OFFSET: usize = core::mem::offset_of!(MessageHeader, len);
}

const MAGIC: u32 = 0xffac;

fn frame(body: &[u8]) -> Vec<u8> {
    let header = MessageHeader {
        magic: byte_order::to_network_u32(MAGIC),
        len: byte_order::to_network_u32(body.len() as u32),
    };
    let mut out = bytes_of(&header).to_vec();
    out.extend_from_slice(body);
    out
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Server-side parser notify: echoes every received body back on the same
/// connection.
struct EchoBack;

impl HeaderBodyAssembleNotify<MessageHeader> for EchoBack {
    fn packet_reserved(
        &mut self,
        connection: &ConnectionHandle,
        _header: &MessageHeader,
        body: &[u8],
    ) -> DataReadResult {
        connection.send(frame(body), |_| {});
        DataReadResult::Success
    }
}

/// Client-side parser notify: collects received bodies.
struct Collect(Arc<Mutex<Vec<Vec<u8>>>>);

impl HeaderBodyAssembleNotify<MessageHeader> for Collect {
    fn packet_reserved(
        &mut self,
        _connection: &ConnectionHandle,
        header: &MessageHeader,
        body: &[u8],
    ) -> DataReadResult {
        assert_eq!(byte_order::to_host_u32(header.magic), MAGIC);
        self.0.lock().unwrap().push(body.to_vec());
        DataReadResult::Success
    }
}

#[derive(Default)]
struct UpDown {
    up: Mutex<u32>,
    down: Mutex<u32>,
}

impl TcpClientNotify for UpDown {
    fn connection_connected(&self, _remote_addr: &str, _remote_port: u16) {
        *self.up.lock().unwrap() += 1;
    }

    fn connection_disconnected(&self, _remote_addr: &str, _remote_port: u16, _error: &Error) {
        *self.down.lock().unwrap() += 1;
    }
}

#[test]
fn framed_echo_roundtrip() {
    let server = TcpServer::new()
        .set_listen_ip_v4("127.0.0.1")
        .unwrap()
        .set_listen_port(0)
        .set_transfer_thread_count(2)
        .set_assemble_creator(Arc::new(|| {
            Box::new(HeaderBodyAssemble::<MessageHeader>::new(
                BodyLengthCalcMode::BodyOnly,
                Box::new(EchoBack),
            ))
        }));
    server.start().unwrap();
    let port = server.get_listen_port();
    assert_ne!(port, 0);
    assert_eq!(server.get_listen_address(), "127.0.0.1");

    let received = Arc::new(Mutex::new(Vec::new()));
    let parser_log = received.clone();
    let events = Arc::new(UpDown::default());
    let client = TcpClient::new()
        .set_transfer_thread_count(2)
        .set_assemble_creator(Arc::new(move || {
            Box::new(HeaderBodyAssemble::<MessageHeader>::new(
                BodyLengthCalcMode::BodyOnly,
                Box::new(Collect(parser_log.clone())),
            ))
        }))
        .set_notify(events.clone());

    client.connect("127.0.0.1", port);
    assert!(wait_for(Duration::from_secs(5), || *events.up.lock().unwrap() == 1));

    let completed = Arc::new(Mutex::new(Vec::new()));
    let completion_log = completed.clone();
    client.send("127.0.0.1", port, frame(b"hello"), move |result| {
        completion_log.lock().unwrap().push(result);
    });

    assert!(wait_for(Duration::from_secs(5), || received.lock().unwrap().len() == 1));
    assert_eq!(received.lock().unwrap()[0], b"hello");
    assert!(matches!(completed.lock().unwrap().as_slice(), [Ok(())]));

    // Several frames in a row arrive in order, whatever the coalescing.
    for i in 0..20_u8 {
        client.send("127.0.0.1", port, frame(&[i; 3]), |_| {});
    }
    assert!(wait_for(Duration::from_secs(5), || received.lock().unwrap().len() == 21));
    {
        let received = received.lock().unwrap();
        for i in 0..20_u8 {
            assert_eq!(received[i as usize + 1], [i; 3]);
        }
    }

    client.stop();
    server.stop();
}

#[test]
fn broadcast_reaches_every_target() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let make_server = || {
        let log = received.clone();
        let server = TcpServer::new()
            .set_listen_ip_v4("127.0.0.1")
            .unwrap()
            .set_assemble_creator(Arc::new(move || {
                Box::new(HeaderBodyAssemble::<MessageHeader>::new(
                    BodyLengthCalcMode::BodyOnly,
                    Box::new(Collect(log.clone())),
                ))
            }));
        server.start().unwrap();
        server
    };
    let server_a = make_server();
    let server_b = make_server();

    let events = Arc::new(UpDown::default());
    let client = TcpClient::new()
        .set_assemble_creator(Arc::new(|| {
            Box::new(HeaderBodyAssemble::<MessageHeader>::new(
                BodyLengthCalcMode::BodyOnly,
                Box::new(Collect(Arc::new(Mutex::new(Vec::new())))),
            ))
        }))
        .set_notify(events.clone());
    client.connect("127.0.0.1", server_a.get_listen_port());
    client.connect("127.0.0.1", server_b.get_listen_port());
    assert!(wait_for(Duration::from_secs(5), || *events.up.lock().unwrap() == 2));

    let completions = Arc::new(Mutex::new(0_u32));
    let completion_log = completions.clone();
    client.broadcast(frame(b"fanout"), move |result| {
        assert!(result.is_ok());
        *completion_log.lock().unwrap() += 1;
    });

    assert!(wait_for(Duration::from_secs(5), || received.lock().unwrap().len() == 2));
    assert!(wait_for(Duration::from_secs(5), || *completions.lock().unwrap() == 2));
    assert!(received.lock().unwrap().iter().all(|body| body == b"fanout"));

    client.stop();
    server_a.stop();
    server_b.stop();
}
