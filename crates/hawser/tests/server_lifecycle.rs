use std::sync::Arc;

use hawser::{
    ConnectionHandle, Error, TcpServer,
    assemble::{AssembleCreator, DataReadResult, PacketAssemble},
};

struct Discard;

impl PacketAssemble for Discard {
    fn data_received(&mut self, _connection: &ConnectionHandle, _data: &[u8]) -> DataReadResult {
        DataReadResult::Success
    }
}

fn discard_creator() -> AssembleCreator {
    Arc::new(|| Box::new(Discard))
}

#[test]
fn start_requires_an_assemble_creator() {
    let server = TcpServer::new();
    assert!(matches!(server.start(), Err(Error::AssembleCreatorNotSet)));
}

#[test]
fn start_twice_is_rejected() {
    let server = TcpServer::new()
        .set_listen_ip_v4("127.0.0.1")
        .unwrap()
        .set_assemble_creator(discard_creator());
    server.start().unwrap();
    assert!(matches!(server.start(), Err(Error::AlreadyStarted)));
    server.stop();
}

#[test]
fn invalid_listen_ip_is_rejected() {
    let result = TcpServer::new().set_listen_ip_v4("999.1.2.3");
    assert!(matches!(result, Err(Error::ParseIpAddress)));
    assert!(TcpServer::new().set_listen_ip_v4("not an ip").is_err());
}

#[test]
fn bound_endpoint_is_observable() {
    let server = TcpServer::new()
        .set_listen_ip_v4("127.0.0.1")
        .unwrap()
        .set_listen_port(0)
        .set_assemble_creator(discard_creator());
    assert_eq!(server.get_listen_port(), 0);
    server.start().unwrap();
    assert_ne!(server.get_listen_port(), 0);
    assert_eq!(server.get_listen_address(), "127.0.0.1");
    server.stop();
}

#[test]
fn bind_conflict_passes_the_os_error_through() {
    let first = TcpServer::new()
        .set_listen_ip_v4("127.0.0.1")
        .unwrap()
        .set_assemble_creator(discard_creator());
    first.start().unwrap();

    let second = TcpServer::new()
        .set_listen_ip_v4("127.0.0.1")
        .unwrap()
        .set_listen_port(first.get_listen_port())
        .set_assemble_creator(discard_creator());
    match second.start() {
        Err(Error::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse),
        other => panic!("expected an AddrInUse error, got {other:?}"),
    }

    first.stop();
}
