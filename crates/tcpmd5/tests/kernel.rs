use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tcpmd5::{
    ErrorKind, HandleRegistry, KeyAccessFactory, KeyAccessor, KeyMapping, Tcpmd5Config,
    TCP_MD5SIG_MAXKEYLEN,
};

fn connected_pair() -> (TcpListener, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let stream = TcpStream::connect(listener.local_addr().unwrap()).expect("connect stream");
    (listener, stream)
}

#[test]
fn oversized_key_is_rejected_on_real_socket() {
    let accessor = KeyAccessor::kernel();
    let (_listener, stream) = connected_pair();

    let err = accessor
        .set(&stream, &vec![7u8; TCP_MD5SIG_MAXKEYLEN + 1])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn unknown_handle_is_illegal_state_not_io() {
    let accessor = KeyAccessor::kernel();
    let fd = connected_pair().1.as_raw_fd();

    // A bare descriptor number is not a registered handle shape.
    let err = accessor.get(&fd).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[test]
fn socket2_handles_resolve() {
    let registry = HandleRegistry::global();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    assert_eq!(registry.resolve(&socket).unwrap().name(), "socket2::Socket");
    assert_eq!(registry.descriptor(&socket).unwrap(), socket.as_raw_fd());
}

#[tokio::test]
async fn tokio_handles_resolve() {
    let registry = HandleRegistry::global();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stream = tokio::net::TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();

    assert_eq!(
        registry.resolve(&listener).unwrap().name(),
        "tokio::net::TcpListener"
    );
    assert_eq!(
        registry.resolve(&stream).unwrap().name(),
        "tokio::net::TcpStream"
    );
}

#[tokio::test]
async fn blocking_calls_run_off_the_runtime() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let std_listener = listener.into_std().unwrap();

    let outcome = tokio::task::spawn_blocking(move || {
        let accessor = KeyAccessor::kernel();
        accessor.set(&std_listener, b"async-caller").map(|_| ())
    })
    .await
    .unwrap();

    if let Err(err) = outcome {
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}

#[test]
fn kernel_outcome_matches_probe() {
    let factory = KeyAccessFactory::init_global(&Tcpmd5Config::default());
    let capability = factory.capability();
    if !capability.supported {
        assert!(capability.failed_step.is_some());
        assert!(!capability.reason.is_empty());
    }

    let (listener, _stream) = connected_pair();
    let access = factory.key_access(&listener).unwrap();

    match access.set_key(b"integration") {
        Ok(()) => {
            access.clear_key().unwrap();
            if capability.supported {
                // The key is gone, so a second removal finds nothing.
                let err = access.clear_key().unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Io);
                assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
            }
        }
        // Unsupported kernels surface an I/O failure, never another kind.
        Err(err) => assert_eq!(err.kind(), ErrorKind::Io),
    }
}

#[test]
fn mapping_applies_or_fails_with_io() {
    let accessor = KeyAccessor::kernel();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();

    let mut mapping = KeyMapping::new();
    mapping
        .insert_password("127.0.0.2".parse().unwrap(), "peer-two")
        .unwrap();

    match accessor.apply_mapping(&listener, &mapping) {
        Ok(applied) => {
            assert_eq!(applied, 1);
            accessor
                .clear_for_peer(&listener, "127.0.0.2:0".parse().unwrap())
                .unwrap();
        }
        Err(err) => assert_eq!(err.kind(), ErrorKind::Io),
    }
}

#[test]
fn keyed_handshake_between_mapped_listener_and_keyed_client() {
    let accessor = KeyAccessor::kernel();
    let mut mapping = KeyMapping::new();
    mapping
        .insert_password("127.0.0.1".parse().unwrap(), "handshake-key")
        .unwrap();

    let listener = match accessor.bind_with_mapping("127.0.0.1:0".parse().unwrap(), &mapping) {
        Ok(listener) => listener,
        Err(err) => {
            assert_eq!(err.kind(), ErrorKind::Io);
            return;
        }
    };
    let addr = listener.local_addr().unwrap();

    // Both ends carry the key from the first SYN, so the handshake completes.
    let stream = accessor.connect_with_key(addr, b"handshake-key").unwrap();
    let (_accepted, peer) = listener.accept().unwrap();
    assert_eq!(peer, stream.local_addr().unwrap());
}
