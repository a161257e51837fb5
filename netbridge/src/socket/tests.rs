/// Socket layer: address parsing, and TCP/UDP/ICMP traffic between two
/// interfaces joined by a wire pair.
///
/// The two interfaces run on one thread, so traffic is driven with
/// `drive` and the non-blocking calls (`begin_dial`, `try_accept`,
/// `try_recv`).
use alloc::vec;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, Ipv4Address};

use super::*;
use crate::config::StackOptions;
use crate::interface::Interface;
use crate::mock::{FixedRng, TickOps, WireDevice};
use crate::stack::TransportProtocol;

fn pair() -> (Interface, Interface) {
    let (wire_a, wire_b) = WireDevice::pair();
    let mut a = Interface::new(Stack::new(StackOptions::default(), TickOps::new(1)));
    let mut b = Interface::new(Stack::new(StackOptions::default(), TickOps::new(1)));
    a.init(wire_a, "10.0.0.1/24", "02:00:00:00:00:0a", "", &mut FixedRng::new(1))
        .unwrap();
    b.init(wire_b, "10.0.0.2/24", "02:00:00:00:00:0b", "", &mut FixedRng::new(2))
        .unwrap();
    (a, b)
}

fn drive(a: &Interface, b: &Interface) {
    a.poll();
    a.pump_outbound();
    b.poll();
    b.pump_outbound();
}

fn connect(a: &Interface, b: &Interface, listener: &mut Listener, addr: &str) -> (Socket, Socket) {
    let mut connecting = a
        .socket_factory()
        .begin_dial("tcp", addr, DialOptions::default())
        .unwrap();
    let mut client = None;
    let mut server = None;
    for _ in 0..200 {
        drive(a, b);
        if client.is_none() {
            client = connecting.poll().unwrap();
        }
        if server.is_none() {
            server = listener.try_accept().unwrap();
        }
        if let (Some(_), Some(_)) = (&client, &server) {
            break;
        }
    }
    (client.expect("client connected"), server.expect("server accepted"))
}

fn recv_some(a: &Interface, b: &Interface, socket: &mut Socket, buf: &mut [u8]) -> usize {
    for _ in 0..200 {
        drive(a, b);
        if let Some(n) = socket.try_recv(buf).unwrap() {
            return n;
        }
    }
    panic!("nothing received");
}

// ---- parsing ----

#[test]
fn network_names() {
    assert_eq!(Network::parse("tcp"), Ok(Network::Tcp));
    assert_eq!(Network::parse("tcp4"), Ok(Network::Tcp));
    assert_eq!(Network::parse("udp4"), Ok(Network::Udp));
    assert_eq!(Network::parse("ip4:icmp"), Ok(Network::Icmp));
    assert_eq!(Network::parse("ip4:1"), Ok(Network::Icmp));
    assert_eq!(Network::parse("tcp6"), Err(EndpointError::UnsupportedNetwork));
    assert_eq!(Network::parse("unix"), Err(EndpointError::UnsupportedNetwork));
    assert_eq!(Network::Icmp.transport(), TransportProtocol::Icmpv4);
}

#[test]
fn address_forms() {
    assert_eq!(
        FullAddress::parse("10.0.0.2:80"),
        Ok(FullAddress::new(Ipv4Address::new(10, 0, 0, 2), 80))
    );
    assert_eq!(
        FullAddress::parse("10.0.0.2"),
        Ok(FullAddress::new(Ipv4Address::new(10, 0, 0, 2), 0))
    );
    assert_eq!(FullAddress::parse(":8080"), Ok(FullAddress::any(8080)));
    assert_eq!(FullAddress::parse(""), Ok(FullAddress::any(0)));
}

#[test]
fn bad_addresses() {
    assert_eq!(FullAddress::parse("example.com:80"), Err(EndpointError::InvalidAddress));
    assert_eq!(FullAddress::parse("10.0.0.256:80"), Err(EndpointError::InvalidAddress));
    assert_eq!(FullAddress::parse("10.0.0.2:http"), Err(EndpointError::InvalidPort));
    assert_eq!(FullAddress::parse("10.0.0.2:65536"), Err(EndpointError::InvalidPort));
    assert_eq!(FullAddress::parse("10.0.0.2:-1"), Err(EndpointError::InvalidPort));
}

#[test]
fn bad_requests_create_no_endpoint() {
    let (a, _b) = pair();
    let provider = a.socket_factory();

    let cases = [
        ("tcp6", "10.0.0.2:80", EndpointError::UnsupportedNetwork),
        ("tcp", "nowhere:80", EndpointError::InvalidAddress),
        ("tcp", "10.0.0.2:x", EndpointError::InvalidPort),
        ("tcp", "10.0.0.2", EndpointError::InvalidPort),
        ("tcp", ":80", EndpointError::Unaddressable),
    ];
    for (network, address, expected) in cases {
        assert_eq!(
            provider.dial(network, address).err(),
            Some(NetError::Endpoint(expected)),
            "{} {}",
            network,
            address
        );
    }
    assert_eq!(
        provider.listen("udp", ":80").err(),
        Some(NetError::Endpoint(EndpointError::UnsupportedProtocol))
    );
    assert_eq!(
        provider.bind("tcp", ":80").err(),
        Some(NetError::Endpoint(EndpointError::UnsupportedProtocol))
    );

    a.poll();
    assert_eq!(a.stack().endpoint_count(1), 0);
}

#[test]
fn cancel_token_is_shared() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(!clone.is_canceled());
    token.cancel();
    assert!(clone.is_canceled());
}

// ---- TCP ----

#[test]
fn tcp_echo_between_interfaces() {
    let (a, b) = pair();
    let mut listener = b.socket_factory().listen("tcp", ":7").unwrap();
    assert_eq!(listener.local_addr().map(|l| l.port), Some(7));

    let (mut client, mut server) = connect(&a, &b, &mut listener, "10.0.0.2:7");
    assert_eq!(
        client.remote_addr(),
        Some(FullAddress::new(Ipv4Address::new(10, 0, 0, 2), 7))
    );
    assert_eq!(
        server.remote_addr().map(|r| r.addr),
        Some(Ipv4Address::new(10, 0, 0, 1))
    );
    assert_eq!(server.local_addr().map(|l| l.port), Some(7));

    assert_eq!(client.try_send(b"hello").unwrap(), 5);
    let mut buf = [0u8; 64];
    let n = recv_some(&a, &b, &mut server, &mut buf);
    assert_eq!(&buf[..n], b"hello");

    server.try_send(&buf[..n]).unwrap();
    let mut reply = [0u8; 64];
    let n = recv_some(&a, &b, &mut client, &mut reply);
    assert_eq!(&reply[..n], b"hello");

    // Orderly close: the server reads end of stream.
    client.close();
    assert_eq!(recv_some(&a, &b, &mut server, &mut buf), 0);
}

#[test]
fn listener_keeps_listening_after_accept() {
    let (a, b) = pair();
    let mut listener = b.socket_factory().listen("tcp", ":9000").unwrap();

    let (_c1, mut s1) = connect(&a, &b, &mut listener, "10.0.0.2:9000");
    let (mut c2, _s2) = connect(&a, &b, &mut listener, "10.0.0.2:9000");
    assert_ne!(
        s1.remote_addr().map(|r| r.port),
        c2.local_addr().map(|l| l.port)
    );

    c2.try_send(b"two").unwrap();
    let mut buf = [0u8; 8];
    for _ in 0..20 {
        drive(&a, &b);
    }
    assert_eq!(s1.try_recv(&mut buf).unwrap(), None);
}

#[test]
fn connection_refused_without_listener() {
    let (a, b) = pair();
    let mut connecting = a
        .socket_factory()
        .begin_dial("tcp", "10.0.0.2:81", DialOptions::default())
        .unwrap();

    let mut result = Ok(None);
    for _ in 0..200 {
        drive(&a, &b);
        result = connecting.poll();
        if !matches!(result, Ok(None)) {
            break;
        }
    }
    assert_eq!(result.err(), Some(EndpointError::ConnectionRefused));
}

#[test]
fn listener_port_is_exclusive() {
    let (_a, b) = pair();
    let provider = b.socket_factory();
    let _listener = provider.listen("tcp", ":7").unwrap();
    assert_eq!(
        provider.listen("tcp", ":7").err(),
        Some(NetError::Endpoint(EndpointError::AddressInUse))
    );
}

#[test]
fn accept_canceled() {
    let (_a, b) = pair();
    let mut listener = b.socket_factory().listen("tcp", ":7").unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    assert_eq!(
        listener.accept_with(Some(&cancel)).err(),
        Some(EndpointError::Canceled)
    );
}

#[test]
fn accept_after_close() {
    let (_a, mut b) = pair();
    let mut listener = b.socket_factory().listen("tcp", ":7").unwrap();
    b.close();
    assert_eq!(listener.accept().err(), Some(EndpointError::Closed));
}

#[test]
fn blocking_read_times_out() {
    let (a, b) = pair();
    let mut listener = b.socket_factory().listen("tcp", ":7").unwrap();
    let (mut client, _server) = connect(&a, &b, &mut listener, "10.0.0.2:7");

    client.set_timeout(Some(20));
    let mut buf = [0u8; 4];
    assert_eq!(
        embedded_io::Read::read(&mut client, &mut buf),
        Err(EndpointError::Timeout)
    );
    assert_eq!(embedded_io::Read::read(&mut client, &mut []), Ok(0));
}

// ---- UDP ----

#[test]
fn udp_datagrams_between_bound_sockets() {
    let (a, b) = pair();
    let mut sa = a.socket_factory().bind("udp", ":5000").unwrap();
    let mut sb = b.socket_factory().bind("udp4", "10.0.0.2:6000").unwrap();

    let to_b = FullAddress::parse("10.0.0.2:6000").unwrap();
    assert_eq!(sa.try_send_to(b"ping", to_b).unwrap(), 4);

    let mut buf = [0u8; 32];
    let mut got = None;
    for _ in 0..200 {
        drive(&a, &b);
        got = sb.try_recv_from(&mut buf).unwrap();
        if got.is_some() {
            break;
        }
    }
    let (n, from) = got.expect("datagram");
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, FullAddress::new(Ipv4Address::new(10, 0, 0, 1), 5000));

    sb.try_send_to(b"pong", from).unwrap();
    let mut got = None;
    for _ in 0..200 {
        drive(&a, &b);
        got = sa.try_recv_from(&mut buf).unwrap();
        if got.is_some() {
            break;
        }
    }
    assert_eq!(got.map(|(n, _)| n), Some(4));
    assert_eq!(&buf[..4], b"pong");
}

#[test]
fn udp_dial_filters_other_senders() {
    let (a, b) = pair();
    let mut dialed = a
        .socket_factory()
        .begin_dial("udp", "10.0.0.2:6000", DialOptions::default())
        .unwrap()
        .poll()
        .unwrap()
        .expect("udp connects at once");
    let port = dialed.local_addr().unwrap().port;

    let mut peer = b.socket_factory().bind("udp", ":6000").unwrap();
    let mut stranger = b.socket_factory().bind("udp", ":6001").unwrap();
    let to_a = FullAddress::new(Ipv4Address::new(10, 0, 0, 1), port);
    stranger.try_send_to(b"spam", to_a).unwrap();
    peer.try_send_to(b"data", to_a).unwrap();

    let mut buf = [0u8; 16];
    let n = recv_some(&a, &b, &mut dialed, &mut buf);
    assert_eq!(&buf[..n], b"data");
}

// ---- ICMP ----

#[test]
fn ping_is_answered() {
    let (mut a, b) = pair();
    a.enable_icmp().unwrap();

    let mut socket = a.socket_factory().bind("icmp", "").unwrap();
    let ident = socket.local_addr().unwrap().port;

    let request = Icmpv4Repr::EchoRequest {
        ident,
        seq_no: 1,
        data: b"abcd",
    };
    let mut packet = vec![0u8; request.buffer_len()];
    request.emit(
        &mut Icmpv4Packet::new_unchecked(&mut packet[..]),
        &ChecksumCapabilities::default(),
    );
    let to_b = FullAddress::new(Ipv4Address::new(10, 0, 0, 2), 0);
    assert_eq!(socket.try_send_to(&packet, to_b).unwrap(), packet.len());

    let mut buf = [0u8; 64];
    let mut got = None;
    for _ in 0..200 {
        drive(&a, &b);
        got = socket.try_recv_from(&mut buf).unwrap();
        if got.is_some() {
            break;
        }
    }
    let (n, from) = got.expect("echo reply");
    assert_eq!(from.addr, Ipv4Address::new(10, 0, 0, 2));

    let reply = Icmpv4Packet::new_checked(&buf[..n]).unwrap();
    match Icmpv4Repr::parse(&reply, &ChecksumCapabilities::default()).unwrap() {
        Icmpv4Repr::EchoReply {
            ident: id,
            seq_no,
            data,
        } => {
            assert_eq!(id, ident);
            assert_eq!(seq_no, 1);
            assert_eq!(data, b"abcd");
        }
        other => panic!("unexpected {:?}", other),
    }
}
