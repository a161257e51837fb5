/// Interface lifecycle: init, enable_icmp, close, and failure paths.
use alloc::sync::Arc;
use alloc::vec::Vec;

use smoltcp::wire::{EthernetAddress, Ipv4Address, Ipv4Cidr};

use super::*;
use crate::config::StackOptions;
use crate::mock::{FailingRng, FixedRng, MockDevice, TickOps};
use crate::socket::DialOptions;
use crate::stack::NetworkProtocols;

const MAC: &str = "02:00:00:00:00:01";

fn stack() -> Stack {
    Stack::new(StackOptions::default(), TickOps::new(1))
}

fn up(gateway: &str) -> (Interface, Arc<MockDevice>) {
    let mut iface = Interface::new(stack());
    let device = MockDevice::new();
    iface
        .init(device.clone(), "10.0.0.1/24", MAC, gateway, &mut FixedRng::new(1))
        .unwrap();
    (iface, device)
}

// ---- init ----

#[test]
fn init_sets_address_and_routes() {
    let (iface, device) = up("10.0.0.2");

    assert!(iface.is_initialized());
    assert_eq!(iface.nic_id(), 1);
    assert_eq!(iface.mac(), Some(EthernetAddress([2, 0, 0, 0, 0, 1])));
    assert_eq!(
        iface.address(),
        Some(Ipv4Cidr::new(Ipv4Address::new(10, 0, 0, 1), 24))
    );
    assert_eq!(device.attach_count(), 1);

    let routes: Vec<Route> = iface.stack().route_table().iter().copied().collect();
    assert_eq!(
        routes,
        [
            Route::subnet(Ipv4Cidr::new(Ipv4Address::new(10, 0, 0, 0), 24), 1),
            Route::default_via(Ipv4Address::new(10, 0, 0, 2), 1),
        ]
    );
}

#[test]
fn empty_gateway_means_no_default_route() {
    let (iface, _device) = up("");
    let table = iface.stack().route_table();
    assert_eq!(table.len(), 1);
    assert!(!table.as_slice()[0].is_default());
    assert!(iface.stack().find_route(&Ipv4Address::new(8, 8, 8, 8)).is_none());
}

#[test]
fn random_mac_when_empty() {
    let mut iface = Interface::new(stack());
    iface
        .init(MockDevice::new(), "10.0.0.1/24", "", "", &mut FixedRng::new(9))
        .unwrap();

    let mac = iface.mac().unwrap();
    assert_eq!(mac.0[0] & 0x01, 0);
    assert_eq!(mac.0[0] & 0x02, 0x02);
}

#[test]
fn init_again_with_same_device_is_noop() {
    let (mut iface, device) = up("10.0.0.2");
    iface
        .init(device.clone(), "10.0.0.1/24", MAC, "10.0.0.2", &mut FixedRng::new(2))
        .unwrap();

    assert_eq!(device.attach_count(), 1);
    assert_eq!(iface.stack().route_table().len(), 2);
    assert_eq!(iface.stack().nic_count(), 1);
}

#[test]
fn init_with_another_device_fails() {
    let (mut iface, _device) = up("10.0.0.2");
    let other = MockDevice::new();
    let err = iface
        .init(other.clone(), "10.0.0.1/24", MAC, "10.0.0.2", &mut FixedRng::new(2))
        .unwrap_err();

    assert_eq!(
        err,
        NetError::Stack {
            op: "init",
            err: StackError::AlreadyInitialized(1)
        }
    );
    assert_eq!(other.attach_count(), 0);
}

#[test]
fn malformed_config_creates_nothing() {
    let cases = [
        ("10.0.0.1", MAC, "10.0.0.2", "address"),
        ("10.0.0.300/24", MAC, "10.0.0.2", "address"),
        ("10.0.0.1/33", MAC, "10.0.0.2", "address"),
        ("::1/64", MAC, "10.0.0.2", "address"),
        ("10.0.0.1/24", "02:00:00:00:01", "10.0.0.2", "mac"),
        ("10.0.0.1/24", "01:00:5e:00:00:01", "10.0.0.2", "mac"),
        ("10.0.0.1/24", MAC, "gateway", "gateway"),
    ];

    for (addr, mac, gw, field) in cases {
        let mut iface = Interface::new(stack());
        let device = MockDevice::new();
        match iface.init(device.clone(), addr, mac, gw, &mut FixedRng::new(3)) {
            Err(NetError::Config(e)) => assert_eq!(e.field(), field, "{} {} {}", addr, mac, gw),
            other => panic!("{} {} {}: {:?}", addr, mac, gw, other.err()),
        }
        assert!(!iface.is_initialized());
        assert_eq!(iface.stack().nic_count(), 0);
        assert_eq!(device.attach_count(), 0);
    }
}

#[test]
fn entropy_failure_is_config_error() {
    let mut iface = Interface::new(stack());
    let err = iface
        .init(MockDevice::new(), "10.0.0.1/24", MAC, "", &mut FailingRng)
        .unwrap_err();
    assert_eq!(err, NetError::Config(ConfigError::EntropyUnavailable));
    assert_eq!(iface.stack().nic_count(), 0);
}

#[test]
fn failed_init_can_be_retried() {
    let mut iface = Interface::new(stack());
    let device = MockDevice::new();
    assert!(iface
        .init(device.clone(), "bogus", MAC, "", &mut FixedRng::new(4))
        .is_err());
    iface
        .init(device.clone(), "10.0.0.1/24", MAC, "", &mut FixedRng::new(4))
        .unwrap();
    assert!(iface.is_initialized());
}

#[test]
fn missing_arp_fails_create_nic() {
    let mut options = StackOptions::default();
    options.network_protocols = NetworkProtocols::IPV4;
    let mut iface = Interface::new(Stack::new(options, TickOps::new(1)));

    let err = iface
        .init(MockDevice::new(), "10.0.0.1/24", MAC, "", &mut FixedRng::new(5))
        .unwrap_err();
    assert_eq!(
        err,
        NetError::Stack {
            op: "create_nic",
            err: StackError::ProtocolUnavailable("arp")
        }
    );
    assert!(!iface.is_initialized());
}

#[test]
fn shared_stack_rejects_same_nic_id() {
    let stack = stack();
    let mut first = Interface::new(stack.clone());
    first
        .init(MockDevice::new(), "10.0.0.1/24", MAC, "", &mut FixedRng::new(6))
        .unwrap();

    let mut second = Interface::new(stack.clone());
    let err = second
        .init(MockDevice::new(), "10.1.0.1/24", "", "", &mut FixedRng::new(6))
        .unwrap_err();
    assert_eq!(
        err,
        NetError::Stack {
            op: "create_nic",
            err: StackError::DuplicateNic(1)
        }
    );
    // The first interface's NIC survives the failed init.
    assert!(stack.has_nic(1));
    assert_eq!(first.address().map(|a| a.address()), Some(Ipv4Address::new(10, 0, 0, 1)));
}

#[test]
fn two_interfaces_share_a_stack() {
    let stack = stack();
    let mut eth0 = Interface::with_nic_id(stack.clone(), 1);
    let mut eth1 = Interface::with_nic_id(stack.clone(), 2);
    eth0.init(MockDevice::new(), "10.0.0.1/24", "", "10.0.0.254", &mut FixedRng::new(7))
        .unwrap();
    eth1.init(MockDevice::new(), "192.168.1.1/24", "", "", &mut FixedRng::new(8))
        .unwrap();

    assert_eq!(stack.nic_count(), 2);
    let routes: Vec<Route> = stack.route_table().iter().copied().collect();
    assert_eq!(
        routes,
        [
            Route::subnet(Ipv4Cidr::new(Ipv4Address::new(10, 0, 0, 0), 24), 1),
            Route::subnet(Ipv4Cidr::new(Ipv4Address::new(192, 168, 1, 0), 24), 2),
            Route::default_via(Ipv4Address::new(10, 0, 0, 254), 1),
        ]
    );
    assert_eq!(stack.find_route(&Ipv4Address::new(192, 168, 1, 7)).map(|r| r.nic), Some(2));
    assert_eq!(stack.find_route(&Ipv4Address::new(8, 8, 8, 8)).map(|r| r.nic), Some(1));

    eth0.enable_icmp().unwrap();
    eth1.enable_icmp().unwrap();

    eth1.close();
    assert_eq!(stack.route_table().len(), 2);
    assert!(eth0.is_initialized());
}

#[test]
fn dial_on_shared_stack_uses_the_routed_nic() {
    let stack = stack();
    let (dev0, dev1) = (MockDevice::new(), MockDevice::new());
    let mut eth0 = Interface::with_nic_id(stack.clone(), 1);
    let mut eth1 = Interface::with_nic_id(stack.clone(), 2);
    eth0.init(dev0.clone(), "10.0.0.1/24", "", "10.0.0.254", &mut FixedRng::new(7))
        .unwrap();
    eth1.init(dev1.clone(), "192.168.1.1/24", "", "", &mut FixedRng::new(8))
        .unwrap();
    let opts = || DialOptions {
        timeout_ms: Some(50),
        ..DialOptions::default()
    };

    // eth1's own subnet goes out on eth1.
    let err = eth1.socket_factory().dial_with("tcp", "192.168.1.7:80", opts()).err();
    assert_eq!(err, Some(NetError::Endpoint(EndpointError::Timeout)));
    assert!(dev0.sent().is_empty());
    let sent = dev1.take_sent();
    let arp = &sent[0];
    assert_eq!(&arp[12..14], &[0x08, 0x06]);
    assert_eq!(&arp[38..42], &[192, 168, 1, 7]);

    // eth1 has no gateway: 8.8.8.8 leaves through eth0's default route,
    // and the dial itself transmits the frames queued on eth0.
    let connecting = eth1.socket_factory().begin_dial("tcp", "8.8.8.8:80", opts());
    assert_eq!(connecting.map(|c| c.nic()).ok(), Some(1));
    let err = eth1.socket_factory().dial_with("tcp", "8.8.8.8:80", opts()).err();
    assert_eq!(err, Some(NetError::Endpoint(EndpointError::Timeout)));
    assert!(dev1.sent().iter().all(|f| f[12..14] == [0x08, 0x06] && f[38..42] == [192, 168, 1, 7]));
    let sent = dev0.sent();
    assert!(!sent.is_empty());
    assert_eq!(&sent[0][12..14], &[0x08, 0x06]);
    assert_eq!(&sent[0][38..42], &[10, 0, 0, 254]);
}

// ---- ICMP ----

#[test]
fn enable_icmp_needs_address() {
    let mut iface = Interface::new(stack());
    assert_eq!(
        iface.enable_icmp(),
        Err(NetError::Endpoint(EndpointError::AddressNotAvailable))
    );
    assert!(!iface.icmp_enabled());
}

#[test]
fn enable_icmp_is_idempotent() {
    let (mut iface, _device) = up("10.0.0.2");
    iface.enable_icmp().unwrap();
    iface.enable_icmp().unwrap();
    assert!(iface.icmp_enabled());
    assert_eq!(iface.stack().endpoint_count(1), 1);
}

// ---- close ----

#[test]
fn close_is_idempotent() {
    let (mut iface, device) = up("10.0.0.2");
    iface.enable_icmp().unwrap();

    iface.close();
    assert!(!iface.is_initialized());
    assert!(!iface.icmp_enabled());
    assert!(!iface.stack().has_nic(1));
    assert!(iface.stack().route_table().is_empty());
    assert!(!device.is_attached());
    assert_eq!(iface.pump_outbound(), 0);

    iface.close();
    assert!(!iface.is_initialized());
}

#[test]
fn close_cancels_pending_dial() {
    let (mut iface, _device) = up("10.0.0.2");
    let provider = iface.socket_factory();
    let mut connecting = provider
        .begin_dial("tcp", "10.0.0.5:80", DialOptions::default())
        .unwrap();
    assert!(connecting.poll().unwrap().is_none());

    iface.close();
    assert_eq!(connecting.poll().err(), Some(EndpointError::Closed));
    assert_eq!(
        provider.dial("tcp", "10.0.0.5:80").err(),
        Some(NetError::Endpoint(EndpointError::Closed))
    );
}

#[test]
fn reinit_after_close() {
    let (mut iface, device) = up("10.0.0.2");
    iface.close();
    iface
        .init(device.clone(), "10.0.0.9/24", MAC, "", &mut FixedRng::new(1))
        .unwrap();

    assert!(device.is_attached());
    assert_eq!(device.attach_count(), 2);
    assert_eq!(iface.address().map(|a| a.address()), Some(Ipv4Address::new(10, 0, 0, 9)));
    assert!(!iface.socket_factory().is_closed());
}

// ---- dial ----

#[test]
fn dial_unresolved_host_times_out() {
    let (iface, device) = up("10.0.0.2");
    let provider = iface.socket_factory();
    let opts = DialOptions {
        timeout_ms: Some(50),
        ..DialOptions::default()
    };

    let err = provider.dial_with("tcp", "10.0.0.5:80", opts).err();
    assert_eq!(err, Some(NetError::Endpoint(EndpointError::Timeout)));

    // Nobody answered the ARP request the dial sent.
    let sent = device.sent();
    assert!(!sent.is_empty());
    let first = &sent[0];
    assert_eq!(&first[0..6], &[0xff; 6]);
    assert_eq!(&first[12..14], &[0x08, 0x06]);

    // The half-open endpoint is gone once the stack runs.
    iface.poll();
    assert_eq!(iface.stack().endpoint_count(1), 0);
}

#[test]
fn create_socket_uses_configured_connect_timeout() {
    let mut options = StackOptions::default();
    options.connect_timeout_ms = 40;
    let ops = TickOps::new(1);
    let mut iface = Interface::new(Stack::new(options, ops.clone()));
    let device = MockDevice::new();
    iface
        .init(device.clone(), "10.0.0.1/24", MAC, "10.0.0.2", &mut FixedRng::new(1))
        .unwrap();

    let start = ops.peek();
    let err = iface.create_socket("tcp", "10.0.0.5:80").err();
    assert_eq!(err, Some(NetError::Endpoint(EndpointError::Timeout)));
    assert!(ops.peek() - start >= 40);
    assert!(!device.sent().is_empty());
}

#[test]
fn dial_without_route() {
    let (iface, device) = up("");
    let err = iface.create_socket("tcp", "8.8.8.8:80").err();
    assert_eq!(err, Some(NetError::Endpoint(EndpointError::NoRoute)));
    assert!(device.sent().is_empty());
}

#[test]
fn dial_cancel_token() {
    let (iface, _device) = up("10.0.0.2");
    let cancel = CancelToken::new();
    let mut connecting = iface
        .socket_factory()
        .begin_dial(
            "tcp",
            "10.0.0.5:80",
            DialOptions {
                cancel: Some(cancel.clone()),
                ..DialOptions::default()
            },
        )
        .unwrap();

    cancel.cancel();
    assert_eq!(connecting.poll().err(), Some(EndpointError::Canceled));
    iface.poll();
    assert_eq!(iface.stack().endpoint_count(1), 0);
}
