use super::*;
use crate::port::PortState;
use crate::protocol::DhcpOffer;
use crate::transport::pipe::PipeTransport;
use crate::transport::recorder::RecordingTransport;
use std::time::Duration;

fn router() -> Arc<Router> {
    Router::new(RouterConfig::default()).unwrap()
}

#[derive(Default)]
struct TestMailbox {
    packets: Mutex<Vec<(Packet, bool)>>,
    deaths: Mutex<Vec<(IfcAddr, IfcAddr)>>,
}

impl Mailbox for TestMailbox {
    fn push_packet(&self, packet: Packet, multicast: bool) -> bool {
        lock(&self.packets).push((packet, multicast));
        true
    }

    fn push_death(&self, receiver: IfcAddr, dead: IfcAddr) {
        lock(&self.deaths).push((receiver, dead));
    }
}

impl TestMailbox {
    fn packet_count(&self) -> usize {
        lock(&self.packets).len()
    }

    fn deaths(&self) -> Vec<(IfcAddr, IfcAddr)> {
        lock(&self.deaths).clone()
    }
}

fn attach(router: &Router) -> (Arc<TestMailbox>, IfcAddr) {
    let mailbox = Arc::new(TestMailbox::default());
    let sink: Arc<dyn Mailbox> = mailbox.clone();
    let addr = router.allocate_ifc_addr(Arc::downgrade(&sink)).unwrap();
    (mailbox, addr)
}

/// Attach a downstream port over a recording transport. The DHCP offer it
/// sent is consumed.
async fn downstream(router: &Arc<Router>) -> (Arc<Port>, RecordingTransport, DownstreamLease) {
    let transport = RecordingTransport::new();
    let port = Port::new(router.clone(), transport.clone());
    port.init_downstream().await.unwrap();
    let lease = port.lease().unwrap();
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), PacketType::DhcpOffer);
    (port, transport, lease)
}

/// Attach an upstream port whose peer offers `net/prefix_len`.
async fn upstream(
    router: &Arc<Router>,
    net: IfcAddr,
    prefix_len: u8,
) -> (Arc<Port>, RecordingTransport) {
    let offer = DhcpOffer::new(prefix_len, net, IfcAddr::new(INTERFACE_BIT | 1));
    let transport = RecordingTransport::greeting(Packet::new(
        PacketType::DhcpOffer,
        IfcAddr::new(INTERFACE_BIT),
        net,
        0,
        offer.encode(),
    ));
    let port = Port::new(router.clone(), transport.clone());
    port.init_upstream("").await.unwrap();
    (port, transport)
}

/// Attach `child` below `parent` over an in-process pipe.
async fn link(parent: &Arc<Router>, child: &Arc<Router>) -> (Arc<Port>, Arc<Port>) {
    let (down, up) = PipeTransport::pair();
    let down_port = Port::new(parent.clone(), down);
    down_port.init_downstream().await.unwrap();
    let up_port = Port::new(child.clone(), up);
    up_port.init_upstream("").await.unwrap();
    (down_port, up_port)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// An interface on the host behind `lease`.
fn remote_addr(lease: &DownstreamLease, interface: u64) -> IfcAddr {
    IfcAddr::compose(IfcAddr::new(lease.address.as_u64() | INTERFACE_BIT), interface)
}

// ===== Interfaces and unicast =====

#[tokio::test]
async fn test_allocate_unique_local_addresses() {
    let r = router();
    let mailbox: Arc<dyn Mailbox> = Arc::new(TestMailbox::default());
    let mut seen = std::collections::HashSet::new();
    seen.insert(r.name_server_address());
    for _ in 0..100 {
        let addr = r.allocate_ifc_addr(Arc::downgrade(&mailbox)).unwrap();
        assert!(addr.is_local());
        assert!(!addr.is_loopback());
        assert!(seen.insert(addr));
    }
    assert_eq!(r.interface_count(), 101);
}

#[tokio::test]
async fn test_unicast_delivery() {
    let r = router();
    let (mailbox, a) = attach(&r);

    let packet = Packet::from_event(false, IfcAddr::new(3), r.global_address(a), 1, b"x".to_vec());
    assert!(r.route_packet(packet, None));
    let (delivered, multicast) = lock(&mailbox.packets)[0].clone();
    assert_eq!(delivered.receiver(), a);
    assert!(!multicast);
    assert_eq!(r.stats().delivered_local, 1);
}

#[tokio::test]
async fn test_unroutable_and_vanished_mailbox() {
    let r = router();
    let far = IfcAddr::new(0x0500_0000_0100_0001);
    assert!(!r.route_packet(Packet::from_event(false, IfcAddr::new(3), far, 1, vec![]), None));
    assert_eq!(r.stats().dropped, 1);

    let (mailbox, a) = attach(&r);
    drop(mailbox);
    assert!(!r.route_packet(Packet::from_event(false, IfcAddr::new(3), a, 1, vec![]), None));
    assert_eq!(r.stats().dropped, 2);
}

#[tokio::test]
async fn test_free_notifies_receivers_once() {
    let r = router();
    let (_a_mb, a) = attach(&r);
    let (b_mb, b) = attach(&r);

    assert!(r.join_group(a, b));
    assert!(r.join_group(a, b));
    r.free_ifc_addr(a);
    assert_eq!(b_mb.deaths(), vec![(b, a)]);

    r.free_ifc_addr(a);
    assert_eq!(b_mb.deaths().len(), 1);
    assert!(!r.join_group(a, b));
}

#[tokio::test]
async fn test_local_multicast_fanout() {
    let r = router();
    let (_p_mb, publisher) = attach(&r);
    let (x_mb, x) = attach(&r);
    let (y_mb, y) = attach(&r);
    assert!(r.join_group(publisher, x));
    assert!(r.join_group(publisher, y));

    let packet = Packet::from_event(true, publisher, publisher, 5, b"m".to_vec());
    assert!(r.route_packet(packet, None));
    assert_eq!(x_mb.packet_count(), 1);
    assert_eq!(y_mb.packet_count(), 1);
    assert!(lock(&x_mb.packets)[0].1);
    assert_eq!(r.stats().multicast_copies, 1);

    r.leave_group(publisher, x);
    let packet = Packet::from_event(true, publisher, publisher, 5, b"m".to_vec());
    r.route_packet(packet, None);
    assert_eq!(x_mb.packet_count(), 1);
    assert_eq!(y_mb.packet_count(), 2);
}

// ===== Downstream subnets =====

#[tokio::test]
async fn test_downstream_leases() {
    let r = router();
    let (_p1, _t1, first) = downstream(&r).await;
    let (_p2, _t2, second) = downstream(&r).await;

    assert_eq!(first.prefix_len, 8);
    assert_eq!(first.address, IfcAddr::new(1 << 56));
    assert_eq!(second.address, IfcAddr::new(2 << 56));
    assert_eq!(first.name_server, r.global_address(r.name_server_address()));
    assert_eq!(r.port_count(), 2);
    assert_eq!(r.subnet_count(), 2);
}

#[tokio::test]
async fn test_set_subnet_prefix_len() {
    let r = router();
    assert!(matches!(
        r.set_subnet_prefix_len(40),
        Err(RouterError::InvalidSubnetPrefix(40))
    ));

    let (port, _t, _lease) = downstream(&r).await;
    assert!(matches!(
        r.set_subnet_prefix_len(4),
        Err(RouterError::SubnetsAllocated)
    ));

    port.finish().await;
    r.set_subnet_prefix_len(4).unwrap();
    let lease = r.allocate_downstream_addr().unwrap();
    assert_eq!(lease.prefix_len, 4);
    assert_eq!(lease.address, IfcAddr::new(1 << 60));
    r.free_downstream_addr(&lease);

    r.set_subnet_prefix_len(0).unwrap();
    assert!(matches!(
        r.allocate_downstream_addr(),
        Err(RouterError::DownstreamDisabled)
    ));
}

#[tokio::test]
async fn test_subnet_space_exhausted() {
    let r = router();
    r.set_subnet_prefix_len(1).unwrap();
    let only = r.allocate_downstream_addr().unwrap();
    assert_eq!(only.address, IfcAddr::new(1 << 63));
    assert!(matches!(
        r.allocate_downstream_addr(),
        Err(RouterError::SubnetSpaceExhausted)
    ));
}

// ===== Upstream =====

#[tokio::test]
async fn test_upstream_adopts_network() {
    let r = router();
    let net = IfcAddr::new(0x0100_0000_0000_0000);
    let (port, transport) = upstream(&r, net, 8).await;

    assert_eq!(port.state(), PortState::UpstreamConnected);
    assert_eq!(r.net_addr(), net);
    assert_eq!(r.prefix_len(), 8);
    assert_eq!(r.own_host(), IfcAddr::new(0x0100_0000_0100_0000));
    assert_eq!(r.upstream_port(), Some(port.id()));

    // Leaving the network goes upstream with a global sender.
    let (_mb, a) = attach(&r);
    let far = IfcAddr::new(INTERFACE_BIT | 7);
    assert!(r.route_packet(Packet::from_event(false, a, far, 3, vec![]), None));
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].sender(), r.global_address(a));
    assert_eq!(sent[0].receiver(), far);

    // Inside our network but not leased: no route.
    let inside = IfcAddr::new(0x0100_0000_0200_0001);
    assert!(!r.route_packet(Packet::from_event(false, a, inside, 3, vec![]), None));

    // Downstream subnets nest below the adopted prefix.
    let lease = r.allocate_downstream_addr().unwrap();
    assert_eq!(lease.prefix_len, 16);
    assert_eq!(lease.address, IfcAddr::new(0x0101_0000_0000_0000));
    r.free_downstream_addr(&lease);

    port.finish().await;
    assert_eq!(r.upstream_port(), None);
    assert_eq!(r.net_addr(), IfcAddr::LOOPBACK);
    assert_eq!(r.prefix_len(), 0);
}

#[tokio::test]
async fn test_upstream_rejections() {
    let r = router();
    let (_up, _t) = upstream(&r, IfcAddr::new(0x0100_0000_0000_0000), 8).await;
    let offer = DhcpOffer::new(8, IfcAddr::new(0x0200_0000_0000_0000), IfcAddr::new(INTERFACE_BIT | 1));
    let second = Port::new(r.clone(), RecordingTransport::new());
    let err = r
        .add_upstream_port(second, UpstreamBinding::from_offer(&offer), "")
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UpstreamExists));

    let with_subnets = router();
    let (_down, _t2, _lease) = downstream(&with_subnets).await;
    let third = Port::new(with_subnets.clone(), RecordingTransport::new());
    let err = with_subnets
        .add_upstream_port(third, UpstreamBinding::from_offer(&offer), "")
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::SubnetsAllocated));
    assert_eq!(with_subnets.upstream_port(), None);
}

// ===== Remote multicast =====

#[tokio::test]
async fn test_stub_lifecycle() {
    let r = router();
    let (_port, transport, lease) = downstream(&r).await;
    let (x_mb, x) = attach(&r);
    let (y_mb, y) = attach(&r);
    let publisher = remote_addr(&lease, 5);

    assert!(r.join_group(publisher, x));
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), PacketType::MulticastJoin);
    assert_eq!(sent[0].receiver(), publisher);
    let stub = sent[0].sender();
    assert!(stub.is_host(r.own_host()));

    assert!(r.join_group(publisher, y));
    assert!(transport.take_sent().is_empty());
    assert_eq!(r.stub_count(), 1);
    assert_eq!(r.group_count(), 1);

    transport.inject(Packet::new(PacketType::Multicast, publisher, stub, 9, b"m".to_vec()));
    assert_eq!(x_mb.packet_count(), 1);
    assert_eq!(y_mb.packet_count(), 1);
    assert_eq!(lock(&x_mb.packets)[0].0.receiver(), x);

    r.leave_group(publisher, x);
    assert!(transport.take_sent().is_empty());
    r.leave_group(publisher, y);
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), PacketType::MulticastLeave);
    assert_eq!(sent[0].sender(), stub);
    assert_eq!(sent[0].receiver(), publisher);
    assert_eq!(r.stub_count(), 0);
    assert_eq!(r.group_count(), 0);

    assert!(r.join_group(publisher, x));
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), PacketType::MulticastJoin);
    assert_ne!(sent[0].sender(), stub);
}

#[tokio::test]
async fn test_remote_death_through_stub() {
    let r = router();
    let (_port, transport, lease) = downstream(&r).await;
    let (x_mb, x) = attach(&r);
    let (_y_mb, y) = attach(&r);
    let publisher = remote_addr(&lease, 5);

    assert!(r.join_group(publisher, x));
    let stub = transport.take_sent()[0].sender();

    transport.inject(Packet::control(PacketType::DeathNotification, publisher, stub));
    assert_eq!(x_mb.deaths(), vec![(x, publisher)]);
    assert_eq!(r.stats().deaths, 1);

    // The dead group is gone without a LEAVE, and its stub is released.
    assert!(transport.take_sent().is_empty());
    assert_eq!(r.stub_count(), 0);
    assert_eq!(r.group_count(), 0);
    r.leave_group(publisher, x);
    assert!(transport.take_sent().is_empty());

    // A later joiner asks the publisher's side afresh through a new stub.
    assert!(r.join_group(publisher, y));
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), PacketType::MulticastJoin);
    assert_eq!(r.stub_count(), 1);
}

#[tokio::test]
async fn test_remote_joiner_of_local_publisher() {
    let r = router();
    let (_port, transport, lease) = downstream(&r).await;
    let (_a_mb, a) = attach(&r);
    let joiner = remote_addr(&lease, 9);

    transport.inject(Packet::control(PacketType::MulticastJoin, joiner, r.global_address(a)));
    assert!(transport.take_sent().is_empty());

    assert!(r.route_packet(Packet::from_event(true, a, a, 5, b"m".to_vec()), None));
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), PacketType::Multicast);
    assert_eq!(sent[0].sender(), r.global_address(a));
    assert_eq!(sent[0].receiver(), joiner);

    r.free_ifc_addr(a);
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), PacketType::DeathNotification);
    assert_eq!(sent[0].sender(), r.global_address(a));
    assert_eq!(sent[0].receiver(), joiner);
}

#[tokio::test]
async fn test_remote_join_of_dead_publisher() {
    let r = router();
    let (_port, transport, lease) = downstream(&r).await;
    let joiner = remote_addr(&lease, 9);
    let nobody = r.global_address(IfcAddr::new(0x00ff_0000));

    transport.inject(Packet::control(PacketType::MulticastJoin, joiner, nobody));
    let sent = transport.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_type(), PacketType::DeathNotification);
    assert_eq!(sent[0].sender(), nobody);
    assert_eq!(sent[0].receiver(), joiner);
}

#[tokio::test]
async fn test_port_detach_kills_remote_publishers() {
    let r = router();
    let (port, transport, lease) = downstream(&r).await;
    let (x_mb, x) = attach(&r);
    let publisher = remote_addr(&lease, 5);
    assert!(r.join_group(publisher, x));
    transport.take_sent();

    port.finish().await;
    assert_eq!(x_mb.deaths(), vec![(x, publisher)]);
    assert_eq!(r.port_count(), 0);
    assert!(!r.join_group(publisher, x));
}

#[tokio::test]
async fn test_multicast_across_three_routers() {
    let root = router();
    let mid = router();
    let leaf = router();
    let (_root_down, _mid_up) = link(&root, &mid).await;
    let (_mid_down, _leaf_up) = link(&mid, &leaf).await;

    let (_p_mb, p) = attach(&leaf);
    let publisher = leaf.global_address(p);
    let (x_mb, x) = attach(&root);

    // Each hop keeps its own stub; the publisher's router holds the group.
    assert!(root.join_group(publisher, x));
    wait_until(|| leaf.group_count() == 1).await;
    assert_eq!(root.stub_count(), 1);
    assert_eq!(mid.stub_count(), 1);
    assert_eq!(leaf.stub_count(), 0);

    assert!(leaf.route_packet(Packet::from_event(true, p, p, 9, b"news".to_vec()), None));
    wait_until(|| x_mb.packet_count() == 1).await;
    let (delivered, multicast) = lock(&x_mb.packets)[0].clone();
    assert!(multicast);
    assert_eq!(delivered.sender(), publisher);
    assert_eq!(delivered.receiver(), x);
    assert_eq!(delivered.payload(), &b"news"[..]);

    // The last receiver leaving unwinds every hop.
    root.leave_group(publisher, x);
    wait_until(|| leaf.group_count() == 0).await;
    assert_eq!(root.stub_count(), 0);
    assert_eq!(mid.stub_count(), 0);
    assert_eq!(mid.group_count(), 0);

    // Death of the publisher travels back hop by hop.
    assert!(root.join_group(publisher, x));
    wait_until(|| leaf.group_count() == 1).await;
    leaf.free_ifc_addr(p);
    wait_until(|| !x_mb.deaths().is_empty()).await;
    assert_eq!(x_mb.deaths(), vec![(x, publisher)]);
    assert_eq!(mid.stub_count(), 0);
    assert_eq!(root.stub_count(), 0);
    assert_eq!(root.group_count(), 0);
    assert_eq!(leaf.group_count(), 0);
}

#[tokio::test]
async fn test_local_router_singleton() {
    let first = local_router().unwrap();
    let second = local_router().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    shutdown_local_router();
    let third = local_router().unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    shutdown_local_router();
}
