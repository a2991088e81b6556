use super::*;
use crate::config::RouterConfig;
use crate::port::{Port, PortState};
use crate::queue::{RawCodec, RawMessage};
use crate::transport::pipe::PipeTransport;

fn router() -> Arc<Router> {
    Router::new(RouterConfig::default()).unwrap()
}

/// Attach `child` below `parent` over an in-process pipe.
async fn link(parent: &Arc<Router>, child: &Arc<Router>, domain: &str) -> (Arc<Port>, Arc<Port>) {
    let (down, up) = PipeTransport::pair();
    let down_port = Port::new(parent.clone(), down);
    down_port.init_downstream().await.unwrap();
    let up_port = Port::new(child.clone(), up);
    up_port.init_upstream(domain).await.unwrap();
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

fn table(role: NameServerRole, domain: &str, entries: &[(&str, u64, bool)]) -> NameTable {
    NameTable {
        entries: entries
            .iter()
            .map(|(name, addr, is_ns)| {
                (
                    name.to_string(),
                    NameEntry {
                        address: IfcAddr::new(*addr),
                        is_name_server: *is_ns,
                    },
                )
            })
            .collect(),
        role,
        segments: split_path(domain).into_iter().map(String::from).collect(),
    }
}

// ===== Resolution =====

#[test]
fn test_resolve_local_plain_names() {
    let t = table(NameServerRole::Local, "", &[("foo", 5, false), ("sub", 9, true)]);
    assert_eq!(
        t.resolve("foo"),
        Resolution::Found(NameEntry {
            address: IfcAddr::new(5),
            is_name_server: false
        })
    );
    assert_eq!(t.resolve("bar"), Resolution::NotFound);
    // Name server entries are not returned for plain names.
    assert_eq!(t.resolve("sub"), Resolution::NotFound);
}

#[test]
fn test_resolve_root_hierarchy() {
    let t = table(NameServerRole::Local, "", &[("foo", 5, false), ("left", 9, true)]);
    assert!(matches!(t.resolve("/foo"), Resolution::Found(_)));
    assert_eq!(t.resolve("/left/bar"), Resolution::Redirect(IfcAddr::new(9)));
    assert_eq!(t.resolve("/left"), Resolution::NotFound);
    assert_eq!(t.resolve("/foo/bar"), Resolution::NotFound);
}

#[test]
fn test_resolve_authoritative() {
    let upstream = IfcAddr::new(0x77);
    let t = table(
        NameServerRole::Authoritative {
            upstream,
            domain: "/left".into(),
        },
        "/left",
        &[("bar", 5, false), ("deep", 9, true)],
    );
    assert!(matches!(t.resolve("/left/bar"), Resolution::Found(_)));
    assert!(matches!(t.resolve("bar"), Resolution::Found(_)));
    assert_eq!(t.resolve("/left/deep/x"), Resolution::Redirect(IfcAddr::new(9)));
    assert_eq!(t.resolve("/right/bar"), Resolution::Redirect(upstream));
    assert_eq!(t.resolve("/left"), Resolution::Redirect(upstream));
    assert_eq!(t.resolve("/left/missing"), Resolution::NotFound);
}

#[test]
fn test_resolve_stub_redirects_everything() {
    let upstream = IfcAddr::new(0x77);
    let t = table(
        NameServerRole::StubResolver { upstream },
        "",
        &[("foo", 5, false)],
    );
    assert_eq!(t.resolve("foo"), Resolution::Redirect(upstream));
    assert_eq!(t.resolve("/x/y"), Resolution::Redirect(upstream));
}

// ===== Role transitions =====

#[tokio::test]
async fn test_role_transitions() {
    let r = router();
    let ns = r.name_server().unwrap();
    assert_eq!(ns.role(), NameServerRole::Local);

    let upstream = IfcAddr::new(0x0100_0000_0100_0001);
    ns.make_stub_resolver(upstream).unwrap();
    assert!(matches!(
        ns.make_stub_resolver(upstream),
        Err(NameServerError::AlreadyConfigured)
    ));
    ns.make_local();
    assert_eq!(ns.role(), NameServerRole::Local);
    assert_eq!(ns.domain(), "");
}

#[tokio::test]
async fn test_port_vanished_purges_remote_names() {
    let r = router();
    let ns = r.name_server().unwrap();
    {
        let mut t = lock(&ns.table);
        for (name, addr) in [
            ("local", 0x0000_0000_0000_0004),
            ("gone", 0x0100_0000_0100_0004),
            ("other", 0x0200_0000_0100_0004),
        ] {
            t.entries.insert(
                name.into(),
                NameEntry {
                    address: IfcAddr::new(addr),
                    is_name_server: false,
                },
            );
        }
    }
    ns.port_vanished(IfcAddr::new(0x0100_0000_0000_0000), 8);
    assert!(ns.local_entry("local").is_some());
    assert!(ns.local_entry("gone").is_none());
    assert!(ns.local_entry("other").is_some());
}

// ===== Registration =====

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let r = router();
    let queue: Queue<RawMessage> = Queue::new(&r);
    let _first = queue.register_named_interface(RawCodec, "dup").await.unwrap();
    let count = r.interface_count();

    let err = queue
        .register_named_interface(RawCodec, "dup")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::AddressInUse(ref name) if name == "dup"));
    assert_eq!(r.interface_count(), count);
}

#[tokio::test]
async fn test_drop_deregisters_name() {
    let r = router();
    let ns = r.name_server().unwrap();
    let queue: Queue<RawMessage> = Queue::new(&r);
    let named = queue.register_named_interface(RawCodec, "temp").await.unwrap();
    assert_eq!(ns.local_entry("temp").map(|e| e.address), Some(named.address()));

    drop(named);
    wait_until(|| ns.local_entry("temp").is_none()).await;

    let again = queue.register_named_interface(RawCodec, "temp").await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn test_lookup_waits_for_registration() {
    let r = router();
    let server: Queue<RawMessage> = Queue::new(&r);
    let client: Queue<RawMessage> = Queue::new(&r);

    let lookup = tokio::spawn(async move {
        client
            .connect_named_interface("late", RawCodec, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .map(|remote| remote.remote_address())
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let late = server.register_named_interface(RawCodec, "late").await.unwrap();

    assert_eq!(lookup.await.unwrap(), Some(late.address()));
}

#[tokio::test]
async fn test_lookup_timeout() {
    let r = router();
    let queue: Queue<RawMessage> = Queue::new(&r);
    let missing = queue
        .connect_named_interface("nobody", RawCodec, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(missing.is_none());
}

// ===== Cooperating servers =====

#[tokio::test]
async fn test_stub_resolver_forwards_registration() {
    let b = router();
    let a = router();
    let (b_port, a_port) = link(&b, &a, "").await;
    assert_eq!(
        a.name_server().unwrap().role(),
        NameServerRole::StubResolver {
            upstream: b.global_address(b.name_server_address())
        }
    );

    let a_queue: Queue<RawMessage> = Queue::new(&a);
    let foo = a_queue.register_named_interface(RawCodec, "foo").await.unwrap();

    let b_queue: Queue<RawMessage> = Queue::new(&b);
    let remote = b_queue
        .connect_named_interface("foo", RawCodec, Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("foo resolves from the upstream router");
    assert_eq!(remote.remote_address(), foo.global_address());

    // Traffic crosses the link both ways.
    assert!(remote.send(&RawMessage::new(7, b"hi".to_vec())));
    let event = a_queue
        .read_message(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(event.body, RawMessage::new(7, b"hi".to_vec()));
    assert_eq!(event.receiver, foo.address());
    assert!(foo.reply(&event, &RawMessage::new(8, Vec::new())));
    let answer = b_queue
        .read_message(Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(answer.id, 8);

    a_port.finish().await;
    wait_until(|| b_port.state() == PortState::DownstreamUnconnected).await;
    assert!(!remote.is_alive());
    assert!(b.name_server().unwrap().local_entry("foo").is_none());
    assert_eq!(a.name_server().unwrap().role(), NameServerRole::Local);

    let from_b = b_queue
        .connect_named_interface("foo", RawCodec, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(from_b.is_none());

    let a_client: Queue<RawMessage> = Queue::new(&a);
    let from_a = a_client
        .connect_named_interface("foo", RawCodec, Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .expect("foo is still known locally");
    assert_eq!(from_a.remote_address(), foo.address());
}

#[tokio::test]
async fn test_hierarchical_names() {
    let b = router();
    let l = router();
    let (_b_port, _l_port) = link(&b, &l, "left").await;

    let l_ns = l.name_server().unwrap();
    assert_eq!(l_ns.domain(), "/left");
    let entry = b.name_server().unwrap().local_entry("left").unwrap();
    assert!(entry.is_name_server);

    let l_queue: Queue<RawMessage> = Queue::new(&l);
    let bar = l_queue.register_named_interface(RawCodec, "bar").await.unwrap();
    assert!(l_ns.local_entry("bar").is_some());

    let b_queue: Queue<RawMessage> = Queue::new(&b);
    let via_b = b_queue
        .connect_named_interface("/left/bar", RawCodec, Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("/left/bar resolves through a redirect");
    assert_eq!(via_b.remote_address(), bar.global_address());
    assert!(via_b.is_alive());

    let l_client: Queue<RawMessage> = Queue::new(&l);
    let via_l = l_client
        .connect_named_interface("bar", RawCodec, Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("bar resolves on its own router");
    assert_eq!(via_l.remote_address(), bar.address());

    let domain_only = b_queue
        .connect_named_interface("/left", RawCodec, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(domain_only.is_none());
}

#[tokio::test]
async fn test_duplicate_sub_domain_fails_attach() {
    let root = router();
    let first = router();
    let second = router();
    let (_p1, _p2) = link(&root, &first, "left").await;

    let (down, up) = PipeTransport::pair();
    let down_port = Port::new(root.clone(), down);
    down_port.init_downstream().await.unwrap();
    let up_port = Port::new(second.clone(), up);
    let err = up_port.init_upstream("left").await.unwrap_err();
    assert!(matches!(
        err,
        crate::port::PortError::Router(RouterError::NameServer(NameServerError::NameInUse(_)))
    ));
    assert_eq!(up_port.state(), PortState::Uninitialized);
    assert_eq!(second.upstream_port(), None);
    assert_eq!(second.name_server().unwrap().role(), NameServerRole::Local);
}

#[tokio::test]
async fn test_shutdown_stops_name_server() {
    let r = router();
    assert!(r.name_server().is_some());
    r.shutdown();
    assert!(r.name_server().is_none());
}
