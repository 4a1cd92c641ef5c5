use std::{sync::Arc, time::Duration};

use erlang_distribution_node::{
    Atom, Node, NodeConfig, NodeInfo, ReceiveError, StaticDiscovery, Term,
};
use secrecy::SecretString;

const WAIT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start(name: &str, cookie: &str, discovery: &Arc<StaticDiscovery>) -> Node {
    let config = NodeConfig {
        name: name.into(),
        listen: "127.0.0.1:0".parse().unwrap(),
        tick_interval_ms: 200,
        ..NodeConfig::default()
    };
    let node = Node::start(config, SecretString::from(cookie), discovery.clone())
        .await
        .unwrap();
    discovery.register(
        name,
        NodeInfo::new("127.0.0.1", node.local_addr().port()),
    );
    node
}

async fn pair() -> (Node, Node) {
    init_logging();
    let discovery = Arc::new(StaticDiscovery::new());
    let alice = start("alice@localhost", "cookie", &discovery).await;
    let bob = start("bob@localhost", "cookie", &discovery).await;
    (alice, bob)
}

#[tokio::test]
async fn messages_cross_the_connection() {
    let (alice, bob) = pair().await;
    let mut client = alice.create_mailbox();
    let mut echo = bob.create_named_mailbox("echo").unwrap();

    client
        .send_to_name(
            "bob@localhost",
            "echo",
            Term::tuple(vec![Term::Pid(client.pid().clone()), Term::atom("hello")]),
        )
        .unwrap();

    let request = echo.receive_timeout(WAIT).await.unwrap();
    assert_eq!(request.from.as_ref(), Some(client.pid()));
    let fields = request.message.as_tuple().unwrap().to_vec();
    let reply_to = fields[0].as_pid().unwrap().clone();
    echo.send(&reply_to, fields[1].clone()).unwrap();

    let reply = client.receive_timeout(WAIT).await.unwrap();
    assert_eq!(reply.message, Term::atom("hello"));

    assert_eq!(alice.connected_nodes(), vec![Atom::from("bob@localhost")]);
    assert_eq!(bob.connected_nodes(), vec![Atom::from("alice@localhost")]);
}

#[tokio::test]
async fn remote_exit_reaches_linked_mailbox() {
    let (alice, bob) = pair().await;
    let mut watcher = alice.create_mailbox();
    let mut worker = bob.create_mailbox();

    watcher.link(worker.pid()).unwrap();
    watcher.send(worker.pid(), Term::atom("go")).unwrap();
    assert_eq!(
        worker.receive_timeout(WAIT).await.unwrap().message,
        Term::atom("go")
    );
    assert_eq!(worker.links(), vec![watcher.pid().clone()]);

    worker.exit(Term::atom("boom"));
    match watcher.receive_timeout(WAIT).await {
        Err(ReceiveError::Exit(signal)) => {
            assert_eq!(signal.from, *worker.pid());
            assert_eq!(signal.reason, Term::atom("boom"));
        }
        other => panic!("expected an exit signal, got {:?}", other),
    }
}

#[tokio::test]
async fn remote_monitors_report_down_and_noproc() {
    let (alice, bob) = pair().await;
    let mut watcher = alice.create_mailbox();
    let worker = bob.create_mailbox();
    let worker_pid = worker.pid().clone();

    let reference = watcher.monitor(&worker_pid).unwrap();
    alice.connect("bob@localhost").await.unwrap();
    // The monitor travels ahead of this message on the same connection.
    let mut probe = bob.create_mailbox();
    watcher.send(probe.pid(), Term::atom("sync")).unwrap();
    probe.receive_timeout(WAIT).await.unwrap();

    worker.close();
    let down = watcher.receive_timeout(WAIT).await.unwrap().message;
    assert_eq!(
        down,
        Term::tuple(vec![
            Term::atom("DOWN"),
            Term::Reference(reference),
            Term::atom("process"),
            Term::Pid(worker_pid.clone()),
            Term::atom("normal"),
        ])
    );

    let reference = watcher.monitor(&worker_pid).unwrap();
    let down = watcher.receive_timeout(WAIT).await.unwrap().message;
    let fields = down.as_tuple().unwrap();
    assert_eq!(fields[1], Term::Reference(reference));
    assert_eq!(fields[4], Term::atom("noproc"));
}

#[tokio::test]
async fn lost_connection_breaks_links() {
    let (alice, bob) = pair().await;
    let mut watcher = alice.create_mailbox();
    let mut worker = bob.create_mailbox();

    watcher.link(worker.pid()).unwrap();
    watcher.send(worker.pid(), Term::atom("go")).unwrap();
    worker.receive_timeout(WAIT).await.unwrap();

    bob.shutdown();
    match watcher.receive_timeout(WAIT).await {
        Err(ReceiveError::Exit(signal)) => {
            assert_eq!(signal.from, *worker.pid());
            assert_eq!(signal.reason, Term::atom("noconnection"));
        }
        other => panic!("expected an exit signal, got {:?}", other),
    }
}

#[tokio::test]
async fn mismatched_cookies_do_not_connect() {
    init_logging();
    let discovery = Arc::new(StaticDiscovery::new());
    let alice = start("alice@localhost", "one", &discovery).await;
    let _bob = start("bob@localhost", "two", &discovery).await;

    assert!(alice.connect("bob@localhost").await.is_err());
    assert!(alice.connected_nodes().is_empty());
}
