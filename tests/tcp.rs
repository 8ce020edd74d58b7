//! Three nodes on loopback sockets, driven by a line-oriented JSON client.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpListener, TcpStream},
};

use paxos_bank::{
    common::config::Config,
    consensus::{
        message::{NodeId, Reply},
        store::MemoryLogStore,
    },
    network::{self, Node},
};

async fn cluster() -> (BTreeMap<NodeId, u16>, Vec<Arc<Node>>) {
    let mut listeners = Vec::new();
    let mut ports = BTreeMap::new();
    for id in 1..=3 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.insert(id, listener.local_addr().unwrap().port());
        listeners.push((id, listener));
    }

    let config = |id: NodeId| Config {
        ports: ports.clone(),
        round_timeout_ms: 1_000,
        ..Config::for_node(id)
    };
    let mut listeners = listeners.into_iter();
    let (_, l1) = listeners.next().unwrap();
    let (_, l2) = listeners.next().unwrap();
    let (_, l3) = listeners.next().unwrap();
    let (c1, c2, c3) = (config(1), config(2), config(3));

    let (n1, n2, n3) = tokio::join!(
        network::start(&c1, Arc::new(MemoryLogStore::new()), l1),
        network::start(&c2, Arc::new(MemoryLogStore::new()), l2),
        network::start(&c3, Arc::new(MemoryLogStore::new()), l3),
    );
    (ports, vec![n1.unwrap(), n2.unwrap(), n3.unwrap()])
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (reader, writer) = stream.into_split();
        Client {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn reply(&mut self) -> Reply {
        let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("no reply in time")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn client_transfers_over_tcp() {
    let (ports, nodes) = cluster().await;
    let mut client = Client::connect(ports[&1]).await;

    client
        .send(r#"{"type":"TRANSACTION_MESSAGE","sender":1,"receiver":2,"amount":30}"#)
        .await;
    assert_eq!(
        client.reply().await,
        Reply::Transfer {
            committed: true,
            seq: None,
            error: None,
        }
    );

    client.send(r#"{"type":"SHOW_BALANCE"}"#).await;
    assert_eq!(
        client.reply().await,
        Reply::Balance {
            balance: 70,
            client_id: 1,
        }
    );

    // 70 <= 70 needs a round across the sockets
    client
        .send(r#"{"type":"TRANSACTION_MESSAGE","sender":1,"receiver":3,"amount":70}"#)
        .await;
    assert_eq!(
        client.reply().await,
        Reply::Transfer {
            committed: true,
            seq: Some(1),
            error: None,
        }
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    for node in &nodes {
        let chain = node.blockchain().await;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].transactions.len(), 2);
    }
    assert_eq!(nodes[2].balance().await, 170);
}

#[tokio::test]
async fn malformed_line_keeps_connection_open() {
    let (ports, _nodes) = cluster().await;
    let mut client = Client::connect(ports[&2]).await;

    client.send("this is not json").await;
    client.send(r#"{"type":"NOT_A_MESSAGE"}"#).await;
    client.send(r#"{"type":"SHOW_LOG_MESSAGE"}"#).await;
    client.send(r#"{"type":"SHOW_BALANCE"}"#).await;

    assert_eq!(
        client.reply().await,
        Reply::Balance {
            balance: 100,
            client_id: 2,
        }
    );
}

#[tokio::test]
async fn transfer_for_another_client_is_refused() {
    let (ports, _nodes) = cluster().await;
    let mut client = Client::connect(ports[&3]).await;

    client
        .send(r#"{"type":"TRANSACTION_MESSAGE","sender":1,"receiver":2,"amount":5}"#)
        .await;
    match client.reply().await {
        Reply::Transfer { committed, error, .. } => {
            assert!(!committed);
            assert!(error.is_some());
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn start_fails_when_peers_are_missing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let own = listener.local_addr().unwrap().port();
    let mut ports = BTreeMap::new();
    ports.insert(1, own);
    for id in 2..=3 {
        let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.insert(id, vacant.local_addr().unwrap().port());
    }

    let mut config = Config {
        ports,
        ..Config::for_node(1)
    };
    config.backoff.base_ms = 1;
    config.backoff.max_ms = 5;

    let result = network::start(&config, Arc::new(MemoryLogStore::new()), listener).await;
    assert!(result.is_err());
}
