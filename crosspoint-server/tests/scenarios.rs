//! End-to-end protocol scenarios over real TCP connections on
//! localhost, expressed as literal wire bytes.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crosspoint_core::{RouterConfig, RoutingModel};
use crosspoint_protocol::swp08::{FrameReader, Swp08Item, Swp08Message};
use crosspoint_protocol::videohub::{Block, BlockReader};
use crosspoint_protocol::gvnative::{encode_message, GvMessage, GvReader};
use crosspoint_server::engine::EngineConfig;
use crosspoint_server::{GvNativeEngine, Swp08Engine, VideohubEngine};

const WAIT: Duration = Duration::from_secs(5);

fn local_config() -> EngineConfig {
    EngineConfig {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
    }
}

fn default_model() -> Arc<RoutingModel> {
    RoutingModel::new(RouterConfig::default())
}

// ── VideoHub helpers ─────────────────────────────────────────────

struct HubClient {
    stream: TcpStream,
    frames: BlockReader,
}

impl HubClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self {
            stream,
            frames: BlockReader::new(),
        }
    }

    async fn next_block(&mut self) -> Block {
        loop {
            if let Some(block) = self.frames.next_block().unwrap() {
                return block;
            }
            let mut buf = [0u8; 4096];
            let n = timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for block")
                .unwrap();
            assert_ne!(n, 0, "connection closed while waiting for block");
            self.frames.push(&buf[..n]);
        }
    }

    /// Read blocks until the initial dump's lock section has arrived.
    async fn skip_dump(&mut self) {
        loop {
            if let Block::Locks(_) = self.next_block().await {
                return;
            }
        }
    }

    async fn send(&mut self, text: &str) {
        self.stream.write_all(text.as_bytes()).await.unwrap();
    }
}

async fn start_videohub(model: &Arc<RoutingModel>) -> (Arc<VideohubEngine>, u16) {
    let engine = VideohubEngine::new(Arc::clone(model), local_config());
    let port = engine.start().await.unwrap();
    (engine, port)
}

// ── S1: PING ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_videohub_ping() {
    let model = default_model();
    let (engine, port) = start_videohub(&model).await;

    let mut client = HubClient::connect(port).await;
    client.skip_dump().await;
    client.send("PING:\n\n").await;
    assert_eq!(client.next_block().await, Block::Ack);

    engine.stop().await;
}

// ── S2: route update, success ────────────────────────────────────

#[tokio::test]
async fn test_videohub_route_update_success() {
    let model = default_model();
    let (engine, port) = start_videohub(&model).await;

    let mut sender = HubClient::connect(port).await;
    let mut observer = HubClient::connect(port).await;
    sender.skip_dump().await;
    observer.skip_dump().await;

    sender.send("VIDEO OUTPUT ROUTING:\n3 7\n\n").await;

    // the sender's ACK precedes the broadcast
    assert_eq!(sender.next_block().await, Block::Ack);
    match sender.next_block().await {
        Block::Routing(lines) => assert_eq!(lines.entries, vec![(3, 7)]),
        other => panic!("expected routing broadcast, got {other:?}"),
    }
    // every peer observes the applied subset
    match observer.next_block().await {
        Block::Routing(lines) => assert_eq!(lines.entries, vec![(3, 7)]),
        other => panic!("expected routing broadcast, got {other:?}"),
    }
    assert_eq!(model.route(0, 3), Some(7));

    engine.stop().await;
}

// ── S3: route update, out of range ───────────────────────────────

#[tokio::test]
async fn test_videohub_route_update_out_of_range() {
    let model = default_model();
    let (engine, port) = start_videohub(&model).await;

    let mut sender = HubClient::connect(port).await;
    sender.skip_dump().await;
    sender.send("VIDEO OUTPUT ROUTING:\n3 99\n\n").await;
    assert_eq!(sender.next_block().await, Block::Nak);
    assert_eq!(model.route(0, 3), Some(3));

    // a follow-up ping answers immediately, proving no broadcast was
    // queued in between
    sender.send("PING:\n\n").await;
    assert_eq!(sender.next_block().await, Block::Ack);

    engine.stop().await;
}

// ── S4: lock ownership scoping ───────────────────────────────────

#[tokio::test]
async fn test_videohub_lock_ownership_scoping() {
    let model = default_model();
    let (engine, port) = start_videohub(&model).await;

    let mut peer_a = HubClient::connect(port).await;
    let mut peer_b = HubClient::connect(port).await;
    peer_a.skip_dump().await;
    peer_b.skip_dump().await;

    // A locks destination 0
    peer_a.send("VIDEO OUTPUT LOCKS:\n0 O\n\n").await;
    assert_eq!(peer_a.next_block().await, Block::Ack);
    match peer_a.next_block().await {
        Block::Locks(lines) => {
            assert_eq!(lines.entries.len(), 1);
            assert_eq!(lines.entries[0].0, 0);
            assert_eq!(lines.entries[0].1.as_char(), 'O');
        }
        other => panic!("expected lock broadcast, got {other:?}"),
    }
    // B sees the same lock as held by another peer
    match peer_b.next_block().await {
        Block::Locks(lines) => assert_eq!(lines.entries[0].1.as_char(), 'L'),
        other => panic!("expected lock broadcast, got {other:?}"),
    }

    // B's route write on the locked destination is refused
    peer_b.send("VIDEO OUTPUT ROUTING:\n0 5\n\n").await;
    assert_eq!(peer_b.next_block().await, Block::Nak);
    assert_eq!(model.route(0, 0), Some(0));

    // A disconnects; the engine releases the lock and tells B
    drop(peer_a);
    match peer_b.next_block().await {
        Block::Locks(lines) => {
            assert_eq!(lines.entries[0].0, 0);
            assert_eq!(lines.entries[0].1.as_char(), 'U');
        }
        other => panic!("expected unlock broadcast, got {other:?}"),
    }

    // B retries and succeeds
    peer_b.send("VIDEO OUTPUT ROUTING:\n0 5\n\n").await;
    assert_eq!(peer_b.next_block().await, Block::Ack);
    match peer_b.next_block().await {
        Block::Routing(lines) => assert_eq!(lines.entries, vec![(0, 5)]),
        other => panic!("expected routing broadcast, got {other:?}"),
    }
    assert_eq!(model.route(0, 0), Some(5));

    engine.stop().await;
}

// ── VideoHub queries and labels ──────────────────────────────────

#[tokio::test]
async fn test_videohub_query_and_label_update() {
    let model = default_model();
    let (engine, port) = start_videohub(&model).await;

    let mut client = HubClient::connect(port).await;
    client.skip_dump().await;

    // empty body = query: ACK then the full section
    client.send("INPUT LABELS:\n\n").await;
    assert_eq!(client.next_block().await, Block::Ack);
    match client.next_block().await {
        Block::InputLabels(lines) => {
            assert_eq!(lines.entries.len(), 12);
            assert_eq!(lines.entries[0], (0, "Input 1".to_string()));
        }
        other => panic!("expected input labels, got {other:?}"),
    }

    // update with an embedded-space label
    client.send("INPUT LABELS:\n2 Camera 1 (left)\n\n").await;
    assert_eq!(client.next_block().await, Block::Ack);
    match client.next_block().await {
        Block::InputLabels(lines) => {
            assert_eq!(lines.entries, vec![(2, "Camera 1 (left)".to_string())]);
        }
        other => panic!("expected label broadcast, got {other:?}"),
    }
    assert_eq!(model.snapshot(None).input_labels[2], "Camera 1 (left)");

    engine.stop().await;
}

#[tokio::test]
async fn test_videohub_initial_dump_contents() {
    let model = default_model();
    let (engine, port) = start_videohub(&model).await;

    let mut client = HubClient::connect(port).await;
    let mut saw = Vec::new();
    loop {
        let block = client.next_block().await;
        let done = matches!(block, Block::Locks(_));
        saw.push(block);
        if done {
            break;
        }
    }

    assert!(matches!(saw[0], Block::Preamble { .. }));
    match &saw[1] {
        Block::Device(info) => {
            assert!(info.present);
            assert_eq!(info.video_inputs, 12);
            assert_eq!(info.video_outputs, 12);
        }
        other => panic!("expected device block, got {other:?}"),
    }
    assert!(matches!(saw[2], Block::InputLabels(_)));
    assert!(matches!(saw[3], Block::OutputLabels(_)));
    match &saw[4] {
        Block::Routing(lines) => assert_eq!(lines.entries.len(), 12),
        other => panic!("expected routing block, got {other:?}"),
    }

    engine.stop().await;
}

// ── S5: SW-P-08 crosspoint connect ───────────────────────────────

struct ProbelClient {
    stream: TcpStream,
    frames: FrameReader,
    pending: Vec<Swp08Item>,
}

impl ProbelClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self {
            stream,
            frames: FrameReader::new(),
            pending: Vec::new(),
        }
    }

    async fn next_item(&mut self) -> Swp08Item {
        loop {
            if !self.pending.is_empty() {
                return self.pending.remove(0);
            }
            let mut buf = [0u8; 4096];
            let n = timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            assert_ne!(n, 0, "connection closed while waiting for frame");
            self.pending = self.frames.feed(&buf[..n]);
        }
    }
}

#[tokio::test]
async fn test_swp08_crosspoint_connect_scenario() {
    let model = default_model();
    let engine = Swp08Engine::new(Arc::clone(&model), local_config());
    let port = engine.start().await.unwrap();

    let mut sender = ProbelClient::connect(port).await;
    let mut observer = ProbelClient::connect(port).await;

    // literal scenario bytes: connect dest 3 <- src 7
    let wire = [0x10, 0x02, 0x02, 0x00, 0x00, 0x03, 0x07, 0x09, 0xEB, 0x10, 0x03];
    sender.stream.write_all(&wire).await.unwrap();

    assert_eq!(sender.next_item().await, Swp08Item::Ack);
    let connected = Swp08Message::Connected {
        matrix: 0,
        level: 0,
        dest: 3,
        src: 7,
        extended: false,
    };
    assert_eq!(sender.next_item().await, Swp08Item::Message(connected.clone()));
    assert_eq!(observer.next_item().await, Swp08Item::Message(connected));
    assert_eq!(model.route(0, 3), Some(7));

    engine.stop().await;
}

#[tokio::test]
async fn test_swp08_checksum_failure_naks() {
    let model = default_model();
    let engine = Swp08Engine::new(Arc::clone(&model), local_config());
    let port = engine.start().await.unwrap();

    let mut client = ProbelClient::connect(port).await;
    // same frame as S5 with a corrupted checksum byte
    let wire = [0x10, 0x02, 0x02, 0x00, 0x00, 0x03, 0x07, 0x09, 0xEC, 0x10, 0x03];
    client.stream.write_all(&wire).await.unwrap();

    assert_eq!(client.next_item().await, Swp08Item::Nak);
    assert_eq!(model.route(0, 3), Some(3));

    engine.stop().await;
}

#[tokio::test]
async fn test_swp08_tally_dump() {
    let model = default_model();
    let engine = Swp08Engine::new(Arc::clone(&model), local_config());
    let port = engine.start().await.unwrap();

    let mut client = ProbelClient::connect(port).await;
    let dump = crosspoint_protocol::swp08::encode_message(&Swp08Message::TallyDump {
        matrix: 0,
        level: 0,
        extended: false,
    })
    .unwrap();
    client.stream.write_all(&dump).await.unwrap();

    assert_eq!(client.next_item().await, Swp08Item::Ack);
    for dest in 0..12u16 {
        match client.next_item().await {
            Swp08Item::Message(Swp08Message::Tally { dest: d, src, .. }) => {
                assert_eq!(d, dest);
                assert_eq!(src, dest);
            }
            other => panic!("expected tally for dest {dest}, got {other:?}"),
        }
    }

    engine.stop().await;
}

// ── S6: GV Native TI take ────────────────────────────────────────

struct GvClient {
    stream: TcpStream,
    frames: GvReader,
    pending: Vec<crosspoint_protocol::gvnative::GvItem>,
}

impl GvClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self {
            stream,
            frames: GvReader::new(),
            pending: Vec::new(),
        }
    }

    async fn next_message(&mut self) -> GvMessage {
        loop {
            if !self.pending.is_empty() {
                let item = self.pending.remove(0);
                assert!(item.checksum_ok, "reply carried a bad checksum");
                return item.message.unwrap();
            }
            let mut buf = [0u8; 4096];
            let n = timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            assert_ne!(n, 0, "connection closed while waiting for frame");
            self.pending = self.frames.feed(&buf[..n]);
        }
    }
}

#[tokio::test]
async fn test_gvnative_take_index_scenario() {
    let model = default_model();
    let engine = GvNativeEngine::new(Arc::clone(&model), local_config());
    let port = engine.start().await.unwrap();

    let mut client = GvClient::connect(port).await;
    let take = encode_message(&GvMessage::TakeIndex { dest: 3, src: 7, level: 0 });
    client.stream.write_all(&take).await.unwrap();

    // echo mode defaults on: ER,00,TI acknowledges the take
    assert_eq!(
        client.next_message().await,
        GvMessage::CommandError {
            code: 0,
            echo: Some("TI".to_string())
        }
    );
    assert_eq!(model.route(0, 3), Some(7));

    engine.stop().await;
}

#[tokio::test]
async fn test_gvnative_query_names_and_status() {
    let model = default_model();
    let engine = GvNativeEngine::new(Arc::clone(&model), local_config());
    let port = engine.start().await.unwrap();

    let mut client = GvClient::connect(port).await;

    let query = encode_message(&GvMessage::QueryNames {
        kind: crosspoint_protocol::gvnative::NameKind::Source,
    });
    client.stream.write_all(&query).await.unwrap();
    match client.next_message().await {
        GvMessage::NamesReply { entries, .. } => {
            assert_eq!(entries.len(), 12);
            assert_eq!(entries[0].1, "Input 1");
        }
        other => panic!("expected names reply, got {other:?}"),
    }
    // trailing ER,00 on bulk queries
    assert_eq!(
        client.next_message().await,
        GvMessage::CommandError {
            code: 0,
            echo: Some("QN".to_string())
        }
    );

    let query = encode_message(&GvMessage::QueryDest {
        dest: 3,
        level: 0,
        extended: false,
    });
    client.stream.write_all(&query).await.unwrap();
    match client.next_message().await {
        GvMessage::DestReply { dest, level, src } => {
            assert_eq!((dest, level, src), (3, 0, 3));
        }
        other => panic!("expected dest reply, got {other:?}"),
    }

    engine.stop().await;
}

#[tokio::test]
async fn test_gvnative_change_flags() {
    let model = default_model();
    let engine = GvNativeEngine::new(Arc::clone(&model), local_config());
    let port = engine.start().await.unwrap();

    let mut client = GvClient::connect(port).await;

    // no changes yet
    let poll = encode_message(&GvMessage::Background { sub: 'F', args: vec![] });
    client.stream.write_all(&poll).await.unwrap();
    match client.next_message().await {
        GvMessage::BackgroundReply { sub: 'F', args } => assert_eq!(args, vec!["00000000"]),
        other => panic!("expected KB F, got {other:?}"),
    }

    // a mutation from the UI side sets the routing flag
    assert!(model.set_route(0, 2, 9, None).unwrap().is_some());
    client.stream.write_all(&poll).await.unwrap();
    match client.next_message().await {
        GvMessage::BackgroundReply { sub: 'F', args } => assert_eq!(args, vec!["00000001"]),
        other => panic!("expected KB F, got {other:?}"),
    }

    // BK f clears, echo-acknowledged
    let clear = encode_message(&GvMessage::Background { sub: 'f', args: vec![] });
    client.stream.write_all(&clear).await.unwrap();
    assert_eq!(
        client.next_message().await,
        GvMessage::CommandError {
            code: 0,
            echo: Some("BK".to_string())
        }
    );
    client.stream.write_all(&poll).await.unwrap();
    match client.next_message().await {
        GvMessage::BackgroundReply { sub: 'F', args } => assert_eq!(args, vec!["00000000"]),
        other => panic!("expected KB F, got {other:?}"),
    }

    engine.stop().await;
}

// ── Cross-protocol propagation ───────────────────────────────────

#[tokio::test]
async fn test_swp08_take_reaches_videohub_peers() {
    let model = default_model();
    let (hub_engine, hub_port) = start_videohub(&model).await;
    let probel_engine = Swp08Engine::new(Arc::clone(&model), local_config());
    let probel_port = probel_engine.start().await.unwrap();

    let mut hub = HubClient::connect(hub_port).await;
    hub.skip_dump().await;

    let mut probel = ProbelClient::connect(probel_port).await;
    let wire = [0x10, 0x02, 0x02, 0x00, 0x00, 0x03, 0x07, 0x09, 0xEB, 0x10, 0x03];
    probel.stream.write_all(&wire).await.unwrap();
    assert_eq!(probel.next_item().await, Swp08Item::Ack);

    // the same committed mutation fans out on the VideoHub wire
    match hub.next_block().await {
        Block::Routing(lines) => assert_eq!(lines.entries, vec![(3, 7)]),
        other => panic!("expected routing broadcast, got {other:?}"),
    }

    hub_engine.stop().await;
    probel_engine.stop().await;
}

// ── Shutdown behavior ────────────────────────────────────────────

#[tokio::test]
async fn test_stop_closes_peers() {
    let model = default_model();
    let (engine, port) = start_videohub(&model).await;

    let mut client = HubClient::connect(port).await;
    client.skip_dump().await;

    engine.stop().await;

    // the peer observes EOF shortly after
    let mut buf = [0u8; 1024];
    loop {
        let n = timeout(WAIT, client.stream.read(&mut buf))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        if n == 0 {
            break;
        }
    }

    // and a fresh engine can start afterwards
    let engine2 = VideohubEngine::new(Arc::clone(&model), local_config());
    let _ = engine2.start().await.unwrap();
    engine2.stop().await;
}
