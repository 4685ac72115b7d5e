// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Grid Clash server binary: wires the UDP socket, the receive/scheduler/
//! prune tasks and a single writer task around a mutex-serialized
//! [`ServerState`] (`§5`).

mod config;
mod grid;
mod metrics;
mod scheduler;
mod session;

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use config::{Args, ServerConfig};
use metrics::{MetricsSink, NullMetricsSink, TickMetrics};
use netrush_app_core::config::ConfigService;
use netrush_config_fs::FsConfigStore;
use netrush_proto::payload::{AckPayload, EventPayload, GameOverPayload, InitAckPayload};
use netrush_proto::{payload, wire, MsgType};
use session::ServerState;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config_service: Option<ConfigService<FsConfigStore>> =
        FsConfigStore::new().map(ConfigService::new).ok();
    let persisted = config_service
        .as_ref()
        .and_then(|svc| svc.load::<ServerConfig>("server").ok().flatten());
    let config = args.apply(persisted.unwrap_or_default());
    if let Some(svc) = &config_service {
        let _ = svc.save("server", &config);
    }

    let socket = Arc::new(UdpSocket::bind((config.host, config.port)).await?);
    info!(host = %config.host, port = config.port, "netrush-server listening");

    let state = Arc::new(Mutex::new(ServerState::new(&config)));
    let seq = Arc::new(AtomicU32::new(0));
    let dropped = Arc::new(AtomicU64::new(0));
    let metrics: Arc<dyn MetricsSink> = Arc::new(NullMetricsSink);
    let (tx, mut rx) = mpsc::channel::<(SocketAddr, Bytes)>(1024);

    tokio::spawn({
        let socket = socket.clone();
        async move {
            while let Some((addr, bytes)) = rx.recv().await {
                if let Err(err) = socket.send_to(&bytes, addr).await {
                    warn!(?err, %addr, "send failed");
                }
            }
        }
    });

    tokio::spawn({
        let socket = socket.clone();
        let state = state.clone();
        let tx = tx.clone();
        let seq = seq.clone();
        let dropped = dropped.clone();
        let threshold = config.compression_threshold;
        let max_datagram = config.max_datagram;
        async move {
            let mut buf = vec![0u8; max_datagram];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => {
                        handle_datagram(&buf[..n], addr, &state, &tx, &seq, &dropped, threshold)
                            .await;
                    }
                    Err(err) => warn!(?err, "recv_from failed"),
                }
            }
        }
    });

    tokio::spawn({
        let state = state.clone();
        let tx = tx.clone();
        let seq = seq.clone();
        let dropped = dropped.clone();
        let metrics = metrics.clone();
        let threshold = config.compression_threshold;
        let period = Duration::from_millis(1000 / u64::from(config.update_rate_hz.max(1)));
        async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                run_scheduler_tick(&state, &tx, &seq, &dropped, &metrics, threshold).await;
            }
        }
    });

    tokio::spawn({
        let state = state.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let removed = state.lock().await.prune_stale(Instant::now());
                for addr in removed {
                    info!(%addr, "client timed out");
                }
            }
        }
    });

    std::future::pending::<()>().await;
    Ok(())
}

fn now_ms() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[allow(clippy::too_many_arguments)]
async fn send_packet(
    tx: &mpsc::Sender<(SocketAddr, Bytes)>,
    addr: SocketAddr,
    msg_type: MsgType,
    snapshot_id: u32,
    seq_num: u32,
    raw_payload: &[u8],
    threshold: usize,
    force_compress: bool,
) {
    let body = match payload::encode_body(raw_payload, force_compress, threshold) {
        Ok(body) => body,
        Err(err) => {
            warn!(?err, "failed to encode payload body");
            return;
        }
    };
    let header = wire::Header {
        msg_type,
        snapshot_id,
        seq_num,
        ts_ms: now_ms(),
    };
    match wire::encode(&header, &body) {
        Ok(bytes) => {
            let _ = tx.send((addr, bytes)).await;
        }
        Err(err) => warn!(?err, "failed to encode packet"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_datagram(
    bytes: &[u8],
    addr: SocketAddr,
    state: &Arc<Mutex<ServerState>>,
    tx: &mpsc::Sender<(SocketAddr, Bytes)>,
    seq: &AtomicU32,
    dropped: &AtomicU64,
    threshold: usize,
) {
    let packet = match wire::decode(bytes) {
        Ok(packet) => packet,
        Err(err) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            debug!(?err, %addr, "dropping packet");
            return;
        }
    };

    match packet.header.msg_type {
        MsgType::Init => {
            let outcome = state.lock().await.accept_init(addr, Instant::now());
            match outcome {
                Ok(client_id) => {
                    let raw = InitAckPayload { client_id }.encode();
                    let seq_num = seq.fetch_add(1, Ordering::Relaxed);
                    send_packet(tx, addr, MsgType::InitAck, 0, seq_num, &raw, threshold, false)
                        .await;
                }
                Err(err) => warn!(?err, %addr, "init rejected"),
            }
        }
        MsgType::Event => {
            let Ok(raw_body) = payload::decode_body(&packet.payload) else {
                dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%addr, "bad event compression flag");
                return;
            };
            let Ok(event) = EventPayload::decode(&raw_body) else {
                dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%addr, "malformed event payload");
                return;
            };
            let outcome = state.lock().await.ingest_event(addr, event, Instant::now());
            match outcome {
                Ok(ack) => {
                    // Echo the event's own seq_num (not a fresh server seq_num) so
                    // the ACK is idempotent under client retransmits of the same EVENT.
                    send_ack(tx, addr, packet.header.seq_num, ack, threshold).await;
                }
                Err(err) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(?err, %addr, "event rejected");
                }
            }
        }
        other => debug!(?other, %addr, "unexpected message type at server"),
    }
}

async fn send_ack(
    tx: &mpsc::Sender<(SocketAddr, Bytes)>,
    addr: SocketAddr,
    seq_num: u32,
    ack: AckPayload,
    threshold: usize,
) {
    let raw = ack.encode();
    send_packet(tx, addr, MsgType::Ack, 0, seq_num, &raw, threshold, false).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_scheduler_tick(
    state: &Arc<Mutex<ServerState>>,
    tx: &mpsc::Sender<(SocketAddr, Bytes)>,
    seq: &AtomicU32,
    dropped: &AtomicU64,
    metrics: &Arc<dyn MetricsSink>,
    threshold: usize,
) {
    let (addrs, snapshot, game_over) = {
        let mut guard = state.lock().await;
        let outcome = guard.tick();
        (
            guard.session_addrs().collect::<Vec<_>>(),
            outcome.snapshot,
            outcome.game_over,
        )
    };

    let (snapshot_id, body) = snapshot;
    metrics.record(TickMetrics {
        session_count: addrs.len(),
        snapshot_id,
        dropped: dropped.swap(0, Ordering::Relaxed),
    });
    let full = body.full;
    let raw = match body.encode() {
        Ok(raw) => raw,
        Err(err) => {
            warn!(?err, "failed to encode snapshot body");
            return;
        }
    };
    for addr in &addrs {
        let seq_num = seq.fetch_add(1, Ordering::Relaxed);
        send_packet(tx, *addr, MsgType::Snapshot, snapshot_id, seq_num, &raw, threshold, full)
            .await;
    }

    if let Some(game_over_payload) = game_over {
        broadcast_game_over(tx, &addrs, snapshot_id, seq, &game_over_payload, threshold).await;
    }
}

async fn broadcast_game_over(
    tx: &mpsc::Sender<(SocketAddr, Bytes)>,
    addrs: &[SocketAddr],
    snapshot_id: u32,
    seq: &AtomicU32,
    game_over_payload: &GameOverPayload,
    threshold: usize,
) {
    let raw = match game_over_payload.encode() {
        Ok(raw) => raw,
        Err(err) => {
            warn!(?err, "failed to encode game over body");
            return;
        }
    };
    for attempt in 0..3u8 {
        for addr in addrs {
            let seq_num = seq.fetch_add(1, Ordering::Relaxed);
            send_packet(
                tx,
                *addr,
                MsgType::GameOver,
                snapshot_id,
                seq_num,
                &raw,
                threshold,
                false,
            )
            .await;
        }
        if attempt < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netrush_proto::payload::InitAckPayload;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::{timeout, Duration as TokioDuration};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            grid_side: 2,
            ..ServerConfig::default()
        }
    }

    async fn recv_decoded(rx: &mut mpsc::Receiver<(SocketAddr, Bytes)>) -> wire::Packet {
        let (_, bytes) = timeout(TokioDuration::from_secs(1), rx.recv())
            .await
            .expect("packet within timeout")
            .expect("channel open");
        wire::decode(&bytes).expect("well-formed packet")
    }

    #[tokio::test]
    async fn init_then_event_produces_init_ack_then_ack_echoing_seq_num() {
        let state = Arc::new(Mutex::new(ServerState::new(&test_config())));
        let seq = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::channel::<(SocketAddr, Bytes)>(16);
        let client = addr(1);

        let init_header = wire::Header {
            msg_type: MsgType::Init,
            snapshot_id: 0,
            seq_num: 0,
            ts_ms: 0,
        };
        let dropped = Arc::new(AtomicU64::new(0));
        let init_bytes = wire::encode(&init_header, &[]).expect("encode init");
        handle_datagram(&init_bytes, client, &state, &tx, &seq, &dropped, 1000).await;

        let pkt = recv_decoded(&mut rx).await;
        assert_eq!(pkt.header.msg_type, MsgType::InitAck);
        let raw_body = payload::decode_body(&pkt.payload).expect("decode body");
        let ack = InitAckPayload::decode(&raw_body).expect("decode init_ack");
        assert_eq!(ack.client_id, 1);

        let event = EventPayload {
            cell_index: 0,
            client_id: 1,
            ts_ms: 42,
        }
        .encode();
        let event_header = wire::Header {
            msg_type: MsgType::Event,
            snapshot_id: 0,
            seq_num: 99,
            ts_ms: 0,
        };
        let event_bytes = wire::encode(&event_header, &event).expect("encode event");
        handle_datagram(&event_bytes, client, &state, &tx, &seq, &dropped, 1000).await;

        let pkt = recv_decoded(&mut rx).await;
        assert_eq!(pkt.header.msg_type, MsgType::Ack);
        assert_eq!(
            pkt.header.seq_num, 99,
            "ack echoes the event's own seq_num, not a fresh server counter"
        );
    }

    #[tokio::test]
    async fn unknown_sender_event_is_dropped_without_a_reply() {
        let state = Arc::new(Mutex::new(ServerState::new(&test_config())));
        let seq = Arc::new(AtomicU32::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel::<(SocketAddr, Bytes)>(16);

        let event = EventPayload {
            cell_index: 0,
            client_id: 1,
            ts_ms: 0,
        }
        .encode();
        let header = wire::Header {
            msg_type: MsgType::Event,
            snapshot_id: 0,
            seq_num: 0,
            ts_ms: 0,
        };
        let bytes = wire::encode(&header, &event).expect("encode event");
        handle_datagram(&bytes, addr(9), &state, &tx, &seq, &dropped, 1000).await;

        assert!(
            timeout(TokioDuration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "no reply for an address with no session"
        );
    }

    #[derive(Default)]
    struct RecordingSink(std::sync::Mutex<Vec<TickMetrics>>);

    impl MetricsSink for RecordingSink {
        fn record(&self, metrics: TickMetrics) {
            self.0.lock().expect("lock").push(metrics);
        }
    }

    #[tokio::test]
    async fn scheduler_tick_records_session_count_and_dropped_packets() {
        let state = Arc::new(Mutex::new(ServerState::new(&test_config())));
        let seq = Arc::new(AtomicU32::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel::<(SocketAddr, Bytes)>(16);
        let sink = Arc::new(RecordingSink::default());
        let metrics: Arc<dyn MetricsSink> = sink.clone();

        let init_header = wire::Header {
            msg_type: MsgType::Init,
            snapshot_id: 0,
            seq_num: 0,
            ts_ms: 0,
        };
        let init_bytes = wire::encode(&init_header, &[]).expect("encode init");
        handle_datagram(&init_bytes, addr(1), &state, &tx, &seq, &dropped, 1000).await;
        let _ = recv_decoded(&mut rx).await;

        dropped.fetch_add(3, Ordering::Relaxed);
        run_scheduler_tick(&state, &tx, &seq, &dropped, &metrics, 1000).await;
        let _ = recv_decoded(&mut rx).await;

        let recorded = sink.0.lock().expect("lock");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].session_count, 1);
        assert_eq!(recorded[0].dropped, 3);
        assert_eq!(dropped.load(Ordering::Relaxed), 0, "counter resets each tick");
    }
}
