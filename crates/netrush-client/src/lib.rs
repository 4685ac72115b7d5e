// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Grid Clash client: connects to a server, keeps the connection alive,
//! sends claims reliably and reassembles the broadcast snapshot stream
//! into a local grid replica. The renderer is an external collaborator
//! reached only through [`reassembler::RenderPort`] (`§1`).

pub mod config;
pub mod reassembler;
pub mod session;
pub mod state;

use anyhow::{Context, Result};
use config::ClientConfig;
use netrush_proto::payload::{AckPayload, EventPayload, GameOverPayload, InitAckPayload};
use netrush_proto::{payload, wire, MsgType};
use reassembler::RenderPort;
use session::ClientSession;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

fn now_ms() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// A connected session: the real-transport counterpart to
/// [`ClientSession`], owning the socket and the background tasks that
/// drive it (`§5`: one receive task, one tick task).
pub struct SessionClient<R: RenderPort + Send + 'static> {
    socket: Arc<UdpSocket>,
    session: Arc<Mutex<ClientSession<R>>>,
    seq: Arc<AtomicU32>,
    config: ClientConfig,
}

impl<R: RenderPort + Send + 'static> SessionClient<R> {
    /// Connect a UDP socket to `server_addr` and build the session
    /// state machine for a `grid_side x grid_side` game. Does not block
    /// on the handshake; call [`Self::run`] to drive the receive and
    /// retransmit/keep-alive loops, which perform the INIT retry loop
    /// themselves.
    ///
    /// # Errors
    /// Returns an error if the local UDP socket cannot be bound or
    /// connected.
    pub async fn connect(
        server_addr: SocketAddr,
        grid_side: u16,
        config: ClientConfig,
        render: R,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("binding local UDP socket")?;
        socket
            .connect(server_addr)
            .await
            .context("connecting UDP socket to server")?;
        let session = ClientSession::new(grid_side, &config, render);
        Ok(Self {
            socket: Arc::new(socket),
            session: Arc::new(Mutex::new(session)),
            seq: Arc::new(AtomicU32::new(0)),
            config,
        })
    }

    /// Current state machine state.
    pub async fn state(&self) -> state::ClientState {
        self.session.lock().await.state()
    }

    /// Send a claim for `(row, col)`.
    ///
    /// # Errors
    /// Returns an error if the encoded EVENT packet cannot be sent.
    pub async fn send_claim(&self, row: u16, col: u16) -> Result<()> {
        let (seq_num, client_id) = {
            let mut guard = self.session.lock().await;
            let Some(client_id) = guard.client_id() else {
                anyhow::bail!("cannot claim before INIT_ACK is received");
            };
            let claim = guard.send_claim(row, col, Instant::now());
            (claim.seq_num, client_id)
        };
        self.send_event(seq_num, row, col, client_id).await
    }

    async fn send_event(&self, seq_num: u32, row: u16, col: u16, client_id: u32) -> Result<()> {
        let grid_side = self.session.lock().await.grid_side();
        let cell_index = u32::from(row) * u32::from(grid_side) + u32::from(col);
        let body = EventPayload {
            cell_index,
            client_id,
            ts_ms: now_ms(),
        }
        .encode();
        self.send_packet(MsgType::Event, seq_num, &body).await
    }

    async fn send_packet(&self, msg_type: MsgType, seq_num: u32, raw_payload: &[u8]) -> Result<()> {
        let body = payload::encode_body(raw_payload, false, self.config.compression_threshold)
            .context("encoding payload body")?;
        let header = wire::Header {
            msg_type,
            snapshot_id: 0,
            seq_num,
            ts_ms: now_ms(),
        };
        let bytes = wire::encode(&header, &body).context("encoding packet")?;
        self.socket.send(&bytes).await.context("sending packet")?;
        Ok(())
    }

    /// Run the receive loop and the retransmit/keep-alive tick loop.
    /// Returns only on a fatal socket error.
    ///
    /// # Errors
    /// Propagates a fatal receive error; malformed/unexpected packets
    /// are logged and dropped, per the propagation policy.
    pub async fn run(&self) -> Result<()> {
        self.session.lock().await.begin_connecting();
        tokio::try_join!(self.recv_loop(), self.tick_loop())?;
        Ok(())
    }

    async fn recv_loop(&self) -> Result<()> {
        let mut buf = vec![0u8; netrush_proto::MAX_DATAGRAM];
        loop {
            let n = self.socket.recv(&mut buf).await.context("recv failed")?;
            self.handle_datagram(&buf[..n]).await;
        }
    }

    async fn handle_datagram(&self, bytes: &[u8]) {
        let packet = match wire::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(?err, "dropping packet");
                return;
            }
        };
        let Ok(raw_body) = payload::decode_body(&packet.payload) else {
            debug!("bad compression flag");
            return;
        };

        match packet.header.msg_type {
            MsgType::InitAck => {
                let Ok(ack) = InitAckPayload::decode(&raw_body) else {
                    debug!("malformed init_ack");
                    return;
                };
                self.session.lock().await.on_init_ack(ack.client_id);
            }
            MsgType::Ack => {
                let Ok(ack) = AckPayload::decode(&raw_body) else {
                    debug!("malformed ack");
                    return;
                };
                if let Err(err) = self
                    .session
                    .lock()
                    .await
                    .on_ack(ack.cell_index, ack.owner, now_ms())
                {
                    warn!(?err, "ack application failed");
                }
            }
            MsgType::Snapshot => {
                let Ok(body) = netrush_proto::payload::SnapshotBody::decode(&raw_body) else {
                    debug!("malformed snapshot");
                    return;
                };
                let outcome = self.session.lock().await.on_snapshot(
                    packet.header.snapshot_id,
                    &body,
                    now_ms(),
                );
                if let Err(err) = outcome {
                    debug!(?err, "snapshot dropped");
                }
            }
            MsgType::GameOver => {
                let Ok(game_over) = GameOverPayload::decode(&raw_body) else {
                    debug!("malformed game_over");
                    return;
                };
                self.session.lock().await.on_game_over(
                    packet.header.snapshot_id,
                    game_over.winners,
                    &game_over.final_grid,
                    now_ms(),
                );
            }
            other => debug!(?other, "unexpected message type at client"),
        }
    }

    async fn tick_loop(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        let mut last_heartbeat = Instant::now();
        loop {
            ticker.tick().await;
            let now = Instant::now();

            let state = self.session.lock().await.state();
            match state {
                state::ClientState::Disconnected | state::ClientState::Connecting => {
                    if now.duration_since(last_heartbeat) >= self.config.init_retry_interval {
                        last_heartbeat = now;
                        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                        let _ = self.send_packet(MsgType::Init, seq, &[]).await;
                    }
                }
                state::ClientState::Playing => {
                    if now.duration_since(last_heartbeat) >= self.config.heartbeat_interval {
                        last_heartbeat = now;
                        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                        let _ = self.send_packet(MsgType::Init, seq, &[]).await;
                    }
                    let outcome = self.session.lock().await.tick(now);
                    for (seq_num, row, col) in outcome.retransmits {
                        let client_id = self.session.lock().await.client_id();
                        if let Some(client_id) = client_id {
                            let _ = self.send_event(seq_num, row, col, client_id).await;
                        }
                    }
                    for (seq_num, row, col) in outcome.abandoned {
                        warn!(seq_num, row, col, "claim abandoned: retry budget exhausted");
                    }
                }
                state::ClientState::GameOver => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reassembler::NullRenderPort;

    async fn connected_client() -> (SessionClient<NullRenderPort>, UdpSocket) {
        let server = UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind fake server");
        let server_addr = server.local_addr().expect("local addr");
        let client = SessionClient::connect(server_addr, 4, ClientConfig::default(), NullRenderPort)
            .await
            .expect("connect");
        (client, server)
    }

    #[tokio::test]
    async fn init_ack_transitions_session_to_playing() {
        let (client, server) = connected_client().await;
        let client_addr = client.socket.local_addr().expect("client addr");

        let header = wire::Header {
            msg_type: MsgType::InitAck,
            snapshot_id: 0,
            seq_num: 0,
            ts_ms: 0,
        };
        let body = InitAckPayload { client_id: 5 }.encode();
        let bytes = wire::encode(&header, &body).expect("encode init_ack");
        server.send_to(&bytes, client_addr).await.expect("send");

        let mut buf = vec![0u8; netrush_proto::MAX_DATAGRAM];
        let n = client.socket.recv(&mut buf).await.expect("recv");
        client.handle_datagram(&buf[..n]).await;

        assert_eq!(client.state().await, state::ClientState::Playing);
    }

    #[tokio::test]
    async fn ack_settles_pending_claim() {
        let (client, server) = connected_client().await;
        let client_addr = client.socket.local_addr().expect("client addr");

        {
            let mut guard = client.session.lock().await;
            guard.on_init_ack(5);
            guard.send_claim(1, 1, Instant::now());
        }
        assert!(client.session.lock().await.is_pending(1, 1));

        let ack = AckPayload {
            cell_index: 5, // row 1, col 1, grid side 4: 1*4 + 1
            owner: 5,
        }
        .encode();
        let header = wire::Header {
            msg_type: MsgType::Ack,
            snapshot_id: 0,
            seq_num: 0,
            ts_ms: 0,
        };
        let bytes = wire::encode(&header, &ack).expect("encode ack");
        server.send_to(&bytes, client_addr).await.expect("send");

        let mut buf = vec![0u8; netrush_proto::MAX_DATAGRAM];
        let n = client.socket.recv(&mut buf).await.expect("recv");
        client.handle_datagram(&buf[..n]).await;

        let guard = client.session.lock().await;
        assert!(!guard.is_pending(1, 1));
        assert_eq!(guard.owner(1, 1), 5);
    }
}
