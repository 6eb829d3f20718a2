use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{sync::mpsc, net::TcpStream, time};
use tokio_util::codec::Framed;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use crate::{
    block::{BlockData, BlockInfo},
    scheduler::VerifyOutcome,
    swarm::SwarmCommand,
    torrent::TorrentContext,
    Bitfield,
};
use super::{*, message::*, handshake::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Time allowed for an outbound TCP connect attempt (SPEC_FULL.md 5).
const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(8);
// Time allowed to receive the peer's handshake.
const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);
// General no-bytes-either-direction timeout (SPEC_FULL.md 5).
const INACTIVITY_TIMEOUT: time::Duration = time::Duration::from_secs(150);
// A session with nothing of interest either way, on both sides, for this
// long is dropped early rather than waiting out the full inactivity window
// (SPEC_FULL.md 4.3).
const MUTUAL_DISINTEREST_TIMEOUT: time::Duration = time::Duration::from_secs(30);
// Send a keep-alive if we haven't sent anything else in this long.
const KEEP_ALIVE_INTERVAL: time::Duration = time::Duration::from_secs(120);

#[derive(Debug)]
pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Context is a read only state accessible by all peers.
    torrent_ctx: Arc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Internal send channel, handed out to callers that need to signal us.
    peer_tx: PeerTx,

    // Pending block requests from client to peer.
    requests_out: HashSet<BlockInfo>,

    // Bitfield of pieces the peer currently has.
    bitfield: Bitfield,

    state: SessionState,

    // Time elapsed since the last message sent, for the keep-alive timer.
    last_sent: Instant,

    // Time elapsed since the last message received, for the inactivity timer.
    last_recv: Instant,

}

impl PeerSession {

    pub fn new(address: SocketAddr, torrent_ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, torrent_ctx.info.num_pieces as usize);

        (
            PeerSession {
                address,
                torrent_ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                bitfield,
                state: SessionState::default(),
                requests_out: HashSet::new(),
                last_sent: Instant::now(),
                last_recv: Instant::now(),
            },
            peer_tx,
        )
    }

    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let inbound = inbound_stream.is_some();
        let mut socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        self.exchange_handshake(&mut socket, inbound).await?;

        let socket = Framed::new(socket.into_inner(), MessageCodec);
        self.run(socket).await
    }

    pub async fn disconnect(&mut self) {
        self.state.update(|state| *state = SessionState::default());
        self.torrent_ctx.swarm_tx.send(SwarmCommand::PeerState {
            address: self.address,
            state: self.state,
        }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let handshake = Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.peer_id);

        if !inbound {
            tracing::info!("send handshake");
            socket.send(handshake).await?;
        }

        tracing::trace!("waiting for handshake");
        let recvd = time::timeout(HANDSHAKE_TIMEOUT, socket.next())
            .await
            .map_err(|_| PeerError::Timeout)?;

        if let Some(Ok(handshake)) = recvd {
            tracing::info!("read: handshake");

            if handshake.protocol != PROTOCOL {
                return Err(PeerError::IncorrectProtocol);
            }
            if handshake.info_hash != self.torrent_ctx.info_hash {
                return Err(PeerError::IncorrectInfoHash);
            }

            if inbound {
                tracing::info!("send handshake");
                socket.send(Handshake::new(self.torrent_ctx.info_hash, self.torrent_ctx.peer_id)).await?;
            }

            tracing::info!("handshake successful, peer connected");
            Ok(())

        } else {
            Err(PeerError::NoHandshake)
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.connect_time = Some(Instant::now());
        self.state.update(|state| state.conn_state = ConnState::Introducing);
        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(time::Duration::from_secs(1));

        loop { tokio::select! {

            // Message from peer.
            Some(Ok(msg)) = stream.next() => self.handle_msg(&mut sink, msg).await?,

            // Command from the swarm that owns us.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,

                    PeerCommand::Shutdown => {
                        tracing::info!("session shutdown");
                        break;
                    },

                }
            }

            t = ticker.tick() => self.tick(&mut sink, t.into_std()).await?,

            _ = self.torrent_ctx.cancel.cancelled() => {
                tracing::info!("torrent cancelled, tearing down session");
                break;
            }

        }}

        Ok(())
    }

    // Logs a message and sends to peer.
    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("send: {}", msg);
        self.last_sent = Instant::now();
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::info!("read: {}", msg);
        self.last_recv = Instant::now();

        match msg {

            // Bitfield can only be sent directly after handshake.
            Message::Bitfield(bitfiled) => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_bitfield(sink, bitfiled).await?;
                } else {
                    tracing::error!("unexpected bitfield");
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    self.free_requests_out().await;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.peer_interested = true;
                    self.send_message(sink, Message::Unchoke).await?;
                    self.state.choked = false;
                }
            },

            Message::NotInterested => self.state.peer_interested = false,

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests(sink).await?;
            },

            Message::Request(request) => self.handle_request(sink, request).await?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            // Selective-download port extension is out of scope; accept and ignore.
            Message::Port { port: _ } => {},

            Message::Cancel(block_info) => self.handle_cancel(block_info).await?,

        }

        if self.state.conn_state == ConnState::Introducing {

            if self.torrent_ctx.scheduler.piece_picker.read().await.own_bitfield().not_any()
            && self.bitfield.not_any()
            {
                tracing::warn!("no pieces in connection");
                self.peer_tx.send(PeerCommand::Shutdown).map_err(|_| PeerError::Timeout)?;
                return Ok(())
            }

            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), self.torrent_ctx.info.num_pieces);
        bitfield.resize(self.torrent_ctx.info.num_pieces as usize, false);
        let interested = self.torrent_ctx.scheduler.piece_picker.write().await.bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones() as usize);
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if idx >= self.torrent_ctx.info.num_pieces {
            tracing::error!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self
            .torrent_ctx
            .scheduler
            .piece_picker
            .write()
            .await
            .increment_piece(idx as usize);

        self.update_interest(sink, interested).await
    }

    async fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let info = block.info();
        if !self.requests_out.remove(&info) {
            tracing::warn!("unexpected block: {:?}", &info);
            return Ok(());
        }
        self.state.update(|state| state.throughput.down += info.len as u64);

        match self.torrent_ctx.scheduler.receive_block(info, &block.data).await {
            Some(VerifyOutcome::Valid { idx, data }) => {
                let disk = self.torrent_ctx.disk.clone();
                let scheduler = self.torrent_ctx.scheduler.clone();
                let swarm_tx = self.torrent_ctx.swarm_tx.clone();
                let ctx = self.torrent_ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = disk.write_piece(idx, Arc::new(data)).await {
                        tracing::error!("failed to write piece {}: {}", idx, e);
                        scheduler.release_failed_piece(idx).await;
                        crate::torrent::record_disk_failure(&ctx);
                        return;
                    }
                    crate::torrent::reset_disk_failures(&ctx);
                    scheduler.mark_written(idx).await;
                    swarm_tx.send(SwarmCommand::PieceCompleted(idx)).ok();
                });
                Ok(())
            }
            Some(VerifyOutcome::Invalid { idx }) => {
                tracing::warn!("piece {} failed hash verification", idx);
                self.torrent_ctx.scheduler.release_failed_piece(idx).await;
                Ok(())
            }
            // Still incomplete, or a duplicate block within a partial piece.
            None => Ok(()),
        }
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockInfo) -> Result<()> {

        if self.state.choked {
            tracing::error!("sending requests whilst choked");
            return Err(PeerError::InvalidMessage);
        }
        if !request.is_valid(&self.torrent_ctx.info) {
            tracing::error!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }

        let piece = self
            .torrent_ctx
            .disk
            .read_piece(request.piece_idx)
            .await
            .map_err(|_| PeerError::InvalidMessage)?;
        let data = piece[request.offset..request.offset + request.len].to_vec();

        self.state.update(|state| state.throughput.up += request.len as u64);
        self.send_message(sink, Message::Block(BlockData {
            piece_idx: request.piece_idx,
            offset: request.offset,
            data,
        })).await
    }

    async fn handle_cancel(&mut self, block_info: BlockInfo) -> Result<()> {
        if !block_info.is_valid(&self.torrent_ctx.info) {
            tracing::warn!("invalid cancel: {:?}", block_info);
            return Err(PeerError::InvalidMessage);
        }
        // Served requests are answered inline rather than queued, so there's
        // nothing left in flight to actually cancel by the time this arrives.
        Ok(())
    }

    // When a piece is written to disk:
    // - Send a have message if the peer doesn't have it.
    // - Cancel any requests for the piece.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        if !self.bitfield[idx] {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        } else {
            for block in self.requests_out.iter() {
                if block.piece_idx == idx {
                    sink.send(Message::Cancel(*block)).await?;
                }
            }
        }

        Ok(())
    }

    // Queue requests up to a certain target queue length.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.interested {
            tracing::warn!("attempted to make requests whilst not interested or choked by peer");
            return Ok(())
        }

        let requests = self
            .torrent_ctx.scheduler
            .pick_blocks(&self.requests_out, 20, &self.bitfield)
            .await;

        for block in requests {
            tracing::info!("send request: {:?}", block);
            self.requests_out.insert(block);
            self.send_message(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    // Free all requested blocks, making them available for other peers.
    async fn free_requests_out(&mut self) {
        tracing::info!("freeing requested blocks");
        let partial_pieces = self.torrent_ctx.scheduler.partial_pieces.read().await;
        for request in self.requests_out.drain() {
            if let Some(partial_piece) = partial_pieces.get(&request.piece_idx) {
                partial_piece.write().await.free_block(&request);
                tracing::trace!("freed block request: {:?}", request);
            }
        }
    }

    // If we have BECOME interested, send a message to indicate this.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.interested && interested {
            self.state.interested = true;
            self.send_message(sink, Message::Interested).await?;
        } else if self.state.interested && !interested {
            self.state.interested = false;
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, time: Instant) -> Result<()> {

        // Also sweeps this torrent's timed-out block requests free, so a
        // piece stuck entirely on one stalled peer still makes progress.
        if self.state.interested && !self.state.peer_choking {
            self.make_requests(sink).await?;
        }

        if !self.state.interested
        && !self.state.peer_interested
        && time.saturating_duration_since(self.state.connect_time.unwrap_or(time))
            >= MUTUAL_DISINTEREST_TIMEOUT
        {
            tracing::warn!("disconnecting mutually uninterested peer");
            return Err(PeerError::Timeout)
        }

        if time.saturating_duration_since(self.last_sent) >= KEEP_ALIVE_INTERVAL {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        if time.saturating_duration_since(self.last_sent) >= INACTIVITY_TIMEOUT
        && time.saturating_duration_since(self.last_recv) >= INACTIVITY_TIMEOUT
        {
            tracing::warn!("disconnecting peer due to inactivity");
            return Err(PeerError::Timeout)
        }

        if self.state.changed {
            self.torrent_ctx.swarm_tx.send(SwarmCommand::PeerState {
                address: self.address,
                state: self.state,
            }).map_err(|_| PeerError::Timeout)?;
        }
        self.state.tick();

        Ok(())
    }
}
