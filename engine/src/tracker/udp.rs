use std::{net::{Ipv4Addr, SocketAddr, ToSocketAddrs}};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{AnnounceParams, Event, Result, TrackerError};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_ERROR: i32 = 3;

// Per-step timeout for each of CONNECT and ANNOUNCE (SPEC_FULL.md 4.2/5).
const STEP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct AnnounceResponse {
    pub peers: Vec<SocketAddr>,
    pub interval: Option<u32>,
}

// Runs the two-step BEP-15 exchange: CONNECT (unless a connection id is
// already cached for this tracker) then ANNOUNCE. `conn_id` is threaded in
// and updated by the caller (`Tracker::send_announce`) so that repeat
// announces to the same tracker can skip the CONNECT round trip - though
// per spec every connection id is treated as single-use here for simplicity
// and safety against stale ids.
pub async fn announce(url: &Url, params: &AnnounceParams, conn_id: &mut Option<i64>) -> Result<AnnounceResponse> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    let host = url.host_str().ok_or(TrackerError::InvalidUrl)?;
    let port = url.port().ok_or(TrackerError::InvalidUrl)?;
    let addr = (host, port).to_socket_addrs()?.next().ok_or(TrackerError::InvalidUrl)?;
    time::timeout(STEP_TIMEOUT, socket.connect(addr)).await??;

    let id = connect(&socket).await?;
    *conn_id = Some(id);

    time::timeout(STEP_TIMEOUT, send_announce(&socket, id, params)).await?
}

async fn connect(socket: &UdpSocket) -> Result<i64> {
    let trans_id: i32 = rand::random();

    let mut buf = BytesMut::with_capacity(16);
    buf.put_i64(PROTOCOL_ID);
    buf.put_i32(ACTION_CONNECT);
    buf.put_i32(trans_id);
    time::timeout(STEP_TIMEOUT, socket.send(&buf)).await??;

    let mut resp_buf = [0u8; 16];
    let n = time::timeout(STEP_TIMEOUT, socket.recv(&mut resp_buf)).await??;
    if n < 16 {
        return Err(TrackerError::ResponseError("connect response too short".to_string()));
    }
    let mut resp = &resp_buf[..];
    let action = resp.get_i32();
    if resp.get_i32() != trans_id {
        return Err(TrackerError::ResponseError("transaction id mismatch".to_string()));
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::ResponseError(format!("expected connect action, got {action}")));
    }
    Ok(resp.get_i64())
}

async fn send_announce(socket: &UdpSocket, conn_id: i64, params: &AnnounceParams) -> Result<AnnounceResponse> {
    let trans_id: i32 = rand::random();

    let mut buf = BytesMut::with_capacity(98);
    buf.put_i64(conn_id);
    buf.put_i32(ACTION_ANNOUNCE);
    buf.put_i32(trans_id);
    buf.put(&params.info_hash[..]);
    buf.put(&params.peer_id[..]);
    buf.put_i64(params.downloaded as i64);
    buf.put_i64(params.left as i64);
    buf.put_i64(params.uploaded as i64);
    buf.put_i32(match params.event {
        Some(Event::Started) => 2,
        Some(Event::Completed) => 1,
        Some(Event::Stopped) => 3,
        None => 0,
    });
    buf.put_i32(0); // IP address, default = 0.
    buf.put_i32(rand::random()); // Key, random.
    buf.put_i32(match params.num_want {
        Some(num_want) => num_want as i32,
        None => -1,
    });
    buf.put_u16(params.port);
    debug_assert_eq!(buf.len(), 98);

    socket.send(&buf).await?;

    let mut resp_buf = [0u8; 2048];
    let n = socket.recv(&mut resp_buf).await?;
    if n < 8 {
        return Err(TrackerError::ResponseError("announce response too short".to_string()));
    }
    let mut resp = &resp_buf[..n];
    let action = resp.get_i32();
    let recv_trans_id = resp.get_i32();
    if recv_trans_id != trans_id {
        return Err(TrackerError::ResponseError("transaction id mismatch".to_string()));
    }

    if action == ACTION_ERROR {
        let msg = String::from_utf8_lossy(resp).into_owned();
        return Err(TrackerError::ResponseError(msg));
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::ResponseError(format!("unexpected action {action}")));
    }
    if resp.remaining() < 12 {
        return Err(TrackerError::ResponseError("announce response missing body".to_string()));
    }
    let interval = resp.get_i32() as u32;
    let _leechers = resp.get_i32();
    let _seeders = resp.get_i32();

    let num_peers = resp.remaining() / 6;
    let mut peers = Vec::with_capacity(num_peers);
    for _ in 0..num_peers {
        let ip = resp.get_u32();
        let port = resp.get_u16();
        peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
    }

    Ok(AnnounceResponse { peers, interval: Some(interval) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_response_with_wrong_transaction_id_is_rejected() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let url = Url::parse(&format!("udp://{server_addr}/announce")).unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let mut resp = BytesMut::with_capacity(16);
            resp.put_i32(ACTION_CONNECT);
            resp.put_i32(0xdead_beefu32 as i32);
            resp.put_i64(42);
            server.send_to(&resp, from).await.unwrap();
        });

        let params = AnnounceParams { info_hash: [1; 20], peer_id: [2; 20], port: 6881, ..Default::default() };
        let mut conn_id = None;
        let result = announce(&url, &params, &mut conn_id).await;
        assert!(result.is_err());
        responder.await.unwrap();
    }
}
