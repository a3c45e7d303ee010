// dcm is an open source tool for distributed refinement of graph clusterings.
// Copyright (C) 2024 the dcm authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Framed request/reply exchanges between workers and the coordinator.
//!
//! One TCP connection carries exactly one exchange: a worker dials in,
//! writes a length-prefixed bincode [`Request`], reads one [`Reply`], and
//! the connection is done. Workers never listen and the coordinator never
//! dials out, so there is no connection state worth keeping; a fresh dial
//! per message also means a restarted coordinator is picked up without any
//! reconnect bookkeeping on the worker side.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use super::{backoff::Backoff, Reply, Request};

/// Batches are cluster-id lists and reports are a handful of counters; a
/// frame anywhere near this size means a corrupted or foreign peer.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const DIAL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_RETRY_START: Duration = Duration::from_millis(250);
const DIAL_RETRY_CAP: Duration = Duration::from_secs(10);
/// A coordinator missing for this long is not coming back on its own.
const DIAL_GIVE_UP: Duration = Duration::from_secs(600);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error during a protocol exchange")]
    Io(#[from] std::io::Error),

    #[error("gave up dialing the coordinator at {addr}")]
    CoordinatorUnreachable { addr: SocketAddr },

    #[error("no reply within {0:?}")]
    ReplyTimeout(Duration),

    #[error("frame of {got} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { got: usize, limit: usize },

    #[error("malformed frame")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("failed to encode message")]
    Encode(#[from] bincode::error::EncodeError),
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<(), Error> {
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;

    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, Error> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;

    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge {
            got: len,
            limit: MAX_FRAME_BYTES,
        });
    }

    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;

    Ok(body)
}

async fn exchange(mut stream: TcpStream, request: &Request) -> Result<Reply, Error> {
    let body = bincode::encode_to_vec(request, bincode::config::standard())?;
    write_frame(&mut stream, &body).await?;

    let body = read_frame(&mut stream).await?;
    let (reply, _) = bincode::decode_from_slice(&body, bincode::config::standard())?;

    Ok(reply)
}

/// The worker-side handle to the coordinator.
pub struct CoordinatorClient {
    addr: SocketAddr,
    salt: u64,
}

impl CoordinatorClient {
    /// `salt` staggers dial retries; pass the worker's rank so ranks
    /// launched in the same instant do not all redial together.
    pub fn new(addr: SocketAddr, salt: u64) -> Self {
        Self { addr, salt }
    }

    pub async fn call(&self, request: &Request) -> Result<Reply, Error> {
        let stream = self.dial().await?;

        match tokio::time::timeout(EXCHANGE_TIMEOUT, exchange(stream, request)).await {
            Ok(reply) => reply,
            Err(_) => Err(Error::ReplyTimeout(EXCHANGE_TIMEOUT)),
        }
    }

    /// Keep dialing until the coordinator answers. It may simply not be up
    /// yet (workers and coordinator start concurrently) or be restarting;
    /// only after `DIAL_GIVE_UP` of accumulated waiting is it declared gone.
    async fn dial(&self) -> Result<TcpStream, Error> {
        let mut backoff = Backoff::salted(DIAL_RETRY_START, DIAL_RETRY_CAP, self.salt);
        let mut waited = Duration::ZERO;

        loop {
            match tokio::time::timeout(DIAL_ATTEMPT_TIMEOUT, TcpStream::connect(self.addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    tracing::debug!(addr = %self.addr, error = %e, "dial failed");
                }
                Err(_) => {
                    tracing::debug!(addr = %self.addr, "dial attempt timed out");
                }
            }

            if waited >= DIAL_GIVE_UP {
                return Err(Error::CoordinatorUnreachable { addr: self.addr });
            }

            let delay = backoff.delay();
            waited += delay;
            tokio::time::sleep(delay).await;
        }
    }
}

/// The coordinator's listening end.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.inner.local_addr()?)
    }

    pub async fn accept(&self) -> Result<Conversation, Error> {
        let (stream, peer) = self.inner.accept().await?;
        tracing::debug!(?peer, "worker connected");

        Ok(Conversation { stream })
    }
}

/// One request/reply exchange with a worker. Replying consumes the
/// conversation, so a request cannot be answered twice or silently left
/// unanswered.
pub struct Conversation {
    stream: TcpStream,
}

impl Conversation {
    pub async fn receive(&mut self) -> Result<Request, Error> {
        let body = read_frame(&mut self.stream).await?;
        let (request, _) = bincode::decode_from_slice(&body, bincode::config::standard())?;

        Ok(request)
    }

    pub async fn reply(mut self, reply: &Reply) -> Result<(), Error> {
        let body = bincode::encode_to_vec(reply, bincode::config::standard())?;
        write_frame(&mut self.stream, &body).await
    }
}
