use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use log::{debug, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use crate::domain::{BrokerError, Result};
use crate::infrastructure::protocol::{MessageHeader, HEADER_SIZE};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Size of the chunks an outbound body is streamed in.
const SEND_CHUNK_SIZE: usize = 4096;

/// The live stream handed to a message handler, capped at the envelope's
/// body size. The handler must consume exactly `body_size` bytes before
/// returning: the cap prevents overrunning into the next header, but an
/// under-read leaves body bytes in the stream and desynchronizes the
/// framing. That discipline is the protocol contract, not something the
/// broker detects or repairs.
pub type BodyReader<'a> = tokio::io::Take<&'a mut OwnedReadHalf>;

/// Lifecycle and message callbacks for one connection. Errors returned from
/// any handler are logged and discarded at the dispatch boundary; a
/// misbehaving handler cannot take down the read loop.
#[async_trait]
pub trait ClientEvents: Send + Sync {
    async fn on_started(&self, _client: &Arc<SocketClient>) -> Result<()> {
        Ok(())
    }

    async fn on_stopped(&self, _client: &Arc<SocketClient>) -> Result<()> {
        Ok(())
    }

    async fn on_message(
        &self,
        client: &Arc<SocketClient>,
        meta: &str,
        body_size: u64,
        body: &mut BodyReader<'_>,
    ) -> Result<()>;
}

/// One TCP connection: a dedicated read loop that decodes envelopes and
/// dispatches them, plus an internally serialized send path.
pub struct SocketClient {
    id: u64,
    peer_addr: SocketAddr,
    reader: StdMutex<Option<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    running: AtomicBool,
    shutdown: Notify,
}

impl SocketClient {
    /// Client-side constructor: dials the broker.
    pub async fn connect(host: &str, port: u16) -> Result<Arc<Self>> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::from_stream(stream)
    }

    /// Server-side constructor: wraps an accepted connection.
    pub fn from_stream(stream: TcpStream) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            reader: StdMutex::new(Some(read_half)),
            writer: Mutex::new(write_half),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Spawns the read loop. A second call is a no-op.
    pub fn start(self: &Arc<Self>, events: Arc<dyn ClientEvents>) {
        let Some(reader) = take(&self.reader) else {
            warn!("client {}: read loop already started", self.id);
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        tokio::spawn(read_loop(Arc::clone(self), reader, events));
    }

    /// Frames and writes one envelope. Safe to call concurrently with the
    /// read loop and with other sends; writes are serialized internally and
    /// the body goes out in fixed-size chunks.
    pub async fn send(&self, meta: &str, body: &[u8]) -> Result<()> {
        if meta.len() > u16::MAX as usize {
            return Err(BrokerError::InvalidHeader(format!(
                "metadata of {} bytes exceeds the u16 envelope field",
                meta.len()
            )));
        }
        let header = MessageHeader::new(meta.len() as u16, body.len() as u64);
        let mut frame = BytesMut::with_capacity(HEADER_SIZE + meta.len());
        header.encode(&mut frame);
        frame.put_slice(meta.as_bytes());

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        for chunk in body.chunks(SEND_CHUNK_SIZE) {
            writer.write_all(chunk).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Stops the read loop and shuts the connection down. Idempotent. The
    /// loop is signalled rather than aborted, so it exits through its normal
    /// path and the stop callback still runs.
    pub async fn dispose(&self) {
        self.running.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a loop between header reads still
        // sees the signal on its next wait
        self.shutdown.notify_one();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("client {}: shutdown: {e}", self.id);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn read_loop(
    client: Arc<SocketClient>,
    mut reader: OwnedReadHalf,
    events: Arc<dyn ClientEvents>,
) {
    if let Err(e) = events.on_started(&client).await {
        warn!("client {}: start handler failed: {e}", client.id);
    }

    while client.is_running() {
        let mut header_buf = [0u8; HEADER_SIZE];
        let read = tokio::select! {
            read = reader.read_exact(&mut header_buf) => read,
            _ = client.shutdown.notified() => break,
        };
        match read {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("client {}: peer closed the connection", client.id);
                break;
            }
            Err(e) => {
                warn!("client {}: header read failed: {e}", client.id);
                break;
            }
        }

        let header = match MessageHeader::decode(&mut &header_buf[..]) {
            Ok(header) => header,
            Err(e) => {
                warn!("client {}: bad envelope header: {e}", client.id);
                break;
            }
        };

        let mut meta_buf = vec![0u8; header.meta_size as usize];
        if let Err(e) = reader.read_exact(&mut meta_buf).await {
            warn!("client {}: metadata read failed: {e}", client.id);
            break;
        }
        let meta = match String::from_utf8(meta_buf) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("client {}: metadata is not UTF-8: {e}", client.id);
                break;
            }
        };

        // The body is not pre-read; the handler consumes it from the live
        // stream.
        let mut body = (&mut reader).take(header.body_size);
        if let Err(e) = events
            .on_message(&client, &meta, header.body_size, &mut body)
            .await
        {
            warn!("client {}: message handler failed: {e}", client.id);
        }
    }

    client.running.store(false, Ordering::SeqCst);
    if let Err(e) = events.on_stopped(&client).await {
        warn!("client {}: stop handler failed: {e}", client.id);
    }
}

fn take<T>(slot: &StdMutex<Option<T>>) -> Option<T> {
    lock(slot).take()
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
