use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::ShardConfig;
use crate::connection::{self, Connection};
use crate::error::Error;
use crate::limiter::RateLimiter;
use crate::metrics;
use crate::packet::{
    close_code, Hello, OpCode, Ready, ReceivePacket, Resume, Resumed, SendPacket, EVENT_READY,
    EVENT_RESUMED,
};
use crate::session::SessionStore;

/// One gateway shard: a resumable, heartbeat-driven client session.
///
/// Constructed inert from a validated [`ShardConfig`]; [`Shard::open`] runs
/// the connect/reconnect loop until a fatal close, a configuration error, or
/// cancellation. Clones share the same shard (handles for the heartbeat task
/// and for callers that want [`Shard::send`] or [`Shard::ping`]).
pub struct Shard<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Shard<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S> {
    config: ShardConfig<S>,
    shard_index: u32,
    /// Metric/trace label; formatted once.
    label: String,
    send_limiter: RateLimiter,
    /// Preferred endpoint for the rest of this session, from `Ready`.
    resume_url: RwLock<String>,
    /// Present only while a socket is open.
    conn: RwLock<Option<Arc<Connection>>>,
    /// Set just before each outbound heartbeat, consumed by the ACK handler.
    last_heartbeat: Mutex<Option<Instant>>,
    /// Most recent heartbeat round-trip time.
    ping: RwLock<Duration>,
    /// Single-slot ACK signal from the read loop to the heartbeat task.
    acks: Notify,
}

impl<S: SessionStore> Shard<S> {
    /// Create a shard from a validated configuration.
    pub fn new(config: ShardConfig<S>) -> Self {
        let shard_index = config.identify.shard[0];
        Self {
            inner: Arc::new(Inner {
                label: shard_index.to_string(),
                shard_index,
                send_limiter: RateLimiter::default_send(),
                resume_url: RwLock::new(String::new()),
                conn: RwLock::new(None),
                last_heartbeat: Mutex::new(None),
                ping: RwLock::new(Duration::ZERO),
                acks: Notify::new(),
                config,
            }),
        }
    }

    /// This shard's index within the fleet.
    pub fn shard_index(&self) -> u32 {
        self.inner.shard_index
    }

    /// Most recent heartbeat round-trip time (zero until the first ACK).
    pub fn ping(&self) -> Duration {
        *self.inner.ping.read()
    }

    /// Run the shard until a non-recoverable error or cancellation.
    ///
    /// Each recoverable failure (transport errors, protocol errors, every
    /// close code outside the fatal set) dials again immediately; backoff
    /// across attempts is the supervisor's concern. The session store is
    /// never cleared here, so the next attempt resumes where it left off.
    pub async fn open(&self, cancel: CancellationToken) -> Result<(), Error> {
        loop {
            let err = match self.connect(&cancel).await {
                // A clean attempt end is treated like any recoverable close.
                Ok(()) => continue,
                Err(err) => err,
            };
            if err.is_recoverable() {
                info!("[SHARD-{}] recoverable close: {err}", self.inner.shard_index);
                continue;
            }
            info!("[SHARD-{}] unrecoverable close: {err}", self.inner.shard_index);
            return Err(err);
        }
    }

    /// Cleanly close the current connection.
    ///
    /// The read loop observes the close as recoverable, so an `open` still
    /// running will reconnect; pair this with cancellation to stop for good.
    pub async fn close(&self) -> Result<(), Error> {
        let conn = self.current_connection()?;
        conn.close_with_code(close_code::NORMAL).await?;
        info!("[SHARD-{}] cleanly closed connection", self.inner.shard_index);
        Ok(())
    }

    /// Send an arbitrary packet on the live connection, subject to the same
    /// rate limit and write serialization as internal sends.
    pub async fn send<T: Serialize>(&self, op: OpCode, data: &T) -> Result<(), Error> {
        let conn = self.current_connection()?;
        self.send_packet(&conn, op, data).await
    }

    fn current_connection(&self) -> Result<Arc<Connection>, Error> {
        self.inner.conn.read().clone().ok_or(Error::NotConnected)
    }

    /// One connection attempt: dial, handshake, run until the first error.
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let url = self.compose_url()?;
        info!("[SHARD-{}] connecting to {url}", self.inner.shard_index);

        let conn = Arc::new(
            connection::connect(
                &url,
                self.inner.config.connect_timeout,
                self.inner.config.compression,
            )
            .await?,
        );
        *self.inner.conn.write() = Some(conn.clone());
        let result = self.run_session(&conn, cancel).await;
        *self.inner.conn.write() = None;
        result
    }

    /// Drive one established connection: Hello, heartbeat task, identify or
    /// resume, then the read loop. The first error from any side ends the
    /// attempt.
    async fn run_session(
        &self,
        conn: &Arc<Connection>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let first = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            packet = self.read_packet(conn) => packet?,
        };
        if first.op != OpCode::Hello {
            return Err(Error::Protocol(format!(
                "expected HELLO as the first packet, got op {}",
                first.op
            )));
        }
        let hello: Hello = first.decode()?;
        if hello.heartbeat_interval == 0 {
            return Err(Error::Protocol(
                "HELLO carried a zero heartbeat interval".to_owned(),
            ));
        }
        self.log_trace(&hello.trace);

        // Heartbeats live exactly as long as this attempt.
        let attempt = cancel.child_token();
        let _attempt_scope = attempt.clone().drop_guard();
        let interval = Duration::from_millis(hello.heartbeat_interval);
        tokio::spawn(run_heartbeat(self.clone(), conn.clone(), interval, attempt));

        let shard_index = self.inner.shard_index;
        let seq = match self.inner.config.store.get_seq(shard_index).await {
            Ok(seq) => seq,
            Err(err) => {
                warn!("[SHARD-{shard_index}] unable to read sequence for login: {err}");
                0
            }
        };
        let session_id = match self.inner.config.store.get_session(shard_index).await {
            Ok(session_id) => session_id,
            Err(err) => {
                warn!("[SHARD-{shard_index}] unable to read session ID for login: {err}");
                String::new()
            }
        };
        debug!("[SHARD-{shard_index}] session {session_id:?}, seq {seq}");

        // Identify/resume runs concurrently so the read loop can consume the
        // next inbound packet immediately.
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);
        {
            let shard = self.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let result = if session_id.is_empty() && seq == 0 {
                    shard.send_identify(&conn).await
                } else {
                    shard.send_resume(&conn).await
                };
                if let Err(err) = result {
                    let _ = err_tx.send(err).await;
                }
            });
        }

        metrics::shard_connected(&self.inner.label);
        debug!("[SHARD-{shard_index}] beginning normal message consumption");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(Error::Cancelled),
                Some(err) = err_rx.recv() => break Err(err),
                packet = self.read_packet(conn) => {
                    let outcome = match packet {
                        Ok(packet) => self.handle_packet(conn, packet).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = outcome {
                        break Err(err);
                    }
                }
            }
        };

        metrics::shard_disconnected(&self.inner.label);
        result
    }

    /// Read and decode one envelope, blank `t` for non-dispatch packets,
    /// observe it, and hand it to the user callback.
    async fn read_packet(&self, conn: &Connection) -> Result<ReceivePacket, Error> {
        let payload = conn.read().await?;
        let mut packet: ReceivePacket = serde_json::from_slice(&payload)?;

        // `t` from the wire is meaningful only on dispatches.
        if packet.op != OpCode::Dispatch {
            packet.t = None;
        }

        trace!(
            "[SHARD-{}] <- op:{} t:{:?}",
            self.inner.shard_index,
            packet.op,
            packet.event()
        );
        metrics::packet_received(packet.event(), packet.op, &self.inner.label);

        if let Some(on_packet) = &self.inner.config.on_packet {
            on_packet(&packet);
        }
        Ok(packet)
    }

    /// Dispatch one packet by opcode.
    async fn handle_packet(&self, conn: &Arc<Connection>, packet: ReceivePacket) -> Result<(), Error> {
        match packet.op {
            OpCode::Dispatch => self.handle_dispatch(&packet).await,

            OpCode::Heartbeat => self.send_heartbeat(conn).await,

            OpCode::Reconnect => {
                warn!(
                    "[SHARD-{}] server requested reconnect: closing connection",
                    self.inner.shard_index
                );
                conn.close_with_code(close_code::UNKNOWN_ERROR).await
            }

            OpCode::InvalidSession => {
                let resumable: bool = packet.decode()?;
                if resumable {
                    self.send_resume(conn).await?;
                    debug!(
                        "[SHARD-{}] sent resume in response to invalid resumable session",
                        self.inner.shard_index
                    );
                    return Ok(());
                }
                let backoff = Duration::from_secs_f64(1.0 + rand::random::<f64>() * 4.0);
                debug!(
                    "[SHARD-{}] session is not resumable, identifying in {backoff:?}",
                    self.inner.shard_index
                );
                tokio::time::sleep(backoff).await;
                self.send_identify(conn).await?;
                debug!(
                    "[SHARD-{}] sent identify in response to invalid non-resumable session",
                    self.inner.shard_index
                );
                Ok(())
            }

            OpCode::HeartbeatAck => {
                let sent_at = self.inner.last_heartbeat.lock().take();
                if let Some(sent_at) = sent_at {
                    let rtt = sent_at.elapsed();
                    *self.inner.ping.write() = rtt;
                    metrics::ping_observed(&self.inner.label, rtt);
                    debug!("[SHARD-{}] heartbeat ACK (RTT {rtt:?})", self.inner.shard_index);
                }
                self.inner.acks.notify_one();
                Ok(())
            }

            OpCode::Hello => Err(Error::Protocol(
                "received HELLO after the handshake".to_owned(),
            )),

            OpCode::Identify | OpCode::Resume | OpCode::Unknown(_) => {
                trace!(
                    "[SHARD-{}] ignoring unexpected op {}",
                    self.inner.shard_index,
                    packet.op
                );
                Ok(())
            }
        }
    }

    /// Persist the sequence number, then handle the events the shard itself
    /// cares about. The store write comes first so a crash in between leaves
    /// the store advanced and resume replays from the next sequence.
    async fn handle_dispatch(&self, packet: &ReceivePacket) -> Result<(), Error> {
        let shard_index = self.inner.shard_index;
        if let Some(seq) = packet.s {
            self.inner
                .config
                .store
                .set_seq(shard_index, seq)
                .await
                .map_err(Error::Store)?;
        }

        match packet.event() {
            EVENT_READY => {
                let ready: Ready = packet.decode()?;
                *self.inner.resume_url.write() = ready.resume_gateway_url;
                self.inner
                    .config
                    .store
                    .set_session(shard_index, ready.session_id.clone())
                    .await
                    .map_err(Error::Store)?;
                debug!("[SHARD-{shard_index}] session ID: {}", ready.session_id);
                debug!("[SHARD-{shard_index}] using version {}", ready.version);
                self.log_trace(&ready.trace);
            }
            EVENT_RESUMED => {
                let resumed: Resumed = packet.decode()?;
                self.log_trace(&resumed.trace);
            }
            _ => {}
        }
        Ok(())
    }

    /// Serialize and write one packet: limiter first, then the write lock.
    async fn send_packet<T: Serialize>(
        &self,
        conn: &Connection,
        op: OpCode,
        data: &T,
    ) -> Result<(), Error> {
        let body = serde_json::to_string(&SendPacket { op, d: data })?;
        self.inner.send_limiter.acquire().await;
        trace!("[SHARD-{}] -> op:{op}", self.inner.shard_index);
        conn.write(body).await?;
        metrics::packet_sent(op, &self.inner.label);
        Ok(())
    }

    /// Send an identify. The shared identify limiter is acquired before the
    /// send limiter: queueing for an identify slot must not sit on a send
    /// token.
    async fn send_identify(&self, conn: &Connection) -> Result<(), Error> {
        self.inner.config.identify_limiter.acquire().await;
        self.send_packet(conn, OpCode::Identify, &self.inner.config.identify)
            .await
    }

    /// Send a resume from the store's current `(session_id, seq)`, read at
    /// call time. Store failures here end the attempt.
    async fn send_resume(&self, conn: &Connection) -> Result<(), Error> {
        let shard_index = self.inner.shard_index;
        let session_id = self
            .inner
            .config
            .store
            .get_session(shard_index)
            .await
            .map_err(Error::Store)?;
        let seq = self
            .inner
            .config
            .store
            .get_seq(shard_index)
            .await
            .map_err(Error::Store)?;

        debug!("[SHARD-{shard_index}] attempting to resume session");
        self.send_packet(
            conn,
            OpCode::Resume,
            &Resume {
                token: self.inner.config.identify.token.clone(),
                session_id,
                seq,
            },
        )
        .await
    }

    /// Send a heartbeat carrying the last persisted sequence number.
    async fn send_heartbeat(&self, conn: &Connection) -> Result<(), Error> {
        let seq = self
            .inner
            .config
            .store
            .get_seq(self.inner.shard_index)
            .await
            .map_err(Error::Store)?;
        *self.inner.last_heartbeat.lock() = Some(Instant::now());
        self.send_packet(conn, OpCode::Heartbeat, &seq).await
    }

    /// Compose the dial URL: the resume endpoint once known, the configured
    /// gateway otherwise, with the protocol query parameters appended.
    fn compose_url(&self) -> Result<Url, Error> {
        let resume_url = self.inner.resume_url.read().clone();
        let mut url = if resume_url.is_empty() {
            let base = self
                .inner
                .config
                .gateway_url
                .as_deref()
                .ok_or(Error::MissingGateway)?;
            Url::parse(base).map_err(|source| Error::InvalidGateway {
                url: base.to_owned(),
                source,
            })?
        } else {
            match Url::parse(&resume_url) {
                Ok(url) => url,
                Err(err) => {
                    warn!(
                        "[SHARD-{}] ignoring unparseable resume URL {resume_url:?}: {err}",
                        self.inner.shard_index
                    );
                    let base = self
                        .inner
                        .config
                        .gateway_url
                        .as_deref()
                        .ok_or(Error::MissingGateway)?;
                    Url::parse(base).map_err(|source| Error::InvalidGateway {
                        url: base.to_owned(),
                        source,
                    })?
                }
            }
        };

        url.query_pairs_mut()
            .append_pair("v", &self.inner.config.version.to_string())
            .append_pair("encoding", "json");
        if let Some(compress) = self.inner.config.compression.query_value() {
            url.query_pairs_mut().append_pair("compress", compress);
        }
        Ok(url)
    }

    fn log_trace(&self, trace: &[String]) {
        if !trace.is_empty() {
            debug!("[SHARD-{}] trace: {trace:?}", self.inner.shard_index);
        }
    }
}

/// Heartbeat ticker for one connection attempt.
///
/// Sends a heartbeat every `interval`, starting one interval after Hello. If
/// a tick arrives with the previous heartbeat still unacknowledged, the
/// server is considered gone: close with "session timeout" and let the read
/// loop observe the (recoverable) close. Exits silently on cancellation.
async fn run_heartbeat<S: SessionStore>(
    shard: Shard<S>,
    conn: Arc<Connection>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let shard_index = shard.inner.shard_index;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut acked = true;

    info!("[SHARD-{shard_index}] starting heartbeat at interval {interval:?}");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shard.inner.acks.notified() => acked = true,
            _ = ticker.tick() => {
                if !acked {
                    warn!("[SHARD-{shard_index}] heartbeat not acknowledged: closing connection");
                    let _ = conn.close_with_code(close_code::SESSION_TIMEOUT).await;
                    break;
                }
                trace!("[SHARD-{shard_index}] sending scheduled heartbeat");
                if let Err(err) = shard.send_heartbeat(&conn).await {
                    error!("[SHARD-{shard_index}] error sending scheduled heartbeat: {err}");
                    break;
                }
                acked = false;
            }
        }
    }
    debug!("[SHARD-{shard_index}] stopping heartbeat timer");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::packet::Identify;
    use crate::session::MemoryStore;

    fn shard_with(gateway: Option<&str>, compression: Compression) -> Shard<MemoryStore> {
        let mut builder = ShardConfig::builder(Identify::new("token", [1, 4]), MemoryStore::new())
            .compression(compression);
        if let Some(url) = gateway {
            builder = builder.gateway_url(url);
        }
        Shard::new(builder.build().expect("valid config"))
    }

    #[test]
    fn url_carries_protocol_query_parameters() {
        let shard = shard_with(Some("wss://gateway.example"), Compression::None);
        let url = shard.compose_url().unwrap();
        assert_eq!(url.host_str(), Some("gateway.example"));
        let query: Vec<_> = url.query_pairs().collect();
        assert!(query.contains(&("v".into(), "10".into())));
        assert!(query.contains(&("encoding".into(), "json".into())));
        assert!(!query.iter().any(|(k, _)| k == "compress"));
    }

    #[test]
    fn url_negotiates_installed_codec() {
        let shard = shard_with(Some("wss://gateway.example"), Compression::ZlibStream);
        let url = shard.compose_url().unwrap();
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "compress" && v == "zlib-stream"));
    }

    #[test]
    fn resume_endpoint_is_preferred_once_known() {
        let shard = shard_with(Some("wss://gateway.example"), Compression::None);
        *shard.inner.resume_url.write() = "wss://resume.example".to_owned();
        let url = shard.compose_url().unwrap();
        assert_eq!(url.host_str(), Some("resume.example"));
    }

    #[test]
    fn unparseable_resume_endpoint_falls_back_to_gateway() {
        let shard = shard_with(Some("wss://gateway.example"), Compression::None);
        *shard.inner.resume_url.write() = "not a url".to_owned();
        let url = shard.compose_url().unwrap();
        assert_eq!(url.host_str(), Some("gateway.example"));
    }

    #[test]
    fn missing_gateway_is_a_configuration_error() {
        let shard = shard_with(None, Compression::None);
        assert!(matches!(shard.compose_url(), Err(Error::MissingGateway)));
    }

    #[test]
    fn ping_defaults_to_zero() {
        let shard = shard_with(Some("wss://gateway.example"), Compression::None);
        assert_eq!(shard.ping(), Duration::ZERO);
        assert_eq!(shard.shard_index(), 1);
    }
}
