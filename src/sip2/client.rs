//! SIP2 client: one TCP (or TLS) socket to one LMS endpoint.
//!
//! The LMS answers at most one request per sequence number, so the client
//! keeps a pending table keyed by the 0-9 sequence digit and routes each
//! inbound frame to its waiting caller. The connection manager serializes
//! operations per branch; the table exists so a timed-out request and a
//! late response can never cross wires.
//!
//! Incoming bytes are decoded as ISO-8859-1 (single-byte, lossless) and
//! reassembled on `\r` frame boundaries, tolerating CRLF and leading
//! whitespace from chatty LMS implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, trace, warn};

use super::format::{self, HoldMode, InfoSummary, SecurityMarker};
use super::parse;
use super::sanitize::to_ascii;
use super::types::*;
use super::checksum;
use crate::config::BranchConfig;
use crate::error::{Result, Sip2Error};
use crate::events::{EventBus, LogLevel};

/// Completion handle for one in-flight request.
type Pending = oneshot::Sender<Result<String>>;

struct PendingTable {
    entries: HashMap<u8, Pending>,
    /// Next sequence candidate; allocation scans forward from here.
    cursor: u8,
}

/// State the reader task shares with the send path.
struct Shared {
    branch_id: String,
    checksum_required: bool,
    pending: StdMutex<PendingTable>,
    bus: Arc<EventBus>,
}

struct Connection {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: JoinHandle<()>,
    closed: Arc<AtomicBool>,
}

pub struct SipClient {
    config: BranchConfig,
    shared: Arc<Shared>,
    conn: Mutex<Option<Connection>>,
}

impl SipClient {
    pub fn new(config: BranchConfig, bus: Arc<EventBus>) -> Self {
        let shared = Arc::new(Shared {
            branch_id: config.id.clone(),
            checksum_required: config.checksum_required(),
            pending: StdMutex::new(PendingTable { entries: HashMap::new(), cursor: 0 }),
            bus,
        });
        Self { config, shared, conn: Mutex::new(None) }
    }

    fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Allocate a free sequence number, scanning ten candidates from the
    /// cursor. All ten occupied means ten requests are outstanding.
    pub fn allocate_sequence(&self) -> Result<u8> {
        let mut pending = self.shared.pending.lock().unwrap();
        for offset in 0..10u8 {
            let candidate = (pending.cursor + offset) % 10;
            if !pending.entries.contains_key(&candidate) {
                pending.cursor = (candidate + 1) % 10;
                return Ok(candidate);
            }
        }
        Err(Sip2Error::ClientAtCapacity)
    }

    /// Idempotent connect: reuses a live socket, joins an in-flight
    /// attempt (callers queue on the connection lock), or dials fresh.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        self.ensure_connected(&mut conn).await?;
        Ok(())
    }

    async fn ensure_connected<'a>(
        &self,
        conn: &'a mut Option<Connection>,
    ) -> Result<&'a mut Connection> {
        let needs_dial = conn.as_ref().map_or(true, |c| c.closed.load(Ordering::SeqCst));
        if needs_dial {
            if let Some(stale) = conn.take() {
                stale.reader.abort();
            }
            *conn = Some(self.open_connection().await?);
        }
        conn.as_mut().ok_or_else(|| Sip2Error::ConnectionLost("connection setup failed".into()))
    }

    async fn open_connection(&self) -> Result<Connection> {
        let host = self.config.host.clone();
        let port = self.config.port;
        let dial = async {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            if self.config.tls {
                let connector = tls_connector(self.config.tls_verify)?;
                let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                    .map_err(|e| Sip2Error::Tls(e.to_string()))?;
                let tls = connector.connect(server_name, stream).await?;
                let (read_half, write_half) = tokio::io::split(tls);
                Ok::<_, Sip2Error>((
                    Box::new(read_half) as Box<dyn AsyncRead + Send + Unpin>,
                    Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>,
                ))
            } else {
                let (read_half, write_half) = stream.into_split();
                Ok((
                    Box::new(read_half) as Box<dyn AsyncRead + Send + Unpin>,
                    Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>,
                ))
            }
        };

        let (read_half, writer) = match timeout(self.timeout_duration(), dial).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(host = %self.config.host, port, "connect timed out");
                return Err(Sip2Error::ConnectTimeout { host: self.config.host.clone(), port });
            }
        };

        info!(branch = %self.shared.branch_id, host = %self.config.host, port, tls = self.config.tls, "connected to LMS");

        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(read_half, self.shared.clone(), closed.clone()));
        Ok(Connection { writer, reader, closed })
    }

    /// Send one frame and await its response.
    ///
    /// Rejects with `SequenceInUse` if the slot is occupied. On timeout
    /// the socket is destroyed so the next call starts from fresh setup;
    /// sibling requests are rejected through the close path.
    pub async fn send_raw(&self, frame: &str, seq: u8) -> Result<String> {
        // The connection lock covers setup and the write; it is released
        // before awaiting so another request can go out while this one
        // waits for its response.
        let receiver = {
            let mut conn = self.conn.lock().await;
            self.ensure_connected(&mut conn).await?;
            let receiver = self.install_pending(seq)?;
            if let Err(e) = self.write_frame(&mut conn, frame).await {
                self.remove_pending(seq);
                return Err(e);
            }
            receiver
        };

        let timeout_ms = self.config.timeout_ms;
        match timeout(self.timeout_duration(), receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Sip2Error::ConnectionLost("connection closed mid-request".into())),
            Err(_) => {
                warn!(branch = %self.shared.branch_id, seq, timeout_ms, "request timed out, destroying socket");
                self.remove_pending(seq);
                let mut conn = self.conn.lock().await;
                destroy(&mut conn, &self.shared, "request timeout");
                Err(Sip2Error::RequestTimeout { timeout_ms })
            }
        }
    }

    /// Write a frame without installing a pending entry. Block Patron has
    /// no response defined in SIP2, so there is nothing to wait for.
    pub async fn send_fire_and_forget(&self, frame: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        self.write_frame(&mut conn, frame).await
    }

    async fn write_frame(&self, conn: &mut Option<Connection>, frame: &str) -> Result<()> {
        let connection = self.ensure_connected(conn).await?;
        let ascii = to_ascii(frame);
        self.shared.bus.log_to_dashboard(
            LogLevel::Debug,
            "SIP2 request",
            &json!({ "branchId": self.shared.branch_id, "raw": ascii }),
        );
        trace!(branch = %self.shared.branch_id, bytes = ascii.len(), "writing frame");
        if let Err(e) = write_all(&mut connection.writer, ascii.as_bytes()).await {
            error!(branch = %self.shared.branch_id, error = %e, "socket write failed");
            destroy(conn, &self.shared, "write failure");
            return Err(Sip2Error::Io(e));
        }
        Ok(())
    }

    fn install_pending(&self, seq: u8) -> Result<oneshot::Receiver<Result<String>>> {
        let mut pending = self.shared.pending.lock().unwrap();
        if pending.entries.contains_key(&seq) {
            return Err(Sip2Error::SequenceInUse(seq));
        }
        let (tx, rx) = oneshot::channel();
        pending.entries.insert(seq, tx);
        Ok(rx)
    }

    fn remove_pending(&self, seq: u8) {
        self.shared.pending.lock().unwrap().entries.remove(&seq);
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().entries.len()
    }

    /// Tear down the socket if present. Pending entries are rejected via
    /// the close path, not here.
    pub async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            destroy(&mut conn, &self.shared, "disconnect");
        }
    }

    // High-level operations: allocate a sequence, format, send, parse.

    /// Login (93). Success is a response starting `941`.
    pub async fn login(&self, user: &str, password: &str, location: &str) -> Result<bool> {
        let frame = format::build_login(user, password, location, 0)?;
        let raw = self.send_raw(&frame, 0).await?;
        Ok(raw.starts_with("941"))
    }

    pub async fn patron_status(
        &self,
        patron_barcode: &str,
        language: Option<&str>,
    ) -> Result<PatronStatusResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_patron_status(
            &self.config.institution_id,
            patron_barcode,
            language,
            seq,
        )?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_patron_status(&raw)
    }

    pub async fn checkout(
        &self,
        patron_barcode: &str,
        item_barcode: &str,
        patron_pin: Option<&str>,
    ) -> Result<CheckoutResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_checkout(
            &self.config.institution_id,
            patron_barcode,
            item_barcode,
            patron_pin,
            seq,
        )?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_checkout(&raw)
    }

    pub async fn checkin(&self, item_barcode: &str) -> Result<CheckinResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_checkin(&self.config.institution_id, item_barcode, seq)?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_checkin(&raw)
    }

    pub async fn item_information(&self, item_barcode: &str) -> Result<ItemInformationResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_item_information(&self.config.institution_id, item_barcode, seq)?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_item_information(&raw)
    }

    pub async fn renew(
        &self,
        patron_barcode: &str,
        item_barcode: &str,
        patron_pin: Option<&str>,
    ) -> Result<CheckoutResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_renew(
            &self.config.institution_id,
            patron_barcode,
            item_barcode,
            patron_pin,
            seq,
        )?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_renew(&raw)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn fee_paid(
        &self,
        patron_barcode: &str,
        fee_id: &str,
        amount: &str,
        fee_type: Option<&str>,
        payment_type: Option<&str>,
        currency: Option<&str>,
    ) -> Result<FeePaidResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_fee_paid(
            &self.config.institution_id,
            patron_barcode,
            fee_id,
            amount,
            fee_type,
            payment_type,
            currency,
            seq,
        )?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_fee_paid(&raw)
    }

    pub async fn patron_information(
        &self,
        patron_barcode: &str,
        summary: InfoSummary,
        start_item: u16,
        end_item: u16,
        language: Option<&str>,
    ) -> Result<PatronInformationResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_patron_information(
            &self.config.institution_id,
            patron_barcode,
            summary,
            start_item,
            end_item,
            language,
            seq,
        )?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_patron_information(&raw)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn hold(
        &self,
        patron_barcode: &str,
        mode: HoldMode,
        item_barcode: Option<&str>,
        expiry_date: Option<&str>,
        pickup_location: Option<&str>,
        title_id: Option<&str>,
    ) -> Result<HoldResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_hold(
            &self.config.institution_id,
            patron_barcode,
            mode,
            item_barcode,
            expiry_date,
            pickup_location,
            title_id,
            seq,
        )?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_hold(&raw)
    }

    pub async fn renew_all(&self, patron_barcode: &str) -> Result<RenewAllResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_renew_all(&self.config.institution_id, patron_barcode, seq)?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_renew_all(&raw)
    }

    pub async fn end_session(&self, patron_barcode: &str) -> Result<EndSessionResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_end_session(&self.config.institution_id, patron_barcode, seq)?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_end_session(&raw)
    }

    pub async fn sc_status(&self) -> Result<AcsStatusResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_sc_status(seq)?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_acs_status(&raw)
    }

    /// Block Patron (01): fire-and-forget, resolves once the bytes are
    /// written.
    pub async fn block_patron(
        &self,
        patron_barcode: &str,
        card_retained: bool,
        message: &str,
    ) -> Result<()> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_block_patron(
            &self.config.institution_id,
            patron_barcode,
            card_retained,
            message,
            seq,
        )?;
        self.send_fire_and_forget(&frame).await
    }

    pub async fn item_status_update(
        &self,
        item_barcode: &str,
        marker: SecurityMarker,
    ) -> Result<ItemStatusUpdateResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_item_status_update(
            &self.config.institution_id,
            item_barcode,
            marker,
            seq,
        )?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_item_status_update(&raw)
    }

    pub async fn patron_enable(
        &self,
        patron_barcode: &str,
        patron_pin: Option<&str>,
    ) -> Result<PatronStatusResponse> {
        let seq = self.allocate_sequence()?;
        let frame = format::build_patron_enable(
            &self.config.institution_id,
            patron_barcode,
            patron_pin,
            seq,
        )?;
        let raw = self.send_raw(&frame, seq).await?;
        parse::parse_patron_enable(&raw)
    }
}

async fn write_all(
    writer: &mut (impl AsyncWrite + Send + Unpin + ?Sized),
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Tear down a connection and reject every pending request. Timeout
/// teardown and explicit disconnects both funnel through here.
fn destroy(conn: &mut Option<Connection>, shared: &Shared, reason: &str) {
    if let Some(connection) = conn.take() {
        connection.closed.store(true, Ordering::SeqCst);
        connection.reader.abort();
    }
    cleanup_pending(shared, reason);
}

/// Reject every pending entry with the reported error and clear the table.
fn cleanup_pending(shared: &Shared, reason: &str) {
    let entries: Vec<(u8, Pending)> = {
        let mut pending = shared.pending.lock().unwrap();
        pending.entries.drain().collect()
    };
    for (seq, sender) in entries {
        debug!(seq, reason, "rejecting pending request");
        let _ = sender.send(Err(Sip2Error::ConnectionLost(reason.to_string())));
    }
}

/// Decode bytes as ISO-8859-1: every byte maps to the code point of the
/// same value, so the conversion is total and lossless.
fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

async fn read_loop(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let reason = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "socket closed by LMS".to_string(),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                drain_frames(&mut buf, &shared);
            }
            Err(e) => break format!("socket error: {}", e),
        }
    };
    warn!(branch = %shared.branch_id, reason = %reason, "reader stopped");
    closed.store(true, Ordering::SeqCst);
    cleanup_pending(&shared, &reason);
}

/// Pull every complete `\r`-terminated message out of the buffer.
fn drain_frames(buf: &mut BytesMut, shared: &Shared) {
    while let Some(pos) = buf.iter().position(|&b| b == b'\r') {
        let raw = buf.copy_to_bytes(pos + 1);
        let text = latin1_to_string(&raw);
        let message = text.strip_suffix('\r').unwrap_or(&text);
        let message = message.strip_prefix('\n').unwrap_or(message).trim_start();
        if message.is_empty() {
            continue;
        }
        handle_message(shared, message);
    }
}

fn handle_message(shared: &Shared, message: &str) {
    trace!(branch = %shared.branch_id, bytes = message.len(), "frame received");
    let verified = matches!(checksum::verify(message), Ok(true));

    if !verified {
        if shared.checksum_required {
            shared.bus.log_to_dashboard(
                LogLevel::Error,
                "SIP2 checksum verification failed",
                &json!({ "branchId": shared.branch_id, "raw": message }),
            );
            if let Some(seq) = parse::sequence_digit(message) {
                let sender = shared.pending.lock().unwrap().entries.remove(&seq);
                if let Some(sender) = sender {
                    let _ = sender.send(Err(Sip2Error::ChecksumMismatch));
                    return;
                }
            }
            debug!(branch = %shared.branch_id, "discarding unverifiable frame");
            return;
        }
        shared.bus.log_to_dashboard(
            LogLevel::Warn,
            "SIP2 checksum mismatch tolerated",
            &json!({ "branchId": shared.branch_id, "raw": message }),
        );
    }

    let mut pending = shared.pending.lock().unwrap();
    match parse::sequence_digit(message) {
        Some(seq) => match pending.entries.remove(&seq) {
            Some(sender) => {
                let _ = sender.send(Ok(message.to_string()));
            }
            None => {
                debug!(branch = %shared.branch_id, seq, "response for unknown sequence, discarding");
            }
        },
        None => match pending.entries.len() {
            // Legacy fallback: some systems omit the trailer entirely.
            // With one request outstanding the answer is unambiguous.
            1 => {
                let seq = *pending.entries.keys().next().unwrap_or(&0);
                if let Some(sender) = pending.entries.remove(&seq) {
                    let _ = sender.send(Ok(message.to_string()));
                }
            }
            0 => {
                debug!(branch = %shared.branch_id, "unsolicited message, discarding");
            }
            _ => {
                // Guessing here could hand a response to the wrong caller.
                error!(
                    branch = %shared.branch_id,
                    pending = pending.entries.len(),
                    "untagged response with multiple requests pending, discarding"
                );
            }
        },
    }
}

fn tls_connector(verify_certificates: bool) -> Result<TlsConnector> {
    let config = if verify_certificates {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
    } else {
        warn!("TLS certificate validation disabled; accepting self-signed certificates");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::default()))
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any server certificate. Only reachable when a branch opts out
/// of certificate validation for a self-signed LMS endpoint.
#[derive(Debug)]
struct NoVerification(rustls::crypto::CryptoProvider);

impl Default for NoVerification {
    fn default() -> Self {
        Self(rustls::crypto::aws_lc_rs::default_provider())
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
