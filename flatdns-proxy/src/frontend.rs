use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use flatdns_core::config::{FlattenerConfig, ListenConfig};
use flatdns_observability::logger::QueryLogExporter;
use flatdns_observability::metrics::MetricsCollector;
use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::health::HealthMonitor;
use crate::rate_limit::PerIpRateLimiter;
use crate::resolver::FlatteningResolver;

/// Default UDP payload ceiling when a request carries no EDNS0 OPT record
/// (spec.md §4.6).
const DEFAULT_UDP_PAYLOAD: usize = 512;

fn stats_query_name() -> Name {
    Name::from_str("_dns-proxy-stats.local.").unwrap()
}

/// Shared state reachable by both the UDP and TCP accept loops (C9/C10).
pub struct DnsFrontend {
    resolver: Arc<FlatteningResolver>,
    health: Arc<HealthMonitor>,
    flattener: FlattenerConfig,
    rate_limiter: Arc<PerIpRateLimiter>,
    metrics: Arc<MetricsCollector>,
    query_log: Arc<QueryLogExporter>,
}

impl DnsFrontend {
    pub fn new(
        resolver: Arc<FlatteningResolver>,
        health: Arc<HealthMonitor>,
        flattener: FlattenerConfig,
        rate_limiter: Arc<PerIpRateLimiter>,
        metrics: Arc<MetricsCollector>,
        query_log: Arc<QueryLogExporter>,
    ) -> Self {
        Self {
            resolver,
            health,
            flattener,
            rate_limiter,
            metrics,
            query_log,
        }
    }

    /// Build a response for one decoded query, handling the reserved stats
    /// name (C10) before falling through to the resolver (C8), and emitting
    /// a per-resolution query-log line (spec.md §4.7 ambient logging, the
    /// teacher's `access_log` analogue).
    async fn answer(&self, request: &Message, src: SocketAddr) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(request.recursion_desired());
        response.set_recursion_available(true);
        for q in request.queries() {
            response.add_query(q.clone());
        }

        let Some(question) = request.queries().first() else {
            response.set_response_code(ResponseCode::FormErr);
            return response;
        };

        if question.query_type() == RecordType::TXT
            && flatdns_core::model::canonicalize(question.name())
                == flatdns_core::model::canonicalize(&stats_query_name())
        {
            for record in self.stats_records(question.name()) {
                response.add_answer(record);
            }
            response.set_response_code(ResponseCode::NoError);
            return response;
        }

        let started = std::time::Instant::now();
        let outcome = self.resolver.resolve(question.name(), question.query_type()).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        response.set_response_code(outcome.response_code);
        for rr in &outcome.answer {
            if self.flattener.remove_aaaa && rr.record_type == RecordType::AAAA {
                continue;
            }
            response.add_answer(rr.record.clone());
        }

        self.metrics
            .queries_total
            .with_label_values(&[
                &format!("{:?}", question.query_type()),
                &format!("{:?}", outcome.response_code),
            ])
            .inc();
        self.metrics
            .cache_lookups_total
            .with_label_values(&[if outcome.cache_hit { "hit" } else { "miss" }])
            .inc();

        self.query_log.log(
            &src.ip().to_string(),
            &question.name().to_ascii(),
            &format!("{:?}", question.query_type()),
            &format!("{:?}", outcome.response_code),
            outcome.cache_hit,
            outcome.upstream.as_deref(),
            latency_ms,
        );

        response
    }

    /// Synthesize one TXT record per upstream describing current health and
    /// rolling metrics (spec.md §4.7). Read-only: touches no shared state.
    fn stats_records(&self, owner: &Name) -> Vec<Record> {
        self.health
            .entries()
            .iter()
            .enumerate()
            .map(|(i, upstream)| {
                let status = self.health.status_of(i);
                let metrics = self.health.metrics_for(i);
                let summary = format!(
                    "name={} health={:?} success_rate={:.3} mean_latency_ms={} samples={}",
                    upstream.name,
                    status,
                    metrics.success_rate(),
                    metrics
                        .mean_latency()
                        .map(|d| d.as_millis())
                        .unwrap_or(0),
                    metrics.sample_count(),
                );
                let mut record = Record::with(owner.clone(), RecordType::TXT, 0);
                record.set_data(Some(RData::TXT(TXT::new(vec![summary]))));
                record
            })
            .collect()
    }

    /// Decode the request far enough to build a FORMERR response when the
    /// fixed-size header parses but the rest of the message does not
    /// (spec.md §4.6); drop the packet entirely when even the header is
    /// unusable.
    fn malformed_response(buf: &[u8]) -> Option<Message> {
        let header = Header::from_bytes(buf).ok()?;
        let mut response = Message::new();
        response.set_id(header.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(header.op_code());
        response.set_response_code(ResponseCode::FormErr);
        Some(response)
    }
}

/// Bind a UDP socket, tolerating both `bindv6only=0` and `=1` kernels on an
/// unspecified IPv6 address (spec.md §4.6): `IPV6_V6ONLY` is explicitly
/// cleared when possible so one socket serves both families; callers must
/// still open a separate IPv4 listener in case the kernel enforces v6only
/// regardless (`bind_v4_fallback` below).
fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        let _ = socket.set_only_v6(false);
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn bind_tcp(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        let _ = socket.set_only_v6(false);
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// An unspecified IPv4 fallback address mirroring `addr`'s port, used when
/// the kernel enforces `bindv6only=1` and the dual-stack bind above only
/// reaches IPv6 clients.
fn v4_fallback(addr: SocketAddr) -> Option<SocketAddr> {
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        Some(SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), addr.port()))
    } else {
        None
    }
}

/// Run the UDP listener loop until `shutdown` fires (spec.md §4.6, §5).
pub async fn run_udp(
    frontend: Arc<DnsFrontend>,
    listen: ListenConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let socket = Arc::new(bind_udp(listen.udp_addr)?);
    info!(addr = %listen.udp_addr, "UDP DNS listener bound");

    if let Some(v4_addr) = v4_fallback(listen.udp_addr) {
        match bind_udp(v4_addr) {
            Ok(v4_socket) => {
                info!(addr = %v4_addr, "separate IPv4 UDP listener bound (bindv6only kernel)");
                let frontend = Arc::clone(&frontend);
                let rx = shutdown.resubscribe();
                tokio::spawn(run_udp_loop(frontend, Arc::new(v4_socket), rx));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!("dual-stack UDP socket already serves IPv4, no fallback listener needed");
            }
            Err(e) => warn!(error = %e, "failed to bind IPv4 UDP fallback listener"),
        }
    }

    run_udp_loop(frontend, socket, shutdown).await
}

async fn run_udp_loop(
    frontend: Arc<DnsFrontend>,
    socket: Arc<UdpSocket>,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {

    let mut buf = vec![0u8; 65535];
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("UDP listener shutting down");
                return Ok(());
            }
            result = socket.recv_from(&mut buf) => {
                let (len, src) = result?;
                if !frontend.rate_limiter.check(src.ip()) {
                    debug!(%src, "rate limit exceeded, dropping query");
                    frontend.metrics.rate_limit_drops_total.with_label_values(&["udp"]).inc();
                    continue;
                }

                let datagram = buf[..len].to_vec();
                let frontend = Arc::clone(&frontend);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    handle_udp_datagram(&frontend, &socket, &datagram, src).await;
                });
            }
        }
    }
}

async fn handle_udp_datagram(
    frontend: &DnsFrontend,
    socket: &UdpSocket,
    datagram: &[u8],
    src: SocketAddr,
) {
    let request = match Message::from_bytes(datagram) {
        Ok(message) => message,
        Err(e) => {
            debug!(%src, error = %e, "malformed UDP query");
            if let Some(response) = DnsFrontend::malformed_response(datagram) {
                if let Ok(wire) = response.to_bytes() {
                    let _ = socket.send_to(&wire, src).await;
                }
            }
            return;
        }
    };

    let max_payload = edns_payload_size(&request).unwrap_or(DEFAULT_UDP_PAYLOAD);
    let response = frontend.answer(&request, src).await;

    let wire = match response.to_bytes() {
        Ok(wire) => wire,
        Err(e) => {
            warn!(%src, error = %e, "failed to encode DNS response");
            return;
        }
    };

    let wire = if wire.len() > max_payload {
        let mut truncated = Message::new();
        truncated.set_id(response.id());
        truncated.set_message_type(MessageType::Response);
        truncated.set_op_code(response.op_code());
        truncated.set_response_code(response.response_code());
        truncated.set_recursion_desired(response.recursion_desired());
        truncated.set_recursion_available(true);
        truncated.set_truncated(true);
        for q in response.queries() {
            truncated.add_query(q.clone());
        }
        match truncated.to_bytes() {
            Ok(wire) => wire,
            Err(e) => {
                warn!(%src, error = %e, "failed to encode truncated DNS response");
                return;
            }
        }
    } else {
        wire
    };

    if let Err(e) = socket.send_to(&wire, src).await {
        warn!(%src, error = %e, "failed to send UDP response");
    }
}

fn edns_payload_size(message: &Message) -> Option<usize> {
    message.edns().map(|edns| edns.max_payload() as usize)
}

/// Run the TCP listener loop until `shutdown` fires (spec.md §4.6, §5).
pub async fn run_tcp(
    frontend: Arc<DnsFrontend>,
    listen: ListenConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = bind_tcp(listen.tcp_addr)?;
    info!(addr = %listen.tcp_addr, "TCP DNS listener bound");
    let idle_timeout = Duration::from_secs(listen.tcp_idle_timeout_secs);

    if let Some(v4_addr) = v4_fallback(listen.tcp_addr) {
        match bind_tcp(v4_addr) {
            Ok(v4_listener) => {
                info!(addr = %v4_addr, "separate IPv4 TCP listener bound (bindv6only kernel)");
                let frontend = Arc::clone(&frontend);
                let rx = shutdown.resubscribe();
                tokio::spawn(run_tcp_loop(frontend, v4_listener, idle_timeout, rx));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!("dual-stack TCP socket already serves IPv4, no fallback listener needed");
            }
            Err(e) => warn!(error = %e, "failed to bind IPv4 TCP fallback listener"),
        }
    }

    run_tcp_loop(frontend, listener, idle_timeout, shutdown).await
}

async fn run_tcp_loop(
    frontend: Arc<DnsFrontend>,
    listener: TcpListener,
    idle_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("TCP listener shutting down");
                return Ok(());
            }
            result = listener.accept() => {
                let (stream, src) = result?;
                let frontend = Arc::clone(&frontend);
                tokio::spawn(async move {
                    if let Err(e) = handle_tcp_connection(&frontend, stream, src, idle_timeout).await {
                        debug!(%src, error = %e, "TCP connection ended");
                    }
                });
            }
        }
    }
}

async fn handle_tcp_connection(
    frontend: &DnsFrontend,
    mut stream: TcpStream,
    src: SocketAddr,
    idle_timeout: Duration,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(idle_timeout, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(%src, "TCP connection idle timeout");
                return Ok(());
            }
        }
        let message_len = u16::from_be_bytes(len_buf) as usize;

        let mut message_buf = vec![0u8; message_len];
        stream.read_exact(&mut message_buf).await?;

        if !frontend.rate_limiter.check(src.ip()) {
            debug!(%src, "rate limit exceeded, closing TCP connection");
            frontend.metrics.rate_limit_drops_total.with_label_values(&["tcp"]).inc();
            return Ok(());
        }

        let request = match Message::from_bytes(&message_buf) {
            Ok(message) => message,
            Err(e) => {
                debug!(%src, error = %e, "malformed TCP query");
                if let Some(response) = DnsFrontend::malformed_response(&message_buf) {
                    write_framed(&mut stream, &response).await?;
                }
                continue;
            }
        };

        let response = frontend.answer(&request, src).await;
        write_framed(&mut stream, &response).await?;
    }
}

async fn write_framed(stream: &mut TcpStream, message: &Message) -> std::io::Result<()> {
    let wire = message
        .to_bytes()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = (wire.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(&wire).await
}
