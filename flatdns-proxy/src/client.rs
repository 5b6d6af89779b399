use std::time::{Duration, Instant};

use async_trait::async_trait;
use flatdns_core::metrics_window::{MetricsWindow, Outcome};
use flatdns_core::upstream::UpstreamEntry;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::Name;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Result of one `UpstreamClient::query` call (spec.md §4.4, C7).
#[derive(Debug, Clone)]
pub enum ClientResult {
    Answer(Message),
    Timeout,
    NetworkError,
    Malformed,
}

/// Issues a single DNS query to one upstream with a deadline, recording the
/// outcome in that upstream's metrics window. Abstracted behind a trait so
/// tests can substitute a scripted responder instead of real sockets
/// (grounded in the pack's `FailingResolver`/`CachedResolver` test-double
/// pattern).
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn query(
        &self,
        upstream: &UpstreamEntry,
        metrics: &MetricsWindow,
        question: &Message,
        deadline: Duration,
    ) -> ClientResult;
}

/// Real UDP-first, TCP-on-truncation client (spec.md §4.4).
pub struct DnsUpstreamClient {
    udp_buffer_size: usize,
}

impl DnsUpstreamClient {
    pub fn new() -> Self {
        Self {
            udp_buffer_size: 4096,
        }
    }

    async fn send_udp(&self, upstream: &UpstreamEntry, question: &Message) -> std::io::Result<Message> {
        let local: std::net::SocketAddr = if upstream.address.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(upstream.address).await?;

        let wire = question
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        socket.send(&wire).await?;

        let mut buf = vec![0u8; self.udp_buffer_size];
        let n = socket.recv(&mut buf).await?;
        Message::from_bytes(&buf[..n])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn send_tcp(&self, upstream: &UpstreamEntry, question: &Message) -> std::io::Result<Message> {
        let mut stream = TcpStream::connect(upstream.address).await?;
        stream.set_nodelay(true)?;

        let wire = question
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let len = (wire.len() as u16).to_be_bytes();
        stream.write_all(&len).await?;
        stream.write_all(&wire).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let reply_len = u16::from_be_bytes(len_buf) as usize;
        let mut reply = vec![0u8; reply_len];
        stream.read_exact(&mut reply).await?;

        Message::from_bytes(&reply)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Default for DnsUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for DnsUpstreamClient {
    async fn query(
        &self,
        upstream: &UpstreamEntry,
        metrics: &MetricsWindow,
        question: &Message,
        deadline: Duration,
    ) -> ClientResult {
        let mut attempt = question.clone();
        attempt.set_id(rand::thread_rng().gen());

        let start = Instant::now();
        let udp_result = tokio::time::timeout(deadline, self.send_udp(upstream, &attempt)).await;

        let message = match udp_result {
            Err(_) => {
                metrics.record(Outcome::Timeout, start.elapsed());
                return ClientResult::Timeout;
            }
            Ok(Err(_)) => {
                metrics.record(Outcome::Error, start.elapsed());
                return ClientResult::NetworkError;
            }
            Ok(Ok(message)) => message,
        };

        let message = if message.truncated() {
            let remaining = deadline.saturating_sub(start.elapsed());
            match tokio::time::timeout(remaining, self.send_tcp(upstream, &attempt)).await {
                Err(_) => {
                    metrics.record(Outcome::Timeout, start.elapsed());
                    return ClientResult::Timeout;
                }
                Ok(Err(_)) => {
                    metrics.record(Outcome::Error, start.elapsed());
                    return ClientResult::NetworkError;
                }
                Ok(Ok(message)) => message,
            }
        } else {
            message
        };

        let latency = start.elapsed();
        let outcome = match message.response_code() {
            ResponseCode::ServFail => Outcome::ServFail,
            ResponseCode::Refused => Outcome::Refused,
            _ => Outcome::Success,
        };
        metrics.record(outcome, latency);
        ClientResult::Answer(message)
    }
}

/// Build the root-zone SOA probe question used by the health monitor
/// (spec.md §4.2): a query for `.` IN SOA elicits a response from every
/// conformant resolver while leaking no information about real traffic.
pub fn root_soa_probe() -> Message {
    let mut message = Message::new();
    message.set_id(rand::thread_rng().gen());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(hickory_proto::op::Query::query(
        Name::root(),
        hickory_proto::rr::RecordType::SOA,
    ));
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_soa_probe_targets_root_zone() {
        let probe = root_soa_probe();
        let query = &probe.queries()[0];
        assert_eq!(query.name(), &Name::root());
        assert_eq!(query.query_type(), hickory_proto::rr::RecordType::SOA);
    }
}
