//! Signed exchanges over hickory's UDP and TCP client streams

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::error::{ProtoError, ProtoErrorKind};
use hickory_proto::iocompat::AsyncIoTokioAsStd;
use hickory_proto::op::Message;
use hickory_proto::tcp::TcpClientStream;
use hickory_proto::udp::UdpClientStream;
use hickory_proto::xfer::{
    DnsExchange, DnsExchangeSend, DnsHandle, DnsMultiplexer, DnsResponse, FirstAnswer,
};
use hickory_proto::TokioTime;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::debug;

use crate::error::{DnsError, TsigError};
use crate::tsig::TsigSigner;

/// Historical DNS UDP payload ceiling
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Default bound on one exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const DNS_PORT: u16 = 53;

type TokioTcp = AsyncIoTokioAsStd<TcpStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// UDP unless the serialized message exceeds [`MAX_UDP_PAYLOAD`]
pub fn select_transport(message_len: usize) -> Transport {
    if message_len > MAX_UDP_PAYLOAD {
        Transport::Tcp
    } else {
        Transport::Udp
    }
}

/// Wire length of `message` once its TSIG record is appended
pub fn signed_len(message: &Message, signer: &TsigSigner) -> Result<usize, DnsError> {
    let mut signed = message.clone();
    // the signing time does not change the record's length
    signed.finalize(signer, 0)?;
    Ok(signed.to_vec()?.len())
}

/// Resolve `host`, `host:port`, `ip` or `ip:port`. Port defaults to 53.
pub async fn resolve(server: &str) -> Result<SocketAddr, DnsError> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }

    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, DNS_PORT)
    };

    let addr = lookup_host(&target)
        .await
        .map_err(|source| DnsError::Io {
            server: server.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| DnsError::Io {
            server: server.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no address for nameserver"),
        });
    addr
}

/// Open a signing client to `addr`.
///
/// The background task driving the connection is spawned here and ends once
/// every handle and pending response stream is dropped.
pub async fn connect(
    transport: Transport,
    server: &str,
    addr: SocketAddr,
    timeout: Duration,
    signer: Arc<TsigSigner>,
) -> Result<DnsExchange, DnsError> {
    match transport {
        Transport::Udp => {
            let stream = UdpClientStream::<UdpSocket, TsigSigner>::with_timeout_and_signer(
                addr,
                timeout,
                Some(signer),
            );
            let (exchange, background) = DnsExchange::connect::<_, _, TokioTime>(stream)
                .await
                .map_err(|e| exchange_error(server, e))?;
            tokio::spawn(background);
            Ok(exchange)
        }
        Transport::Tcp => {
            let (stream, handle) = TcpClientStream::<TokioTcp>::with_timeout(addr, timeout);
            let multiplexer = DnsMultiplexer::<TcpClientStream<TokioTcp>, TsigSigner>::with_timeout(
                stream,
                handle,
                timeout,
                Some(signer),
            );
            let (exchange, background) = DnsExchange::connect::<_, _, TokioTime>(multiplexer)
                .await
                .map_err(|e| exchange_error(server, e))?;
            tokio::spawn(background);
            Ok(exchange)
        }
    }
}

/// Sign and send `message` over the transport its signed size calls for,
/// returning the verified answer. A truncated UDP answer is retried over TCP.
pub async fn exchange(
    server: &str,
    message: Message,
    timeout: Duration,
    signer: Arc<TsigSigner>,
) -> Result<DnsResponse, DnsError> {
    let addr = resolve(server).await?;
    let transport = select_transport(signed_len(&message, &signer)?);

    let response = send_once(transport, server, addr, message.clone(), timeout, signer.clone()).await?;
    if transport == Transport::Udp && response.truncated() {
        debug!("Truncated UDP response from {}, retrying over TCP", server);
        return send_once(Transport::Tcp, server, addr, message, timeout, signer).await;
    }
    Ok(response)
}

async fn send_once(
    transport: Transport,
    server: &str,
    addr: SocketAddr,
    message: Message,
    timeout: Duration,
    signer: Arc<TsigSigner>,
) -> Result<DnsResponse, DnsError> {
    debug!(?transport, "Sending DNS message to {}", server);
    let client = connect(transport, server, addr, timeout, signer).await?;
    client
        .send(message)
        .first_answer()
        .await
        .map_err(|e| exchange_error(server, e))
}

/// Sign and send `message` over TCP and return every answer it produces, as
/// for a zone transfer. Each item has been verified against the chain of
/// signatures before it.
pub async fn stream(
    server: &str,
    message: Message,
    timeout: Duration,
    signer: Arc<TsigSigner>,
) -> Result<DnsExchangeSend, DnsError> {
    let addr = resolve(server).await?;
    let client = connect(Transport::Tcp, server, addr, timeout, signer).await?;
    Ok(client.send(message))
}

/// Map a failed exchange to the client's error, keeping timeouts, I/O and
/// signature failures distinguishable
pub fn exchange_error(server: &str, err: ProtoError) -> DnsError {
    match err.kind() {
        ProtoErrorKind::Timeout => DnsError::Timeout(server.to_string()),
        ProtoErrorKind::Io(source) => DnsError::Io {
            server: server.to_string(),
            source: io::Error::new(source.kind(), source.to_string()),
        },
        ProtoErrorKind::HmacInvalid() => DnsError::Tsig(TsigError::BadSignature),
        _ => DnsError::Protocol(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    fn signer() -> TsigSigner {
        TsigSigner::from_config("update-key", "c2VjcmV0LWtleS1mb3ItdGVzdHM=", "hmac-sha256").unwrap()
    }

    fn update_with_payload(bytes: usize) -> Message {
        let mut message = Message::new();
        message
            .set_id(1)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Update);
        message.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::SOA,
        ));
        if bytes > 0 {
            message.add_name_server(Record::from_rdata(
                Name::from_ascii("big.example.com.").unwrap(),
                300,
                RData::TXT(TXT::new(vec!["x".repeat(bytes)])),
            ));
        }
        message
    }

    #[test]
    fn test_select_transport_boundary() {
        assert_eq!(select_transport(0), Transport::Udp);
        assert_eq!(select_transport(511), Transport::Udp);
        assert_eq!(select_transport(512), Transport::Udp);
        assert_eq!(select_transport(513), Transport::Tcp);
        assert_eq!(select_transport(4096), Transport::Tcp);
    }

    #[test]
    fn test_signed_len_counts_tsig_record() {
        let signer = signer();
        let message = update_with_payload(0);
        let unsigned = message.to_vec().unwrap().len();
        let signed = signed_len(&message, &signer).unwrap();

        // key name, fixed fields, algorithm name and a 32-byte MAC
        assert!(signed > unsigned + 32);
        assert!(message.signature().is_empty());
    }

    #[test]
    fn test_large_update_selects_tcp() {
        let signer = signer();
        assert_eq!(
            select_transport(signed_len(&update_with_payload(16), &signer).unwrap()),
            Transport::Udp
        );
        assert_eq!(
            select_transport(signed_len(&update_with_payload(250), &signer).unwrap()),
            Transport::Udp
        );
        // two 255-byte strings cannot fit with the signature
        let mut big = update_with_payload(255);
        big.add_name_server(Record::from_rdata(
            Name::from_ascii("more.example.com.").unwrap(),
            300,
            RData::TXT(TXT::new(vec!["y".repeat(255)])),
        ));
        assert_eq!(
            select_transport(signed_len(&big, &signer).unwrap()),
            Transport::Tcp
        );
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        assert_eq!(
            resolve("192.0.2.1").await.unwrap(),
            "192.0.2.1:53".parse().unwrap()
        );
        assert_eq!(
            resolve("192.0.2.1:5353").await.unwrap(),
            "192.0.2.1:5353".parse().unwrap()
        );
    }

    #[test]
    fn test_exchange_error_mapping() {
        assert!(matches!(
            exchange_error("ns", ProtoErrorKind::Timeout.into()),
            DnsError::Timeout(ref s) if s == "ns"
        ));
        assert!(matches!(
            exchange_error("ns", ProtoErrorKind::HmacInvalid().into()),
            DnsError::Tsig(TsigError::BadSignature)
        ));
        let io = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = exchange_error("ns", ProtoError::from(io));
        assert!(err.is_exchange_error());
        assert!(matches!(
            exchange_error("ns", ProtoError::from("garbled")),
            DnsError::Protocol(_)
        ));
    }
}
