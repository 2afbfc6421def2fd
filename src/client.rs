//! Sends HL7 messages over MLLP and waits for their acknowledgements.

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::ack::{self, Ack, AckCode};
use crate::error::TransportError;
use crate::locator::ESCAPE;
use crate::MllpCodec;

/// How long to wait for each acknowledgement unless told otherwise
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Every message in a payload starts with this
pub const DEFAULT_MESSAGE_START: &[u8] = b"MSH|";

#[derive(Clone, Debug)]
pub struct SendOptions {
    /// Applied to every acknowledgement read
    pub ack_timeout: Duration,
    /// A payload is split in front of each unescaped occurrence of this
    pub message_start: Vec<u8>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            message_start: DEFAULT_MESSAGE_START.to_vec(),
        }
    }
}

/// Splits a payload holding several messages back to back, keeping the marker at the start of each.
///
/// Leading bytes before the first marker are their own message unless they're only whitespace, and a
/// payload without any marker comes back whole.
pub fn split_messages<'a>(payload: &'a [u8], marker: &[u8]) -> Vec<&'a [u8]> {
    let mut starts: Vec<usize> = Vec::new();
    if !marker.is_empty() && payload.len() >= marker.len() {
        for i in 0..=payload.len() - marker.len() {
            let escaped = i > 0 && payload[i - 1] == ESCAPE;
            if !escaped && payload[i..].starts_with(marker) {
                starts.push(i);
            }
        }
    }

    if starts.first() != Some(&0) {
        starts.insert(0, 0);
    }

    let mut messages = Vec::with_capacity(starts.len());
    for (n, start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(payload.len());
        let chunk = &payload[*start..end];
        if !chunk.iter().all(u8::is_ascii_whitespace) {
            messages.push(chunk);
        }
    }
    messages
}

/// An MLLP client. Each call opens its own connection, so a `Client` can be shared freely.
#[derive(Clone, Debug, Default)]
pub struct Client {
    options: SendOptions,
}

impl Client {
    pub fn new(options: SendOptions) -> Self {
        Client { options }
    }

    pub fn options(&self) -> &SendOptions {
        &self.options
    }

    /// Sends every message in `payload` over one connection, in order, and returns the code of the
    /// first message's acknowledgement.
    ///
    /// Later acks are still read, each within the ack timeout, but only logged: a late or unreadable
    /// one doesn't stop the remaining messages going out. Losing the connection does.
    pub async fn send(&self, host: &str, port: u16, payload: &[u8]) -> Result<AckCode, TransportError> {
        let messages = split_messages(payload, &self.options.message_start);
        if messages.is_empty() {
            return Err(TransportError::EmptyPayload);
        }

        let mut transport = Framed::new(connect(host, port).await?, MllpCodec::new());
        let mut first = None;
        for (n, message) in messages.iter().enumerate() {
            if let Err(e) = transport.send(BytesMut::from(*message)).await {
                return first.unwrap_or(Err(e.into()));
            }
            debug!("Message {} of {} sent, awaiting ack...", n + 1, messages.len());

            let outcome = self.read_ack(&mut transport, message).await;
            let lost_connection = matches!(
                outcome,
                Err(TransportError::ConnectionClosed) | Err(TransportError::Io(_))
            );
            if first.is_none() {
                first = Some(outcome.map(|ack| ack.code));
            } else {
                match outcome {
                    Ok(ack) => debug!("Message {} acknowledged with {}", n + 1, ack.code),
                    Err(e) => warn!("Message {} of {}: {}", n + 1, messages.len(), e),
                }
            }
            if lost_connection {
                if n + 1 < messages.len() {
                    warn!("{} message(s) left unsent", messages.len() - n - 1);
                }
                break;
            }
        }

        first.unwrap_or(Err(TransportError::EmptyPayload))
    }

    /// Like [`Client::send`], but every message must be acknowledged before the next one is sent.
    ///
    /// Stops at the first failure: a timeout or an unreadable ack leaves the remaining messages unsent.
    pub async fn send_all(
        &self,
        host: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<Vec<Ack>, TransportError> {
        let messages = split_messages(payload, &self.options.message_start);
        if messages.is_empty() {
            return Err(TransportError::EmptyPayload);
        }

        let mut transport = Framed::new(connect(host, port).await?, MllpCodec::new());
        let mut acks = Vec::with_capacity(messages.len());
        for (n, message) in messages.iter().enumerate() {
            transport.send(BytesMut::from(*message)).await?; //because this is through the codec it gets wrapped in MLLP header/footer for us
            debug!("Message {} of {} sent, awaiting ack...", n + 1, messages.len());

            let ack = self.read_ack(&mut transport, message).await?;
            info!("Message {} acknowledged with {}", n + 1, ack.code);
            acks.push(ack);
        }

        Ok(acks)
    }

    async fn read_ack(
        &self,
        transport: &mut Framed<TcpStream, MllpCodec>,
        message: &[u8],
    ) -> Result<Ack, TransportError> {
        let response = match timeout(self.options.ack_timeout, transport.next()).await {
            Err(_) => return Err(TransportError::AckTimeout(self.options.ack_timeout)),
            Ok(None) => return Err(TransportError::ConnectionClosed),
            Ok(Some(Err(e))) => return Err(TransportError::Io(e)),
            Ok(Some(Ok(response))) => response,
        };

        let ack = Ack::parse(&response)?;
        check_control_id(message, &ack);
        Ok(ack)
    }
}

/// Sends `payload` with default options apart from the ack timeout.
pub async fn send(
    host: &str,
    port: u16,
    payload: &[u8],
    ack_timeout: Duration,
) -> Result<AckCode, TransportError> {
    let options = SendOptions {
        ack_timeout,
        ..SendOptions::default()
    };
    Client::new(options).send(host, port, payload).await
}

// Logs a warning when MSA-2 differs from the sent MSH-10, the ack is returned either way.
fn check_control_id(message: &[u8], ack: &Ack) {
    if let (Some(sent), Some(echoed)) = (ack::control_id(message), ack.control_id.as_deref()) {
        if sent != echoed.as_bytes() {
            warn!(
                "Ack control id '{}' does not match sent control id '{}'",
                echoed,
                String::from_utf8_lossy(sent)
            );
        }
    }
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let address = format!("{}:{}", host, port);
    let connect_error = |reason: String| TransportError::Connect {
        address: address.clone(),
        reason,
    };

    let candidates: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| connect_error(e.to_string()))?
        .filter(SocketAddr::is_ipv4)
        .collect();
    if candidates.is_empty() {
        return Err(connect_error("no IPv4 address".to_string()));
    }

    let mut last_error = None;
    for candidate in candidates {
        match TcpStream::connect(candidate).await {
            Ok(stream) => {
                info!("Connected to {} ({})", address, candidate);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", candidate, e);
                last_error = Some(e);
            }
        }
    }

    Err(connect_error(
        last_error.map(|e| e.to_string()).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_message_start() {
        let payload = b"MSH|^~\\&|A\rPID|1\rMSH|^~\\&|B\rPID|2\r";
        let parts = split_messages(payload, DEFAULT_MESSAGE_START);

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], &b"MSH|^~\\&|A\rPID|1\r"[..]);
        assert_eq!(parts[1], &b"MSH|^~\\&|B\rPID|2\r"[..]);
    }

    #[test]
    fn payload_without_marker_is_one_message() {
        let parts = split_messages(b"PID|1|2\r", DEFAULT_MESSAGE_START);
        assert_eq!(parts, vec![&b"PID|1|2\r"[..]]);
    }

    #[test]
    fn escaped_marker_does_not_split() {
        let parts = split_messages(b"MSH|a\rNTE|see \\MSH|b\r", DEFAULT_MESSAGE_START);
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn leading_whitespace_is_dropped() {
        let parts = split_messages(b"\r\n MSH|a\rMSH|b\r", DEFAULT_MESSAGE_START);
        assert_eq!(parts, vec![&b"MSH|a\r"[..], &b"MSH|b\r"[..]]);
    }

    #[test]
    fn empty_payload_has_no_messages() {
        assert!(split_messages(b"", DEFAULT_MESSAGE_START).is_empty());
        assert!(split_messages(b"\r\n", DEFAULT_MESSAGE_START).is_empty());
    }

    #[test]
    fn custom_marker() {
        let parts = split_messages(b"FHS|1\rFHS|2\r", b"FHS|");
        assert_eq!(parts.len(), 2);
    }
}
