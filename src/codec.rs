use bytes::buf::Buf;
use bytes::BytesMut;
use log::{debug, trace};
use tokio_util::codec::*;

use crate::mllp::{self, Reassembler};

/// A tokio codec for MLLP frames. Both the client and the listener drive their sockets through one
/// of these inside a [Framed](https://docs.rs/tokio-util/0.7/tokio_util/codec/struct.Framed.html).
#[derive(Debug, Default)]
pub struct MllpCodec {
    // Bytes are pushed through a per-connection reassembler so a message split across reads is
    // stitched back together, and a frame whose trailing CR shows up in a later read doesn't pollute the next one.
    reassembler: Reassembler,
}

impl MllpCodec {
    /// Creates a new Codec instance, generally for use within a Tokio Framed,
    /// but can be instantiated standalone for testing purposes etc.
    /// Example:
    /// ```
    /// use hl7_mllp_sim::MllpCodec;
    /// let mllp = MllpCodec::new();
    /// ```
    pub fn new() -> Self {
        MllpCodec {
            reassembler: Reassembler::new(),
        }
    }
}

// Support encoding data as an MLLP Frame.
// This is used for both the primary HL7 message sent from the client, and the ACKs sent from the listener.
impl Encoder<BytesMut> for MllpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, event: BytesMut, dst: &mut BytesMut) -> Result<(), Self::Error> {
        mllp::wrap_into(&event, dst);
        debug!("MLLP: Encoded value for send: '{:?}'", dst);
        Ok(())
    }
}

// Support decoding data from an MLLP Frame.
// This is used for receiving the primary HL7 message in the listener, and also decoding ACK responses in the client.
impl Decoder for MllpCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            trace!("MLLP: Feeding {} bytes to the reassembler", src.len());
            self.reassembler.receive(&src[..]);
            src.advance(src.len()); // this consumes the whole src buffer and keeps tokio happy
        }

        Ok(self
            .reassembler
            .next_message()
            .map(|msg| BytesMut::from(&msg[..])))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let result = self.decode(src)?;
        if result.is_none() && self.reassembler.is_mid_message() {
            debug!("MLLP: Stream closed mid-message, discarding the partial frame");
        }
        Ok(result)
    }
}
