//! This provides all the *non-network* logic around framing and reassembling the MLLP stream.
//! MLLP Spec: https://www.hl7.org/implement/standards/product_brief.cfm?product_id=55
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use std::collections::VecDeque;

/// Vertical-Tab char, the marker for the start of a message
pub const START_BLOCK: u8 = 0x0B;
/// File-Separator char, the marker for the end of a message
pub const END_BLOCK: u8 = 0x1C;
/// CR, ASCII 13. Follows the end block, and also terminates every HL7 segment.
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Wraps `body` in a fresh MLLP frame.
pub fn wrap(body: &[u8]) -> BytesMut {
    let mut dst = BytesMut::with_capacity(body.len() + 3);
    wrap_into(body, &mut dst);
    dst
}

/// Appends an MLLP frame holding `body` to `dst`.
pub fn wrap_into(body: &[u8], dst: &mut BytesMut) {
    dst.reserve(body.len() + 3); //we need an extra 3 bytes of space on top of the message proper
    dst.put_u8(START_BLOCK);
    dst.put_slice(body);
    dst.put_u8(END_BLOCK);
    dst.put_u8(CARRIAGE_RETURN);
}

/// Strips MLLP framing from `framed`.
///
/// Every start and end block byte is removed, not just the outermost pair, along with the CR that
/// directly follows the final end block. Anything else (segment CRs included, even one sitting behind a
/// stray end block) is left alone, so `unwrap(&wrap(unwrap(x)))` is always `unwrap(x)`.
pub fn unwrap(framed: &[u8]) -> BytesMut {
    let trailer = framed
        .iter()
        .rposition(|b| *b == END_BLOCK)
        .map(|i| i + 1)
        .filter(|i| framed.get(*i) == Some(&CARRIAGE_RETURN));

    let mut body = BytesMut::with_capacity(framed.len());
    for (i, &b) in framed.iter().enumerate() {
        if b == START_BLOCK || b == END_BLOCK || Some(i) == trailer {
            continue;
        }
        body.put_u8(b);
    }
    body
}

/// The state of our state machine
#[derive(Clone, Copy, Debug, PartialEq)]
enum ParseState {
    /// We are waiting for a StartBlock byte to indicate a new message
    WaitingForStartBlock,
    /// All data is considered message data, we're waiting to see an End Block byte/Carriage Return combo
    ReadingData,
    /// We've received an End-Block char, and are expecting a CR next.
    /// The CR frequently lands on its own in the following read, so this state survives across calls to `receive`.
    ExpectingCarriageReturn,
}

/// Reassembles a stream of arbitrarily chunked bytes into discrete, unwrapped messages.
///
/// One of these lives per connection. A message is only ever handed out once its end block has been
/// seen, so a partially received message can never escape.
#[derive(Debug)]
pub struct Reassembler {
    state: ParseState,
    current_message: BytesMut,
    completed: VecDeque<Bytes>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    /// Constructs a new Reassembler ready for processing a stream of data
    pub fn new() -> Reassembler {
        Reassembler {
            state: ParseState::WaitingForStartBlock,
            current_message: BytesMut::new(),
            completed: VecDeque::new(),
        }
    }

    /// Pops the oldest completed message, if any.
    pub fn next_message(&mut self) -> Option<Bytes> {
        self.completed.pop_front()
    }

    /// True when some bytes of an unfinished message have been buffered.
    pub fn is_mid_message(&self) -> bool {
        self.state == ParseState::ReadingData
    }

    /// Accepts a byte slice for processing
    /// Returns whether at least one completed message is waiting (via `next_message()`)
    pub fn receive(&mut self, bytes: &[u8]) -> bool {
        for &b in bytes {
            match self.state {
                ParseState::WaitingForStartBlock => self.waiting_for_start(b),
                ParseState::ReadingData => {
                    if b == END_BLOCK {
                        self.complete_message();
                    } else if b == START_BLOCK {
                        // stray header inside a frame, strip it like `unwrap` does
                        trace!("MLLP: Dropping embedded start block byte");
                    } else {
                        self.current_message.put_u8(b);
                    }
                }
                ParseState::ExpectingCarriageReturn => {
                    if b == CARRIAGE_RETURN {
                        self.state = ParseState::WaitingForStartBlock;
                    } else {
                        trace!("MLLP: Expected CR after end block but got {:#04x}", b);
                        self.waiting_for_start(b);
                    }
                }
            }
        } // end for each byte

        !self.completed.is_empty()
    }

    fn complete_message(&mut self) {
        let msg = self.current_message.split().freeze();
        trace!("MLLP: Completed message of {} bytes", msg.len());
        self.completed.push_back(msg);
        self.state = ParseState::ExpectingCarriageReturn;
    }

    #[cfg(not(feature = "noncompliance"))]
    fn waiting_for_start(&mut self, b: u8) {
        if b == START_BLOCK {
            self.state = ParseState::ReadingData; // we want to interpret all further bytes as message data
        } else {
            //else we are meant to ignore any other bytes
            trace!("MLLP: Ignoring non-StartBlock byte {:#04x}", b);
        }
    }

    /// Some senders skip the start block entirely, treat any non-whitespace byte as the start of a message
    #[cfg(feature = "noncompliance")]
    fn waiting_for_start(&mut self, b: u8) {
        match b {
            START_BLOCK => self.state = ParseState::ReadingData,
            CARRIAGE_RETURN | b'\n' | b' ' | b'\t' => {
                trace!("MLLP: Ignoring whitespace between frames");
            }
            END_BLOCK => {}
            _ => {
                trace!("MLLP: Message without start block, accepting anyway");
                self.state = ParseState::ReadingData;
                self.current_message.put_u8(b);
            }
        }
    }
}
