/*!
# HL7 v2 message simulation over MLLP.

 HL7's MLLP is a simple, single-byte-text based protocol for framing HL7 messages over a TCP (or similar) transport.
 The full specification is available at [the HL7 site](https://www.hl7.org/documentcenter/private/standards/v3/V3_TRMLLP_R2_R2019.zip) (Note that they place the standards behind a free membership/login form).

 This crate generates test traffic and plays both ends of the wire:
 - [template] expands JSON templates into one or more HL7 v2 messages, filling in timestamps, counters, random values,
   data file picks and caller arguments.
 - [MllpCodec] is a [Codec](https://docs.rs/tokio-util/0.7/tokio_util/codec/index.html) that encodes/decodes MLLP frames
   from a Tokio stream, with the framing primitives living in [mllp].
 - [Client] sends a payload (one or many messages) and reports the acknowledgement code(s).
 - [Server] listens, acknowledges every message with an `AA` and hands it to a [MessageSink].
 - [locator] pulls individual fields out of a raw message without parsing the whole thing.

 ## Example
 ### Publisher
 ```no_run
use hl7_mllp_sim::{Client, SendOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(SendOptions::default());
    let code = client.send("127.0.0.1", 11011, b"MSH|^~\\&|SIM|||||||ADT^A01|123|P|2.5\r").await?;
    println!("  Received ack: {}", code);
    Ok(())
}
```

 ### Listener
 ```no_run
use std::sync::Arc;
use tokio::sync::watch;
use hl7_mllp_sim::{Server, StdoutSink};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind("0.0.0.0:22022").await?;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    server.run(Arc::new(StdoutSink), shutdown_rx).await?;
    Ok(())
}
```

 # Crate Features
 By default this crate is designed to strictly comply with the MLLP Specification, however there are scenarios where systems in production _do not_ comply with the standard.  In those cases there is a crate feature `noncompliance`
 available which enables some non-compliant behaviours:
 - Accepts a message whose sender skipped the start block, treating the first non-whitespace byte as its beginning

 */

pub mod ack;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod locator;
pub mod mllp;
pub mod server;
pub mod sink;
pub mod template;

/// HL7 `TS` format, to the second
pub const HL7_TIMESTAMP: &str = "%Y%m%d%H%M%S";

pub use ack::{Ack, AckCode};
pub use client::{Client, SendOptions};
pub use codec::MllpCodec;
pub use config::Settings;
pub use error::{ConfigError, DirectiveError, TemplateError, TransportError};
pub use locator::{find_field, find_field_nth};
pub use server::Server;
pub use sink::{ChannelSink, LengthPrefixedSink, MessageSink, StdoutSink};
pub use template::{expand, ExpandOptions, Expansion, Template};
