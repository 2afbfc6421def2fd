//! The MLLP listener: acknowledges every message it receives and hands it to a [`MessageSink`].

use bytes::Bytes;
use chrono::Local;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::{self, JoinSet};
use tokio_util::codec::Framed;

use crate::ack::build_ack;
use crate::error::TransportError;
use crate::sink::MessageSink;
use crate::MllpCodec;

/// A bound listener. Connections are served concurrently, one task each.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
}

impl Server {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Server, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::Accept)?;
        Ok(Server { listener })
    }

    /// The address actually bound, handy when binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` flips to `true` (or its sender goes away).
    ///
    /// Open connections are aborted on shutdown. Only a failure of the listening socket itself ends
    /// the loop with an error, a misbehaving peer only ends its own connection.
    pub async fn run(
        self,
        sink: Arc<dyn MessageSink>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Listening on {}", addr);
        }

        let mut connections = JoinSet::new();
        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let sink = Arc::clone(&sink);
                            connections.spawn(async move {
                                info!("Connection opened from {}", peer);
                                if let Err(e) = process(stream, sink).await {
                                    warn!("Failed to process connection from {}; error = {}", peer, e);
                                }
                                info!("Connection from {} closed", peer);
                            });
                        }
                        Err(e) => {
                            error!("Listener failed to accept: {}", e);
                            break Err(TransportError::Accept(e));
                        }
                    }
                }
                // reap finished connection tasks so the set doesn't grow forever
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        info!("Listener shutting down, closing {} connection(s)", connections.len());
        connections.shutdown().await;
        result
    }
}

async fn process(stream: TcpStream, sink: Arc<dyn MessageSink>) -> Result<(), TransportError> {
    let mut transport = Framed::new(stream, MllpCodec::new());

    while let Some(result) = transport.next().await {
        let message = Bytes::from(result?);
        debug!("Got message of {} bytes", message.len());

        let ack = build_ack(&message, Local::now());
        // a failed ack write is logged and the message is delivered regardless
        match transport.send(ack).await {
            Ok(()) => debug!("  ACK sent..."),
            Err(e) => error!("Failed to send ACK: {}", e),
        }

        // deliver runs on the blocking pool, awaited so this connection's messages stay in order
        let sink = Arc::clone(&sink);
        match task::spawn_blocking(move || sink.deliver(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Message sink rejected a message: {}", e),
            Err(e) => error!("Message sink panicked or was cancelled: {}", e),
        }
    }

    Ok(())
}
