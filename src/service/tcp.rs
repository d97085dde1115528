//! Reference TCP transport host
//!
//! Newline-delimited framed wire messages over TCP, one task per
//! connection. This stands in for the out-of-scope HTTP container: the
//! runtime only sees the collaborator interfaces (parameter map, input
//! payload, output sink).

use std::{net::SocketAddr, sync::Arc};

use http::Method;
use log::{debug, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::{
    broker::Broker,
    core::{context::param, error::ServiceResult, RequestContext},
    wire::{Encoding, WireMessage},
};

pub struct TcpHost {
    address: SocketAddr,
    broker: Arc<Broker>,
    /// Encoding used for transport-level error responses when the inbound
    /// bytes cannot be trusted to identify one.
    default_encoding: Encoding,
}

impl TcpHost {
    pub fn new(address: SocketAddr, broker: Arc<Broker>, default_encoding: Encoding) -> Self {
        Self {
            address,
            broker,
            default_encoding,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ServiceResult<()> {
        let listener = TcpListener::bind(self.address).await?;
        info!("listening on {}", self.address);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping accept loop");
                        return Ok(());
                    }
                },
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            debug!("connection from {peer}");
                            let broker = Arc::clone(&self.broker);
                            let default_encoding = self.default_encoding;
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(broker, socket, default_encoding).await
                                {
                                    warn!("connection from {peer} failed: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    broker: Arc<Broker>,
    socket: TcpStream,
    default_encoding: Encoding,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(&broker, &line, default_encoding).await;
        writer.write_all(&response).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}

/// One request, one complete framed response, whatever happens.
async fn respond(broker: &Broker, line: &str, default_encoding: Encoding) -> Vec<u8> {
    let (encoding, message) = match WireMessage::from_text(line) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(default_encoding, "", &e.to_string(), e.wire_code()),
    };

    let mut ctx = RequestContext::from_message(&message, Method::POST);
    if ctx.param(param::ENCODING_IN).is_none() {
        // The sniffed encoding is the negotiated one unless overridden.
        ctx.set_param(param::ENCODING_IN, encoding.name().to_string());
    }

    let mut buf: Vec<u8> = Vec::new();
    match broker.invoke(&mut ctx, &message, &mut buf).await {
        Ok(()) => buf,
        Err(e) => {
            warn!("request for '{}' failed: {e}", message.service);
            error_response(
                ctx.output_encoding(),
                &message.service,
                &e.to_string(),
                e.wire_code(),
            )
        }
    }
}

fn error_response(encoding: Encoding, service: &str, message: &str, error_code: u32) -> Vec<u8> {
    let mut response = WireMessage::request(service);
    response.error_code = error_code;
    response.error_message = Some(message.to_string());
    response
        .to_text(encoding)
        .map(String::into_bytes)
        .unwrap_or_default()
}
