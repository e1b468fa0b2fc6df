//! Media WebSocket Server
//!
//! One TCP listener for all carrier media streams. The upgrade request's
//! path picks the adapter (`/telephony/plivo/stream`,
//! `/telephony/tata/stream`); each accepted socket is serviced by its own
//! task until the call ends.

use crate::config::ProviderKind;
use crate::provider::TelephonyAdapter;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{info, warn};

pub type AdapterMap = Arc<HashMap<ProviderKind, Arc<dyn TelephonyAdapter>>>;

pub struct MediaServer {
    listener: TcpListener,
    adapters: AdapterMap,
}

impl MediaServer {
    pub async fn bind(addr: &str, adapters: AdapterMap) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, adapters })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> std::io::Result<()> {
        info!("media server listening on {}", self.listener.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let adapters = self.adapters.clone();
            tokio::spawn(handle_connection(stream, peer, adapters));
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, adapters: AdapterMap) {
    let mut path = String::new();
    let socket = match accept_hdr_async(stream, |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        Ok(response)
    })
    .await
    {
        Ok(socket) => socket,
        Err(err) => {
            warn!("websocket handshake failed for {peer}: {err}");
            return;
        }
    };

    let adapter = adapters
        .values()
        .find(|adapter| path == format!("/telephony/{}/stream", adapter.provider().tag()));
    match adapter {
        Some(adapter) => {
            info!("media stream from {peer} on {path}");
            adapter.handle_socket(socket).await;
            info!("media stream from {peer} closed");
        }
        None => {
            warn!("media connection from {peer} on unknown path {path}, closing");
        }
    }
}
