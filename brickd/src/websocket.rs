//! WebSocket transport adapter. The handshake and frame codec come from
//! tungstenite; this module pins down the protocol surface the daemon
//! exposes: subprotocol `tfp`, binary frames only, small enough to always
//! fit one unextended frame. Client-to-server masking is enforced by the
//! library per RFC 6455.

use anyhow::Context as _;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::WebSocketStream;

pub const PROTOCOL: &str = "tfp";

/// A data frame must fit an unextended payload, which conveniently also
/// bounds it to the largest TFP packet.
pub const MAX_FRAME_PAYLOAD: usize = 125;

pub async fn accept(stream: TcpStream) -> anyhow::Result<WebSocketStream<TcpStream>> {
    let callback = |_request: &Request, mut response: Response| {
        response.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(PROTOCOL),
        );
        Ok(response)
    };

    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("WebSocket handshake failed")
}
