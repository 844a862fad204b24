// cd-test-utils: Shared test utilities for the agent suite.
//
// Provides a mock Hub client speaking the control-channel envelope protocol
// over a real WebSocket connection.

use cd_protocol::{BinaryHeader, Envelope, encode_binary_frame};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A scripted Hub peer for driving the agent in tests.
pub struct HubClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl HubClient {
    pub async fn connect(port: u16) -> Result<Self, Box<dyn std::error::Error>> {
        let url = format!("ws://127.0.0.1:{port}/");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(&url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Send a request frame with a fresh correlation id; returns the id.
    pub async fn send_request<T: Serialize>(
        &mut self,
        kind: &str,
        payload: &T,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let id = uuid::Uuid::new_v4().to_string();
        let env = Envelope {
            id: id.clone(),
            kind: kind.to_owned(),
            payload: Some(serde_json::to_value(payload)?),
            error: None,
        };
        self.send_envelope(&env).await?;
        Ok(id)
    }

    pub async fn send_envelope(&mut self, env: &Envelope) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(env)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send a binary frame assembled from a header and payload bytes.
    pub async fn send_binary(
        &mut self,
        header: &BinaryHeader,
        data: &[u8],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let raw = encode_binary_frame(header, data);
        self.write.send(Message::Binary(raw.into())).await?;
        Ok(())
    }

    /// Send raw bytes as a binary message, bypassing frame assembly.
    pub async fn send_raw_binary(&mut self, raw: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Binary(raw.to_vec().into())).await?;
        Ok(())
    }

    /// Receive the next text frame, skipping control frames.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let env: Envelope = serde_json::from_str(&text)?;
                    return Ok(env);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by agent".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Receive frames until one of `kind` arrives (events may interleave).
    pub async fn recv_until(
        &mut self,
        kind: &str,
    ) -> Result<Envelope, Box<dyn std::error::Error>> {
        loop {
            let env = self.recv_envelope().await?;
            if env.kind == kind {
                return Ok(env);
            }
        }
    }

    /// True once the server has closed the connection.
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match self.read.next().await {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
