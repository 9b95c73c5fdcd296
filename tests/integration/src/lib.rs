//! Shared pieces for the integration tests: a plain-text codec and an
//! echo service exercising all four RPC shapes.

use bytes::{Buf, BufMut};
use roam::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use roam::server::{ResponseStream, Service};
use roam::{Request, Response, Status, Streaming};

/// A codec carrying UTF-8 strings; enough structure to notice corruption
/// without dragging in a serialization framework.
#[derive(Debug, Clone, Default)]
pub struct TextCodec;

impl Codec for TextCodec {
    type Encode = String;
    type Decode = String;
    type Encoder = TextEncoder;
    type Decoder = TextDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        TextEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        TextDecoder
    }
}

#[derive(Debug)]
pub struct TextEncoder;

impl Encoder for TextEncoder {
    type Item = String;
    type Error = Status;

    fn encode(&mut self, item: String, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

#[derive(Debug)]
pub struct TextDecoder;

impl Decoder for TextDecoder {
    type Item = String;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<String>, Status> {
        let bytes = src.copy_to_bytes(src.remaining());
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|e| Status::internal(format!("invalid utf-8 message: {e}")))?;
        Ok(Some(text))
    }
}

pub const ECHO_SERVICE: &str = "echo.Echo";
pub const UNARY_ECHO: &str = "/echo.Echo/UnaryEcho";
pub const CLIENT_STREAMING_ECHO: &str = "/echo.Echo/ClientStreamingEcho";
pub const SERVER_STREAMING_ECHO: &str = "/echo.Echo/ServerStreamingEcho";
pub const BIDI_STREAMING_ECHO: &str = "/echo.Echo/BidirectionalStreamingEcho";

/// The echo service used by most tests:
/// - `UnaryEcho` echoes the request message;
/// - `ClientStreamingEcho` joins all request messages with `,`;
/// - `ServerStreamingEcho` streams one response per whitespace-separated
///   word of the request;
/// - `BidirectionalStreamingEcho` echoes each request message as it
///   arrives.
/// Starts the echo service on an in-memory listener, returning the
/// server handle and the target to dial.
pub fn start_echo_server() -> (roam::Server, String) {
    start_server(roam::Server::builder().add_service(echo_service()).build())
}

/// Serves `server` on a fresh in-memory listener.
pub fn start_server(server: roam::Server) -> (roam::Server, String) {
    let listener = roam::inmemory::Listener::new();
    let target = listener.target();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve_with_incoming(listener.incoming()).await;
    });
    (server, target)
}

/// A channel to `target` with default options.
pub fn connect(target: &str) -> roam::Channel {
    roam::Channel::new(target, None, roam::ChannelOptions::default())
        .expect("target must be valid")
}

pub fn echo_service() -> Service {
    Service::new(ECHO_SERVICE)
        .unary("UnaryEcho", TextCodec, |request: Request<String>| async move {
            Ok(Response::new(request.into_inner()))
        })
        .client_streaming(
            "ClientStreamingEcho",
            TextCodec,
            |request: Request<Streaming<String>>| async move {
                let mut inbound = request.into_inner();
                let mut parts = Vec::new();
                while let Some(message) = inbound.message().await? {
                    parts.push(message);
                }
                Ok(Response::new(parts.join(",")))
            },
        )
        .server_streaming(
            "ServerStreamingEcho",
            TextCodec,
            |request: Request<String>| async move {
                let words: Vec<String> = request
                    .into_inner()
                    .split_whitespace()
                    .map(|w| w.to_string())
                    .collect();
                let stream: ResponseStream<String> =
                    Box::pin(futures_util::stream::iter(words.into_iter().map(Ok)));
                Ok(Response::new(stream))
            },
        )
        .streaming(
            "BidirectionalStreamingEcho",
            TextCodec,
            |request: Request<Streaming<String>>| async move {
                let inbound = request.into_inner();
                let stream: ResponseStream<String> = Box::pin(inbound);
                Ok(Response::new(stream))
            },
        )
}
