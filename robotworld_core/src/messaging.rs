//! Peer messaging protocol: message kinds, the message envelope, its byte
//! codec and response handlers.
//!
//! A request is answered by exactly one message: its paired response, or one
//! of the error kinds when something went wrong on the way.

use crate::error::MessageError;
use crate::trace::Trace;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Every message kind, in wire discriminant order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    CommunicationReadError,
    CommunicationWriteError,
    ServerSideExceptionRequest,
    ServerSideExceptionResponse,
    ApplicationExceptionRequest,
    ApplicationExceptionResponse,
    GenericRequest,
    GenericResponse,
    EchoRequest,
    EchoResponse,
    PopulateRequest,
    PopulateResponse,
    StartRequest,
    StartResponse,
    StopRequest,
    StopResponse,
}

impl MessageType {
    /// All kinds, indexed by discriminant.
    pub const ALL: [MessageType; 16] = [
        MessageType::CommunicationReadError,
        MessageType::CommunicationWriteError,
        MessageType::ServerSideExceptionRequest,
        MessageType::ServerSideExceptionResponse,
        MessageType::ApplicationExceptionRequest,
        MessageType::ApplicationExceptionResponse,
        MessageType::GenericRequest,
        MessageType::GenericResponse,
        MessageType::EchoRequest,
        MessageType::EchoResponse,
        MessageType::PopulateRequest,
        MessageType::PopulateResponse,
        MessageType::StartRequest,
        MessageType::StartResponse,
        MessageType::StopRequest,
        MessageType::StopResponse,
    ];

    /// Wire discriminant.
    pub fn discriminant(self) -> u8 {
        self as u8
    }

    pub fn from_discriminant(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::CommunicationReadError => "CommunicationReadError",
            MessageType::CommunicationWriteError => "CommunicationWriteError",
            MessageType::ServerSideExceptionRequest => "ServerSideExceptionRequest",
            MessageType::ServerSideExceptionResponse => "ServerSideExceptionResponse",
            MessageType::ApplicationExceptionRequest => "ApplicationExceptionRequest",
            MessageType::ApplicationExceptionResponse => "ApplicationExceptionResponse",
            MessageType::GenericRequest => "GenericRequest",
            MessageType::GenericResponse => "GenericResponse",
            MessageType::EchoRequest => "EchoRequest",
            MessageType::EchoResponse => "EchoResponse",
            MessageType::PopulateRequest => "PopulateRequest",
            MessageType::PopulateResponse => "PopulateResponse",
            MessageType::StartRequest => "StartRequest",
            MessageType::StartResponse => "StartResponse",
            MessageType::StopRequest => "StopRequest",
            MessageType::StopResponse => "StopResponse",
        }
    }

    /// Transport level failures, delivered in place of a response.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            MessageType::CommunicationReadError | MessageType::CommunicationWriteError
        )
    }

    pub fn is_request(self) -> bool {
        !self.is_error() && self.discriminant() % 2 == 0
    }

    pub fn is_response(self) -> bool {
        !self.is_error() && self.discriminant() % 2 == 1
    }

    /// The response paired with a request kind; `None` for anything else.
    pub fn response_type(self) -> Option<MessageType> {
        if self.is_request() {
            Self::from_discriminant(self.discriminant() + 1)
        } else {
            None
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for MessageType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| MessageError::UnknownName(s.to_string()))
    }
}

/// A protocol message: a kind plus a free-text payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    kind: MessageType,
    payload: String,
}

impl Message {
    /// Creates a message with an empty payload.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: String::new(),
        }
    }

    pub fn with_payload(kind: MessageType, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn as_string(&self) -> String {
        format!("Message {}: {}", self.kind, self.payload)
    }

    /// One discriminant byte followed by the UTF-8 payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.payload.len());
        bytes.push(self.kind.discriminant());
        bytes.extend_from_slice(self.payload.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let (&first, rest) = bytes.split_first().ok_or(MessageError::Empty)?;
        let kind = MessageType::from_discriminant(first).ok_or(MessageError::UnknownKind(first))?;
        let payload = std::str::from_utf8(rest).map_err(|_| MessageError::InvalidUtf8)?;
        Ok(Self::with_payload(kind, payload))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// Receives the single answer to a sent request.
///
/// Invoked at most once, on whatever thread delivers the answer.
pub trait ResponseHandler: Send {
    fn handle_response(self: Box<Self>, message: Message);
}

/// Adapts a closure to [`ResponseHandler`].
pub struct FnHandler<F>(F);

impl<F> ResponseHandler for FnHandler<F>
where
    F: FnOnce(Message) + Send,
{
    fn handle_response(self: Box<Self>, message: Message) {
        (self.0)(message)
    }
}

/// Boxes a closure as a response handler.
pub fn handler<F>(f: F) -> Box<dyn ResponseHandler>
where
    F: FnOnce(Message) + Send + 'static,
{
    Box::new(FnHandler(f))
}

/// Writes the answer to the trace sink, or to the log without one.
#[derive(Default)]
pub struct LoggingHandler {
    trace: Option<Arc<Trace>>,
}

impl LoggingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace(trace: Arc<Trace>) -> Self {
        Self { trace: Some(trace) }
    }
}

impl ResponseHandler for LoggingHandler {
    fn handle_response(self: Box<Self>, message: Message) {
        match &self.trace {
            Some(trace) => trace.trace(&message.as_string()),
            None => info!("{}", message.as_string()),
        }
    }
}

/// Forwards the answer to a oneshot channel.
pub struct ChannelHandler {
    tx: oneshot::Sender<Message>,
}

impl ChannelHandler {
    /// Creates the handler together with the receiving end.
    pub fn new() -> (Self, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }
}

impl ResponseHandler for ChannelHandler {
    fn handle_response(self: Box<Self>, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("Response receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::ChannelSink;

    #[test]
    fn test_discriminants_follow_catalog_order() {
        for (i, kind) in MessageType::ALL.iter().enumerate() {
            assert_eq!(kind.discriminant() as usize, i);
        }
        assert_eq!(MessageType::EchoRequest.discriminant(), 8);
    }

    #[test]
    fn test_request_response_pairing() {
        assert_eq!(MessageType::EchoRequest.response_type(), Some(MessageType::EchoResponse));
        assert_eq!(MessageType::PopulateRequest.response_type(), Some(MessageType::PopulateResponse));
        assert_eq!(
            MessageType::ServerSideExceptionRequest.response_type(),
            Some(MessageType::ServerSideExceptionResponse)
        );
        assert_eq!(MessageType::StopResponse.response_type(), None);
        assert_eq!(MessageType::CommunicationReadError.response_type(), None);

        let requests = MessageType::ALL.iter().filter(|k| k.is_request()).count();
        let responses = MessageType::ALL.iter().filter(|k| k.is_response()).count();
        let errors = MessageType::ALL.iter().filter(|k| k.is_error()).count();
        assert_eq!((requests, responses, errors), (7, 7, 2));
    }

    #[test]
    fn test_names_parse_back() {
        for kind in MessageType::ALL {
            assert_eq!(kind.name().parse::<MessageType>(), Ok(kind));
        }
        assert_eq!("echorequest".parse::<MessageType>(), Ok(MessageType::EchoRequest));
        assert!("Teleport".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_codec_every_kind() {
        for kind in MessageType::ALL {
            let message = Message::with_payload(kind, "Hello world!");
            assert_eq!(Message::decode(&message.encode()), Ok(message));
        }
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(Message::decode(&[]), Err(MessageError::Empty));
        assert_eq!(Message::decode(&[16, b'x']), Err(MessageError::UnknownKind(16)));
        assert_eq!(Message::decode(&[8, 0xff, 0xfe]), Err(MessageError::InvalidUtf8));
    }

    #[test]
    fn test_as_string() {
        let message = Message::with_payload(MessageType::PopulateRequest, "3");
        assert_eq!(message.as_string(), "Message PopulateRequest: 3");
        assert_eq!(Message::new(MessageType::StartRequest).payload(), "");
    }

    #[test]
    fn test_fn_handler_receives_message() {
        let (tx, rx) = std::sync::mpsc::channel();
        let h = handler(move |m: Message| {
            tx.send(m).unwrap();
        });
        h.handle_response(Message::with_payload(MessageType::EchoResponse, "hi"));
        assert_eq!(rx.recv().unwrap().payload(), "hi");
    }

    #[tokio::test]
    async fn test_channel_handler() {
        let (h, rx) = ChannelHandler::new();
        Box::new(h).handle_response(Message::new(MessageType::StopResponse));
        assert_eq!(rx.await.unwrap().kind(), MessageType::StopResponse);
    }

    #[test]
    fn test_logging_handler_traces() {
        let (sink, mut rx) = ChannelSink::new();
        let h = LoggingHandler::with_trace(Arc::new(Trace::new(Arc::new(sink))));
        Box::new(h).handle_response(Message::with_payload(MessageType::EchoResponse, "x"));
        assert_eq!(rx.try_recv().unwrap(), "Message EchoResponse: x");
    }
}
