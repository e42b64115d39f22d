//! Inbound message routing by topic

pub mod router;

pub use router::{
    classify, decode_payload, InboundHandler, LoggingHandler, MessageRouter, PayloadDecodeError,
    RoutedMessage,
};
