#![doc = include_str!("../README.md")]

pub mod cartridge;
pub mod codec;
pub mod consumer;
pub mod envelope;
pub mod host;
pub mod parameter;
mod producer;
pub mod settings;
pub mod telemetry;
pub mod transport;

#[doc(inline)]
pub use cartridge::Cartridge;

#[doc(inline)]
pub use consumer::{
    Acknowledge, Consumer, ConsumerHook, ConsumerRunError, ConsumerRunErrorKind,
    DefaultConsumerHook, Delivery, MessageHandler, Receiver,
};

#[doc(inline)]
pub use envelope::{Envelope, Headers};

#[doc(inline)]
pub use host::{MessagingBuilder, MessagingHost, RegistrationError, RegistrationErrorKind};

#[doc(inline)]
pub use parameter::{ConsumerParameter, InvalidParameter, ProducerParameter};

#[doc(inline)]
pub use producer::{Producer, ProducerStack};

#[doc(inline)]
pub use settings::{Settings, SettingsError, SettingsErrorKind};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};
