#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation, // TODO
    clippy::too_many_lines, // TODO
)]

mod bitio;
pub mod client;
pub mod config;
pub mod connection;
pub mod delegate;
pub mod error;
mod flags;
mod flow;
mod frame;
mod hpack;
mod huffman;
pub mod request;
pub mod response;
pub mod stream;
pub mod transport;
pub mod types;

pub use bytes::Bytes;
pub use client::Client;
pub use config::Params;
pub use connection::{Connection, Role, UpgradedRequest};
pub use delegate::{ConnectionDelegate, StartLine, StreamDelegate};
pub use error::{ConnectionError, H2Error, StreamError};
pub use request::{Method, Request};
pub use response::Response;
pub use stream::Stream;
pub use transport::{BoxedTransport, Transport};
pub use types::{ErrorCode, Headers, StreamId};
pub use url::Url;
