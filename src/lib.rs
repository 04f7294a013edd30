#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # cordflow
//!
//! The rate-limited request pipeline of a Discord REST client: accepts
//! caller-authored requests, serialises them against Discord's per-bucket
//! and global rate limits, dispatches them over a pluggable HTTP client,
//! parses responses, retries transient failures, and hands back exactly
//! one typed [`Answer`] per request.
//!
//! ## Architecture
//!
//! - A single-writer **limiter** actor owns all bucket state. Buckets are
//!   discovered from `X-RateLimit-Bucket` response headers and admission
//!   is optimistic until the first response names one.
//! - A staged **pipeline** moves requests through a bounded ingress
//!   buffer (with configurable overflow behaviour), an admission gate
//!   with `parallelism` concurrent send lanes, and a response parser that
//!   feeds observations back into the limiter.
//! - A bounded **retry** feedback lane re-injects transient failures with
//!   exponential backoff, preferred over fresh ingress.
//!
//! Requests whose predicted wait exceeds `max_allowed_wait` are answered
//! [`Answer::Dropped`] instead of queueing without bound.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cordflow::{
//!     json_parser, LimiterConfig, Pipeline, PipelineConfig, ReqwestClient, Request, Route,
//!     Token,
//! };
//!
//! #[derive(serde::Deserialize)]
//! struct Channel {
//!     id: String,
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline: Pipeline<Channel, ()> = Pipeline::new(
//!         Token::Bot(std::env::var("DISCORD_TOKEN").unwrap()),
//!         Arc::new(ReqwestClient::new()),
//!         LimiterConfig::default(),
//!         PipelineConfig::default(),
//!     )
//!     .unwrap();
//!
//!     let answer = pipeline
//!         .submit(Request::new(
//!             Route::get("/channels/100"),
//!             json_parser::<Channel>(),
//!             (),
//!         ))
//!         .await;
//!     if let Some(channel) = answer.into_data() {
//!         println!("#{}", channel.name);
//!     }
//! }
//! ```

mod answer;
pub mod backoff;
mod bucket;
mod client;
pub mod config;
mod error;
mod headers;
mod limiter;
mod parser;
mod pipeline;
mod queue;
mod request;
mod retry;
mod route;
pub mod sleeper;

pub use answer::Answer;
pub use backoff::{Backoff, Jitter};
pub use bucket::BucketId;
pub use client::{HttpClient, HttpRequest, HttpResponse, Token, TransportError};
pub use config::{LimiterConfig, OverflowPolicy, PipelineConfig};
pub use error::{ConfigError, ErrorCause, ParseError};
pub use headers::RatelimitInfo;
pub use limiter::{BucketSnapshot, LimiterHandle};
pub use pipeline::{PendingAnswer, Pipeline, RequestSender};
pub use request::{json_parser, unit_parser, Request, RequestId, ResponseParser};
pub use retry::RetryPolicy;
pub use route::{Route, RouteKey, MAJOR_SEGMENTS};

#[cfg(feature = "reqwest-client")]
pub use client::ReqwestClient;
