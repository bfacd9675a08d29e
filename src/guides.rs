//! Integration guides for the Kraken streaming client.
//!
//! These guides cover common patterns and workflows for consuming Kraken
//! market data with this crate. Each sub-module contains a standalone
//! guide rendered from Markdown.
//!
//! # Available Guides
//!
//! | Guide | Description |
//! |-------|-------------|
//! | [`event_loop`] | Structuring the poll/pop application loop |
//! | [`subscriptions`] | Subscription lifecycle, request ids, and ACK tracking |
//! | [`reconnection`] | Epochs, retry policy, liveness, and intent replay |
//! | [`error_handling`] | Rejection notices, error kinds, and recovery |

#[doc = include_str!("../docs/guides/event-loop.md")]
pub mod event_loop {}

#[doc = include_str!("../docs/guides/subscriptions.md")]
pub mod subscriptions {}

#[doc = include_str!("../docs/guides/reconnection.md")]
pub mod reconnection {}

#[doc = include_str!("../docs/guides/error-handling.md")]
pub mod error_handling {}
