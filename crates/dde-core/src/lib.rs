//! Managed-object facade over DDE conversations.
//!
//! The crate ties the facility's single shared C-style callback to an object
//! model: [`DdeContext`] owns one facility instance and its dedicated owning
//! thread, [`DdeClient`] drives client-side conversations (blocking, try and
//! asynchronous forms of execute/poke/request plus advise loops), and
//! [`DdeServer`] registers a service and dispatches incoming verbs to a
//! [`ServerHandler`]. The facility itself is consumed through the
//! [`dde_proto::DdeApi`] capability trait, so tests run against an in-process
//! double instead of the OS.

pub use dde_proto as proto;

mod client;
mod context;
mod error;
mod events;
mod server;
mod thread;

pub use client::{AsyncKind, AsyncTransaction, CompletionHandler, DdeClient};
pub use context::{DdeContext, TextEncoding, TransactionFilter};
pub use error::{DdeError, Status};
pub use events::{AdviseEvent, AdviseState, DisconnectedEvent, RegistrationEvent, Subscription};
pub use server::{
    ConversationTag, DdeServer, ExecuteResult, PokeResult, RequestResult, ServerConversation, ServerHandler,
};
