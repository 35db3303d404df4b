// Sidekick - thin client for a supervised local chat backend
//
// Two loosely coupled pieces: `ServerSupervisor` owns the lifecycle of the
// backend process (spawn, health-poll, terminate) and `ChatSession` drives a
// token-streamed conversation against the URL the supervisor exposes. The
// only coupling between them is that URL string; how many supervisors or
// sessions exist is the embedding application's decision.

mod chat;
mod config;
mod error;
mod logs;
mod sse;
mod supervisor;

pub use chat::{ChatMessage, ChatSession, ChatSink, Role};
pub use config::{ServerConfig, DEFAULT_PORT};
pub use error::{Result, SidekickError};
pub use logs::{LogRingBuffer, LogSink, RingLine};
pub use supervisor::{ServerSupervisor, ServerState};
