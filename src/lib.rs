//! Voxturn - turn-based voice conversations with a remote agent
//!
//! This library provides the real-time audio pipeline behind a spoken
//! conversation:
//! - Energy-gated utterance capture from the microphone
//! - A transport adapter speaking several wire protocols, with fallback
//! - Jitter-buffered, gapless playback of the streamed reply
//! - The conversation loop tying them into repeated turns
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌──────────────┐  utterance  ┌──────────────┐
//! │  Microphone  ├───────────►│  Segmenter   ├────────────►│  Transport   │
//! └──────────────┘            └──────▲───────┘             └──────┬───────┘
//!                                    │                            │ reply frames
//!                             ┌──────┴───────┐   drained   ┌──────▼───────┐
//!                             │ Conversation │◄────────────┤   Playback   │
//!                             │     Loop     │             │  Scheduler   │
//!                             └──────────────┘             └──────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod conversation;
pub mod error;
pub mod playback;
pub mod segmenter;
pub mod transport;

pub use config::Config;
pub use conversation::{ConversationLoop, SessionState, SessionSummary, StopHandle};
pub use error::{Error, Result};
