//! # treesync-stream — streaming transport and turn lifecycle
//!
//! Connects a prompt to a push stream of tree patches and keeps the local
//! tree, the conversation history and the host UI in step with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Session                          │
//! │                                                          │
//! │  TurnHistory      EventSource            PatchPipeline   │
//! │  pending →        connect / read         queue → frame   │
//! │  streaming →      decode lines           coalesce        │
//! │  complete         backoff + resume       backpressure    │
//! │      │                 │                      │          │
//! │      └── snapshot ◄────┼──────── TreeStore ◄──┘          │
//! └────────────────────────┼─────────────────────────────────┘
//!                          │ HTTP (JSON or multipart)
//!                          ▼
//!                   `<type>:<json>\n` lines, `[DONE]`
//! ```
//!
//! ## Modules
//!
//! - [`framing`] — line decoder
//! - [`protocol`] — stream event vocabulary
//! - [`reconnect`] — backoff policy and resume state
//! - [`transport`] — request model, HTTP and scripted connectors
//! - [`source`] — reconnecting event reader
//! - [`pipeline`] — frame-coalesced patch application
//! - [`progress`] — tool / plan / orchestration progress sink
//! - [`turns`] — turn history and snapshots
//! - [`session`] — everything above wired together
//! - [`archive`] — compressed on-disk conversation archive

pub mod archive;
pub mod framing;
pub mod pipeline;
pub mod progress;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod source;
pub mod transport;
pub mod turns;

pub use archive::{ArchiveError, TurnArchive};
pub use framing::{Frame, FrameError, LineDecoder};
pub use pipeline::{
    FrameScheduler, ImmediateScheduler, MemoryTreeStore, NoSelection, PatchPipeline,
    PipelineConfig, PipelineError, PipelineStats, SelectionHost, TickScheduler, TreeStore,
};
pub use progress::{NoProgress, ProgressSink};
pub use protocol::{ProtocolError, SequencedEvent, ServerError, StreamEvent};
pub use reconnect::{ReconnectConfig, ReconnectState};
pub use session::{AbortHandle, SendOptions, SendOutcome, Session, SessionConfig, SessionError, SessionEvent};
pub use source::{EventSource, ReadError, SourceItem};
pub use transport::{
    Attachment, Connector, HttpConnector, ScriptedAttempt, ScriptedConnector, StreamConfig,
    StreamRequest, TransportError, IDEMPOTENCY_HEADER, RESUME_HEADER,
};
pub use treesync_core;
pub use turns::{Turn, TurnError, TurnHistory, TurnStatus};
