//! Remote Transport Core
//!
//! Point-to-point message delivery between remote actor systems over a UDP
//! pub/sub messaging medium. The medium itself is an external collaborator
//! reached through the traits in [`medium`]; this crate owns its lifecycle,
//! partitions inbound traffic into ordered lanes, keeps every stream pipeline
//! alive under supervision and bounds how long an outbound send may wait.
//!
//! ```text
//!                   ┌──────────────── RemoteTransport ────────────────┐
//!                   │ TransportLifecycle   StreamSupervisor           │
//!                   │  ├─ embedded medium   └─ MediumStreamLauncher   │
//!                   │  ├─ connection            ├─ inbound  (demux)   │
//!                   │  ├─ diagnostics           └─ outbound (give-up) │
//!                   │  └─ AgentRunner thread                          │
//!                   └─────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod demux;
pub mod diagnostics;
pub mod envelope;
pub mod error;
pub mod idle;
pub mod inbound;
pub mod lifecycle;
pub mod medium;
pub mod send_policy;
pub mod streams;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use agent::{Agent, AgentId, AgentRunner};
pub use demux::{lane_for, AbortSwitch, InboundDemultiplexer, PartitionKey};
pub use envelope::{EnvelopeDecoder, InboundEnvelope, InboundHandler, RecipientRef};
pub use error::{ErrorClass, MediumError, Result, TransportError};
pub use idle::{IdleStrategy, ThreadingMode};
pub use lifecycle::{
    FatalErrorLatch, LifecycleState, RuntimeHandle, ShutdownFlag, ShutdownReport, ShutdownStep,
    StepOutcome, TransportLifecycle,
};
pub use medium::{
    EmbeddedMedium, EmbeddedMediumContext, EmbeddedMediumLauncher, Endpoint, Fragment, Image, Medium,
    MediumConnection, MediumContext, MediumEventHandler, OfferOutcome, Publication, Subscription,
};
pub use send_policy::{GiveUpPolicy, GiveUpSender};
pub use streams::{MediumStreamLauncher, StreamKinds};
pub use supervisor::{
    Direction, LaunchedStream, ResourceLifecycle, ResourceRegistry, StreamDescriptor, StreamKind,
    StreamLauncher, StreamSupervisor,
};
pub use transport::{Association, RemoteTransport};
pub use transport_config::TransportSettings;
