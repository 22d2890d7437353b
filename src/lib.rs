#![doc = include_str!("../README.md")]

pub mod envelope;
pub mod inbox;
pub mod outbox;
mod relay;
pub mod scheduler;
mod sender;
pub mod topology;
pub mod transport;

#[doc(inline)]
pub use envelope::{Identity, TransportMessage};

#[doc(inline)]
pub use inbox::{DedupMode, Disposition, IdempotentConsumer, InboxState, InboxStore};

#[doc(inline)]
pub use outbox::{MarkDispatched, Outbox, OutboxError, StageMessages, StagedMessage, StreamPending};

#[doc(inline)]
pub use relay::{DefaultRelayHook, OutboxRelay, RelayHook, RelayRunError, RelayRunErrorKind};

#[doc(inline)]
pub use scheduler::{Dispatcher, ScheduledMessage, ScheduledStore, SchedulerError};

#[doc(inline)]
pub use sender::{MessageSender, SendError, SendErrorKind};

#[doc(inline)]
pub use topology::TopologyRegistry;

#[doc(inline)]
pub use transport::{HostSettings, Transport, TransportError, TransportErrorKind};
