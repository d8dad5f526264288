//! The chat client's connection state machine: a pure reducer (C8) over
//! sign-in/connect/reconnect events, a reconnect policy (C10), and a small
//! effects runtime (C9) that serializes event application and dispatches the
//! commands the reducer returns.

pub mod backoff;
pub mod command;
pub mod effects;
pub mod event;
pub mod reducer;
pub mod runtime;
pub mod state;

pub use command::Command;
pub use effects::{ErrorSink, FrameSubscriber, HttpEffects, IdentityOutcome, IdentityProvider};
pub use event::{ChannelOpenErrorKind, Event, ExchangeErrorKind, ExchangeOk, IdentitySession};
pub use reducer::reduce;
pub use runtime::{Effects, Runtime};
pub use state::{CachedSession, ClientConnState, ConnectOrigin, Pending, ReducerState};
