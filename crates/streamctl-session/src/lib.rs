//! Control Session (D) and Input Pipeline (E) for the GameStream control
//! channel: the three-worker protocol state machine, the bounded input
//! queue with its coalescing rules, and the [`StreamSession`] that wires
//! both to a shared [`streamctl_proto::quality::ConnectionQualityMonitor`].

pub mod config;
pub mod control;
pub mod input;
pub mod session;

pub use config::{Listener, SessionConfig, TerminationReason};
pub use control::ControlSession;
pub use input::{InputEvent, InputPipeline, KeyAction, Modifiers, MouseButtonId};
pub use session::StreamSession;
