pub mod handler;
pub mod registry;

pub use handler::{Effect, SessionEvent, SessionHandle, SessionHandler, SessionState};
pub use registry::SessionRegistry;
