pub mod kv;
pub mod session;
pub mod types;

pub use kv::{InMemoryKvStore, KeyValueStore};
pub use session::{detect_intent, SessionStore, DEFAULT_SESSION_TIMEOUT};
pub use types::{MemoryError, MemoryResult};
