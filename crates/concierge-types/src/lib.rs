mod plan;
mod provider;
mod session;
mod user;

pub use plan::*;
pub use provider::*;
pub use session::*;
pub use user::*;
