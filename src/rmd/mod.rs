pub mod guard;
pub mod profile;
pub mod protocol;
pub mod status;

pub use guard::*;
pub use profile::*;
pub use protocol::*;
pub use status::*;
