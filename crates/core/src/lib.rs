pub mod config;
pub mod error;
pub mod route;
pub mod types;

pub use config::{Directive, DirectiveKind, INCLUDE_DEPTH_LIMIT, parse_directives, read_directives};
pub use error::{Error, Result};
pub use route::Router;
pub use types::AddressFamily;
