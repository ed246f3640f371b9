pub mod http;

pub use http::{HttpRegistrar, HttpTransfer, ProgressStream};
