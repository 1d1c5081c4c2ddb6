pub mod pipeline;
pub mod tcp;

pub use pipeline::{CommandGroup, ConnState, Pipeline, ResultSink};
pub use tcp::ConnectionHandle;
