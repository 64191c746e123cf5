//! Pack building: turn a set of objects into a pack stream.
//!
//! This is the write side of the crate, split into the same stages a
//! pack build actually goes through: [`registry`] accumulates the object
//! set, [`engine`] and [`scheduler`] find delta bases for it in
//! parallel, [`planner`] decides the order objects are emitted in, and
//! [`writer`] streams the final bytes out to a sink. [`session`] ties
//! all of it together behind one small API.

pub mod engine;
pub mod planner;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod writer;

pub use registry::ObjectRegistry;
pub use session::PackSession;
