pub mod capture;
pub mod classifier;
pub mod config;
pub mod emitter;
pub mod flow;
pub mod http;
pub mod identity;
pub mod keylog;
pub mod logging;
pub mod ordering;
pub mod pipeline;
