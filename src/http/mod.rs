//! HTTP intake layer.
//!
//! One catch-all axum route accepts multipart patch submissions, resolves
//! the patch byte source, and hands a job to the worker.  A 200 means
//! "accepted for asynchronous processing", never "applied"; the rendezvous
//! hand-off makes the handler block while the worker is busy, so clients
//! feel the queueing delay as request latency.

pub mod handler;

pub use handler::create_router;
