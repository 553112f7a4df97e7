//! Offline-first data and alarm engine for a health reminder app: a local
//! cache with a durable mutation queue, an identity manager that works
//! without a network, and medication/habit alarm scheduling.

pub mod alarms;
pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
mod error;
pub mod feed;
pub mod id;
pub mod logging;
pub mod model;
pub mod queue;
pub mod records;
pub mod remote;
pub mod storage;
pub mod time;

pub use engine::{Engine, EngineParts};
pub use error::{AppError, AppResult};
