//! Gateway core: an OpenAI-compatible chat-completions surface fronting a
//! local CLI assistant backend and remote HTTP provider backends.
//!
//! Module map mirrors the component boundaries: [`backend`] adapts each
//! provider kind, [`pool`] bounds local concurrency, [`registry`] owns the
//! constructed adapters, [`router`] picks one per request, [`storage`]
//! backs the persisted entities ([`subscription`], [`session`], [`usage`]),
//! [`health`] and [`balancer`] allocate credentials, [`notify`] emits
//! threshold events, and [`lifecycle`] ties the whole request path
//! together behind [`http`].

pub mod backend;
pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod log_store;
pub mod notify;
pub mod pool;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod supervisor;
pub mod types;
pub mod usage;
