//! HTTP handlers, grouped by path prefix.

pub mod admin;
pub mod alerts;
pub mod chat;
pub mod context;
pub mod mapper;
pub mod publish;
pub mod ws;
