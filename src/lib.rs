//! Content-addressed cache of computed charts ("books") and the narratives
//! generated from them.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
