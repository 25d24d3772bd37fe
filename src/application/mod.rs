//! Application services: geometry storage, narrative caching, generation
//! coordination and request gating.

pub mod coordinator;
pub mod error;
pub mod gate;
pub mod geometry;
pub mod library;
pub mod narrative;
pub mod ports;
pub mod prompt;
pub mod repos;
