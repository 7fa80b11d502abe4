//! Route handlers

pub mod autorun;
pub mod health;
