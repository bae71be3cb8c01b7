//! Hardware interrupt numbering and controller selection.

pub mod service;
pub mod vector;
