//! Core data types for usage accounting

pub mod bucket;
pub mod observation;
pub mod record;
pub mod resource;
