//! Session-level plumbing shared by every device kind

pub mod event;
