//! Internal tests module
//!
//! Multi-node scenarios that drive several engines (or full tokio nodes)
//! against each other with access to crate internals.
