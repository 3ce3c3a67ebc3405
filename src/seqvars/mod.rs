//! Code for working with sequence variants.

pub mod filter;
