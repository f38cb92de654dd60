//! Piece storage: block layout, buffer assembly, SHA-1 verification.

mod store;

pub use store::{Block, BlockRequest, BlockState, Piece};
