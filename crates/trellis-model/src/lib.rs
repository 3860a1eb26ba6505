//! Trellis data model: the controlled vocabulary and the universal graph
//! message shape.
//!
//! Everything in this crate is plain data with no I/O:
//!
//! - [`taxonomy`]: concept and relation types with synonyms and
//!   multiple-inheritance "is-a" edges, plus cycle-safe ancestor walks.
//! - [`message`]: the node/edge message exchanged with every knowledge
//!   source and returned as the final query answer.
//!
//! The engine crate builds on these; nothing here depends on it.

pub mod message;
pub mod taxonomy;

pub type Name = String;

pub use message::{Edge, GraphMessage, MessageError, Node};
pub use taxonomy::{Ancestors, ConceptTaxonomy, ConceptType, RelationType, TaxonomyError};
