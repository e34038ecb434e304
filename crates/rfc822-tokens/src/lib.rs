//! RFC 822 address tokens and token-list surgery.
//!
//! An address is held as a list of tokens inside a [`TokenTree`]. Nodes are
//! addressed by [`TokenId`] handles into a per-tree arena, so segments can be
//! detached and re-spliced without reference cycles, and the whole tree is
//! released in one drop at the end of a request.
//!
//! Two string forms exist for the same tree: the *internalized* form, where
//! the local part is unquoted, and the *externalized* RFC 822 surface form,
//! where quoted strings are re-quoted and escaped. `scan` of the externalized
//! form is a fixed point.

mod quote;
mod scanner;
mod tree;

pub use quote::{is_atext, quote_local_part};
pub use tree::{Segment, Token, TokenId, TokenKind, TokenTree};
