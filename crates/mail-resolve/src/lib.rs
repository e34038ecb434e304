//! The address resolver: the engine that decides, for an internalized
//! RFC 822 address, which delivery transport handles it, which host to
//! hand it to, and what the final envelope recipient looks like.

mod client;
mod hostname;
mod resolve;
mod rewrite;

pub use client::RewriteClient;
pub use hostname::valid_hostname;
pub use resolve::{
    parent_domain, resolve_addr, resolve_local, Resolution, ResolveContext, ResolveFlags,
};
pub use rewrite::{RewriteError, Rewriter, RuleRewriter, REWRITE_CANONICAL};
