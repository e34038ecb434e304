use crate::resolve::ResolveContext;
use async_trait::async_trait;
use rfc822_tokens::{TokenKind, TokenTree};
use thiserror::Error;

/// The rewrite rule applied after every structural edit that can change
/// the visible address.
pub const REWRITE_CANONICAL: &str = "canonical";

#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("unknown rewrite rule {0}")]
    UnknownRule(String),
    #[error("rewrite service: {0}")]
    Service(String),
}

/// Something that can apply a named rewrite rule to an address tree:
/// either the in-process rule engine or a client talking to a rewrite
/// service.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, rule: &str, tree: &mut TokenTree) -> Result<(), RewriteError>;
}

/// The in-process rewrite rule engine.
pub struct RuleRewriter {
    myorigin: String,
    swap_bangpath: bool,
    allow_percent_hack: bool,
}

impl RuleRewriter {
    pub fn new(myorigin: &str, swap_bangpath: bool, allow_percent_hack: bool) -> Self {
        Self {
            myorigin: myorigin.to_string(),
            swap_bangpath,
            allow_percent_hack,
        }
    }

    pub fn for_context(ctx: &ResolveContext) -> Self {
        Self::new(&ctx.myorigin, ctx.swap_bangpath, ctx.allow_percent_hack)
    }

    fn canonical(&self, tree: &mut TokenTree) {
        if tree.is_empty() {
            return;
        }

        // site!user becomes user@site.
        if self.swap_bangpath && tree.rfind_from_tail(TokenKind::Special('@')).is_none() {
            if let Some(bang) = tree.find_from_head(TokenKind::Special('!')) {
                let bang_and_user = tree.sub_keep_before(bang);
                let site = tree.head().map(|h| tree.sub_keep_before(h));
                tree.sub_append(bang_and_user);
                tree.remove(bang);
                tree.append_special('@');
                if let Some(site) = site {
                    tree.sub_append(site);
                }
            }
        }

        // user%domain becomes user@domain; the rightmost % is the domain
        // separator.
        if self.allow_percent_hack && tree.rfind_from_tail(TokenKind::Special('@')).is_none() {
            if let Some(pct) = tree.rfind_from_tail(TokenKind::Special('%')) {
                tree.set_kind(pct, TokenKind::Special('@'));
            }
        }

        // Supply the origin domain when the address has none.
        match tree.tail() {
            None => {}
            Some(tail) if tree.kind(tail) == TokenKind::Special('@') => {
                tree.append_scan(&self.myorigin);
            }
            Some(tail) => {
                if tree.rfind_kind(tail, TokenKind::Special('@')).is_none() {
                    tree.append_special('@');
                    tree.append_scan(&self.myorigin);
                }
            }
        }
    }
}

#[async_trait]
impl Rewriter for RuleRewriter {
    async fn rewrite(&self, rule: &str, tree: &mut TokenTree) -> Result<(), RewriteError> {
        match rule {
            REWRITE_CANONICAL => {
                self.canonical(tree);
                Ok(())
            }
            other => Err(RewriteError::UnknownRule(other.to_string())),
        }
    }
}
