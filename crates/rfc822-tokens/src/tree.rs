use serde::Serialize;

/// The variant of a single token.
///
/// `Special` carries one of the RFC 822 structural operators
/// `@ , ; : . < > ( ) [ ]`, or the routing operators `!` and `%`, which
/// are tokenized so that alternate address syntaxes can be rewritten
/// structurally. A `:` that terminates a group phrase is distinguished
/// as `GroupStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenKind {
    /// A bare word.
    Atom,
    /// A quoted string; the content is stored unquoted and unescaped.
    QuotedString,
    /// A parenthesized comment; the content is stored without the
    /// outer parentheses.
    Comment,
    /// An angle-bracketed address; the content is a nested token list.
    Address,
    /// The `:` introducing a group after a phrase.
    GroupStart,
    /// A single structural operator character.
    Special(char),
}

/// Stable handle to a token inside its owning [`TokenTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub(crate) u32);

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub(crate) prev: Option<TokenId>,
    pub(crate) next: Option<TokenId>,
    pub(crate) child_head: Option<TokenId>,
    pub(crate) child_tail: Option<TokenId>,
}

/// A detached run of tokens, produced by [`TokenTree::sub_keep_before`].
/// The nodes continue to live in the arena of the tree that produced them
/// and may only be re-spliced into that same tree.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub(crate) head: TokenId,
    pub(crate) tail: TokenId,
}

/// An address held as a doubly linked token list over an arena.
///
/// Detach/splice operations move handles around; nothing is freed until the
/// tree itself is dropped, so a detached [`Segment`] can simply be forgotten.
#[derive(Debug, Default)]
pub struct TokenTree {
    pub(crate) nodes: Vec<Token>,
    pub(crate) head: Option<TokenId>,
    pub(crate) tail: Option<TokenId>,
}

impl TokenTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn alloc(&mut self, kind: TokenKind, text: String) -> TokenId {
        let id = TokenId(self.nodes.len() as u32);
        self.nodes.push(Token {
            kind,
            text,
            prev: None,
            next: None,
            child_head: None,
            child_tail: None,
        });
        id
    }

    fn node(&self, id: TokenId) -> &Token {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: TokenId) -> &mut Token {
        &mut self.nodes[id.0 as usize]
    }

    pub fn head(&self) -> Option<TokenId> {
        self.head
    }

    pub fn tail(&self) -> Option<TokenId> {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn kind(&self, id: TokenId) -> TokenKind {
        self.node(id).kind
    }

    pub fn text(&self, id: TokenId) -> &str {
        &self.node(id).text
    }

    pub fn next(&self, id: TokenId) -> Option<TokenId> {
        self.node(id).next
    }

    pub fn prev(&self, id: TokenId) -> Option<TokenId> {
        self.node(id).prev
    }

    pub fn children(&self, id: TokenId) -> Option<TokenId> {
        self.node(id).child_head
    }

    /// Append an already-allocated node to the end of the top-level list.
    pub(crate) fn push(&mut self, id: TokenId) {
        match self.tail {
            Some(tail) => {
                self.node_mut(tail).next = Some(id);
                self.node_mut(id).prev = Some(tail);
            }
            None => {
                self.head = Some(id);
            }
        }
        self.node_mut(id).next = None;
        self.tail = Some(id);
    }

    /// Append a single operator token.
    pub fn append_special(&mut self, op: char) -> TokenId {
        let id = self.alloc(TokenKind::Special(op), String::new());
        self.push(id);
        id
    }

    /// Nearest token of the wanted kind at or after `from`, following
    /// `next` links.
    pub fn find_kind(&self, from: TokenId, kind: TokenKind) -> Option<TokenId> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            if self.node(id).kind == kind {
                return Some(id);
            }
            cur = self.node(id).next;
        }
        None
    }

    /// `find_kind` anchored at the list head; None on an empty list.
    pub fn find_from_head(&self, kind: TokenKind) -> Option<TokenId> {
        self.head.and_then(|head| self.find_kind(head, kind))
    }

    /// Unlink a single token from the list. The node stays in the arena.
    pub fn remove(&mut self, id: TokenId) {
        let prev = self.node(id).prev;
        let next = self.node(id).next;
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        self.node_mut(id).prev = None;
        self.node_mut(id).next = None;
    }

    /// Change a token's variant in place, keeping its position.
    pub fn set_kind(&mut self, id: TokenId, kind: TokenKind) {
        self.node_mut(id).kind = kind;
    }

    /// Nearest token of the wanted kind at or before `from`, following
    /// `prev` links.
    pub fn rfind_kind(&self, from: TokenId, kind: TokenKind) -> Option<TokenId> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            if self.node(id).kind == kind {
                return Some(id);
            }
            cur = self.node(id).prev;
        }
        None
    }

    /// `rfind_kind` anchored at the list tail; None on an empty list.
    pub fn rfind_from_tail(&self, kind: TokenKind) -> Option<TokenId> {
        self.tail.and_then(|tail| self.rfind_kind(tail, kind))
    }

    /// Detach the suffix `[pivot, tail]` from the list and return it.
    pub fn sub_keep_before(&mut self, pivot: TokenId) -> Segment {
        let seg_tail = self.tail.expect("sub_keep_before on empty list");
        let before = self.node(pivot).prev;
        self.node_mut(pivot).prev = None;
        match before {
            Some(id) => {
                self.node_mut(id).next = None;
                self.tail = Some(id);
            }
            None => {
                self.head = None;
                self.tail = None;
            }
        }
        Segment {
            head: pivot,
            tail: seg_tail,
        }
    }

    /// Splice a detached segment onto the end of the list.
    pub fn sub_append(&mut self, seg: Segment) {
        match self.tail {
            Some(tail) => {
                self.node_mut(tail).next = Some(seg.head);
                self.node_mut(seg.head).prev = Some(tail);
            }
            None => {
                self.head = Some(seg.head);
                self.node_mut(seg.head).prev = None;
            }
        }
        self.tail = Some(seg.tail);
    }

    /// Release a detached segment. The nodes stay in the arena until the
    /// tree is dropped; only the handles die here.
    pub fn free_sub(&mut self, seg: Segment) {
        let _ = seg;
    }

    /// Iterate `(kind, text)` over the top-level list.
    pub fn iter(&self) -> TokenIter<'_> {
        TokenIter {
            tree: self,
            cur: self.head,
        }
    }

    /// The internalized string form: quoted-string content raw, no quotes.
    pub fn internalize(&self) -> String {
        let mut out = String::new();
        self.render(self.head, &mut out, false);
        out
    }

    /// Internalize the sublist starting at `from` through the tail.
    pub fn internalize_from(&self, from: TokenId) -> String {
        let mut out = String::new();
        self.render(Some(from), &mut out, false);
        out
    }

    /// The externalized RFC 822 surface form: quoted strings re-quoted,
    /// `"` and `\` escaped.
    pub fn externalize(&self) -> String {
        let mut out = String::new();
        self.render(self.head, &mut out, true);
        out
    }

    fn render(&self, start: Option<TokenId>, out: &mut String, external: bool) {
        let mut needs_gap = false;
        let mut cur = start;
        while let Some(id) = cur {
            let tok = self.node(id);
            match tok.kind {
                // Comments are not part of the address proper.
                TokenKind::Comment => {}
                TokenKind::Atom => {
                    if needs_gap {
                        out.push(' ');
                    }
                    out.push_str(&tok.text);
                    needs_gap = true;
                }
                TokenKind::QuotedString => {
                    if needs_gap {
                        out.push(' ');
                    }
                    if external {
                        out.push('"');
                        for ch in tok.text.chars() {
                            if ch == '"' || ch == '\\' {
                                out.push('\\');
                            }
                            out.push(ch);
                        }
                        out.push('"');
                    } else {
                        out.push_str(&tok.text);
                    }
                    needs_gap = true;
                }
                TokenKind::GroupStart => {
                    out.push(':');
                    needs_gap = false;
                }
                TokenKind::Special(op) => {
                    out.push(op);
                    needs_gap = false;
                }
                TokenKind::Address => {
                    out.push('<');
                    self.render(tok.child_head, out, external);
                    out.push('>');
                    needs_gap = false;
                }
            }
            cur = tok.next;
        }
    }
}

pub struct TokenIter<'a> {
    tree: &'a TokenTree,
    cur: Option<TokenId>,
}

impl<'a> Iterator for TokenIter<'a> {
    type Item = (TokenKind, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let tok = &self.tree.nodes[id.0 as usize];
        self.cur = tok.next;
        Some((tok.kind, tok.text.as_str()))
    }
}
