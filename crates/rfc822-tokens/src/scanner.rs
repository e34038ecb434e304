use crate::tree::{TokenId, TokenKind, TokenTree};

// Beyond the RFC 822 specials, `!` and `%` are tokenized as operators so
// that bang-path and percent routing forms can be rewritten structurally.
fn is_structural(c: char) -> bool {
    matches!(
        c,
        '@' | ',' | ';' | ':' | '.' | '<' | '>' | '(' | ')' | '[' | ']' | '!' | '%'
    )
}

fn ends_atom(c: char) -> bool {
    c.is_ascii_whitespace() || is_structural(c) || c == '"'
}

/// Append `id` either to the top-level list or to the child list of the
/// angle-bracket group currently being collected.
fn attach(tree: &mut TokenTree, group: Option<TokenId>, id: TokenId) {
    match group {
        None => tree.push(id),
        Some(addr) => {
            let a = addr.0 as usize;
            match tree.nodes[a].child_tail {
                Some(t) => {
                    tree.nodes[t.0 as usize].next = Some(id);
                    tree.nodes[id.0 as usize].prev = Some(t);
                }
                None => {
                    tree.nodes[a].child_head = Some(id);
                }
            }
            tree.nodes[a].child_tail = Some(id);
        }
    }
}

impl TokenTree {
    /// Tokenize `text` into a fresh tree.
    ///
    /// The scanner never fails: unbalanced quotes, comments, literals and
    /// angle brackets produce a best-effort token list covering what was
    /// seen.
    pub fn scan(text: &str) -> TokenTree {
        let mut tree = TokenTree::new();
        tree.append_scan(text);
        tree
    }

    /// Tokenize `text` and reduce it to the address proper: the content of
    /// the last top-level `<...>` group when one is present, else the whole
    /// list. Comments are dropped from the result.
    pub fn scan_address(text: &str) -> TokenTree {
        let mut tree = TokenTree::scan(text);

        let mut addr = None;
        let mut cur = tree.head();
        while let Some(id) = cur {
            if tree.kind(id) == TokenKind::Address {
                addr = Some(id);
            }
            cur = tree.next(id);
        }

        if let Some(id) = addr {
            let a = id.0 as usize;
            let head = tree.nodes[a].child_head;
            let tail = tree.nodes[a].child_tail;
            if let Some(h) = head {
                tree.nodes[h.0 as usize].prev = None;
            }
            tree.head = head;
            tree.tail = tail;
        }

        tree.strip_comments();
        tree
    }

    /// Tokenize `text` and append the resulting tokens to this list.
    pub fn append_scan(&mut self, text: &str) {
        let mut chars = text.chars().peekable();
        // The angle-bracket group currently being collected, if any.
        let mut group: Option<TokenId> = None;
        // Group detection: a `:` is a group opener only while everything
        // since the start (or the last `,`/`;`) has been phrase material.
        let mut phrase_only = true;
        let mut seen_word = false;

        while let Some(ch) = chars.next() {
            match ch {
                c if c.is_ascii_whitespace() => {}
                '"' => {
                    let mut content = String::new();
                    loop {
                        match chars.next() {
                            None | Some('"') => break,
                            Some('\\') => {
                                if let Some(esc) = chars.next() {
                                    content.push(esc);
                                }
                            }
                            Some(c) => content.push(c),
                        }
                    }
                    let id = self.alloc(TokenKind::QuotedString, content);
                    attach(self, group, id);
                    seen_word = true;
                }
                '(' => {
                    let mut content = String::new();
                    let mut depth = 1usize;
                    loop {
                        match chars.next() {
                            None => break,
                            Some('\\') => {
                                if let Some(esc) = chars.next() {
                                    content.push(esc);
                                }
                            }
                            Some('(') => {
                                depth += 1;
                                content.push('(');
                            }
                            Some(')') => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                                content.push(')');
                            }
                            Some(c) => content.push(c),
                        }
                    }
                    let id = self.alloc(TokenKind::Comment, content);
                    attach(self, group, id);
                }
                '[' => {
                    let id = self.alloc(TokenKind::Special('['), String::new());
                    attach(self, group, id);
                    let mut content = String::new();
                    let mut closed = false;
                    loop {
                        match chars.next() {
                            None => break,
                            Some(']') => {
                                closed = true;
                                break;
                            }
                            Some('\\') => {
                                if let Some(esc) = chars.next() {
                                    content.push(esc);
                                }
                            }
                            Some(c) => content.push(c),
                        }
                    }
                    if !content.is_empty() {
                        let id = self.alloc(TokenKind::Atom, content);
                        attach(self, group, id);
                    }
                    if closed {
                        let id = self.alloc(TokenKind::Special(']'), String::new());
                        attach(self, group, id);
                    }
                    phrase_only = false;
                }
                '<' => {
                    if group.is_none() {
                        let id = self.alloc(TokenKind::Address, String::new());
                        self.push(id);
                        group = Some(id);
                    } else {
                        // A second `<` inside a group: keep it as a plain
                        // operator rather than nesting.
                        let id = self.alloc(TokenKind::Special('<'), String::new());
                        attach(self, group, id);
                    }
                    phrase_only = false;
                }
                '>' => {
                    if group.is_some() {
                        group = None;
                    } else {
                        let id = self.alloc(TokenKind::Special('>'), String::new());
                        self.push(id);
                    }
                    phrase_only = false;
                }
                ':' => {
                    let kind = if group.is_none() && phrase_only && seen_word {
                        TokenKind::GroupStart
                    } else {
                        TokenKind::Special(':')
                    };
                    let id = self.alloc(kind, String::new());
                    attach(self, group, id);
                    phrase_only = false;
                }
                ',' | ';' => {
                    let id = self.alloc(TokenKind::Special(ch), String::new());
                    attach(self, group, id);
                    phrase_only = true;
                    seen_word = false;
                }
                '@' | '.' | ')' | '!' | '%' => {
                    let id = self.alloc(TokenKind::Special(ch), String::new());
                    attach(self, group, id);
                    phrase_only = false;
                }
                first => {
                    let mut content = String::new();
                    content.push(first);
                    while let Some(&c) = chars.peek() {
                        if ends_atom(c) {
                            break;
                        }
                        content.push(c);
                        chars.next();
                    }
                    let id = self.alloc(TokenKind::Atom, content);
                    attach(self, group, id);
                    seen_word = true;
                }
            }
        }
    }

    /// Replace the whole list with the scan of `text`. Old nodes stay in
    /// the arena until the tree is dropped.
    pub fn replace_with_scan(&mut self, text: &str) {
        self.head = None;
        self.tail = None;
        self.append_scan(text);
    }

    fn strip_comments(&mut self) {
        let mut cur = self.head;
        while let Some(id) = cur {
            let next = self.next(id);
            if self.kind(id) == TokenKind::Comment {
                self.remove(id);
            }
            cur = next;
        }
    }
}
