/// RFC 822 atom characters.
pub fn is_atext(c: char) -> bool {
    match c {
        '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '/' | '=' | '?' | '^' | '_'
        | '`' | '{' | '|' | '}' | '~' => true,
        c => c.is_ascii_alphanumeric(),
    }
}

fn local_needs_quoting(local: &str) -> bool {
    if local.is_empty() {
        return true;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return true;
    }
    // `@` is deliberately not a quoting trigger: extra routing `@`s in the
    // local part must stay visible to the resolver so that source-routed
    // relay attempts can be detected.
    local
        .chars()
        .any(|c| !(is_atext(c) || c == '.' || c == '@'))
}

/// Produce the externalized form of an internalized address: quote the
/// local part when its content requires it, leave the domain alone.
pub fn quote_local_part(addr: &str) -> String {
    let (local, domain) = match addr.rfind('@') {
        Some(pos) => (&addr[..pos], &addr[pos..]),
        None => (addr, ""),
    };

    if !local_needs_quoting(local) {
        return addr.to_string();
    }

    let mut out = String::with_capacity(addr.len() + 2);
    out.push('"');
    for ch in local.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out.push_str(domain);
    out
}
