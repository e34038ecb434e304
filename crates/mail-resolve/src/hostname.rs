pub const VALID_HOSTNAME_LEN: usize = 256;
pub const VALID_LABEL_LEN: usize = 63;

/// Syntax check for a hostname that is required to be resolvable:
/// dot-separated labels of limited length, alphanumerics plus `-` and `_`,
/// no hyphen at a label edge. One trailing root dot is tolerated.
pub fn valid_hostname(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > VALID_HOSTNAME_LEN {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= VALID_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}
