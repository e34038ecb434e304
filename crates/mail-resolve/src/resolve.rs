use crate::hostname::valid_hostname;
use crate::rewrite::{Rewriter, REWRITE_CANONICAL};
use bitflags::bitflags;
use match_list::{DomainList, MatchStyle, StringList, Tables};
use rfc822_tokens::{quote_local_part, Segment, TokenId, TokenKind, TokenTree};
use std::net::IpAddr;

const POSTMASTER: &str = "postmaster";

bitflags! {
    /// The classification and condition bits of a resolution.
    ///
    /// Exactly one of the classification bits (`LOCAL`, `ALIAS`,
    /// `VIRTUAL`, `RELAY`, `DEFAULT`) is set on a successful resolution;
    /// the low bits are orthogonal conditions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResolveFlags: u32 {
        /// The local part still carries routing operators: a
        /// source-routed delivery attempt.
        const ROUTED  = 0x0001;
        /// The address is malformed but resolvable enough to bounce.
        const ERROR   = 0x0002;
        /// A table consultation failed; the result is unusable.
        const FAIL    = 0x0004;

        const LOCAL   = 0x0100;
        const ALIAS   = 0x0200;
        const VIRTUAL = 0x0400;
        const RELAY   = 0x0800;
        const DEFAULT = 0x1000;
    }
}

impl ResolveFlags {
    pub const CLASS_MASK: ResolveFlags = ResolveFlags::LOCAL
        .union(ResolveFlags::ALIAS)
        .union(ResolveFlags::VIRTUAL)
        .union(ResolveFlags::RELAY)
        .union(ResolveFlags::DEFAULT);
}

/// Everything the resolver consults, immutable for the process lifetime.
/// Reconfiguration is a restart.
#[derive(Debug)]
pub struct ResolveContext {
    pub myhostname: String,
    /// The domain appended to addresses without one. Defaults to
    /// `myhostname` minus its first label.
    pub myorigin: String,
    pub mydestination: StringList,
    pub virtual_alias_domains: StringList,
    pub virtual_mailbox_domains: StringList,
    pub relay_domains: DomainList,
    pub relocated_maps: Tables,
    pub transport_maps: Tables,
    pub local_transport: String,
    pub default_transport: String,
    pub relay_transport: String,
    pub virtual_transport: String,
    pub error_transport: String,
    pub relayhost: String,
    pub resolve_dequoted_address: bool,
    pub swap_bangpath: bool,
    pub allow_percent_hack: bool,
    /// Addresses this mail system listens on; `[literal]` domains naming
    /// one of these are local.
    pub own_addrs: Vec<IpAddr>,
}

/// The domain part of a hostname: everything after the first label.
pub fn parent_domain(host: &str) -> &str {
    match host.split_once('.') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => host,
    }
}

impl ResolveContext {
    pub fn new(myhostname: &str) -> Self {
        Self {
            myhostname: myhostname.to_string(),
            myorigin: parent_domain(myhostname).to_string(),
            mydestination: StringList::new("mydestination", &[]),
            virtual_alias_domains: StringList::new("virtual_alias_domains", &[]),
            virtual_mailbox_domains: StringList::new("virtual_mailbox_domains", &[]),
            relay_domains: DomainList::new("relay_domains", &[], MatchStyle::Subdomain),
            relocated_maps: Tables::new("relocated_maps"),
            transport_maps: Tables::new("transport_maps"),
            local_transport: "local".to_string(),
            default_transport: "smtp".to_string(),
            relay_transport: "relay".to_string(),
            virtual_transport: "virtual".to_string(),
            error_transport: "error".to_string(),
            relayhost: String::new(),
            resolve_dequoted_address: false,
            swap_bangpath: true,
            allow_percent_hack: true,
            own_addrs: vec![],
        }
    }
}

/// Where an address should go: delivery channel, next hop, the recipient
/// in internalized form, and the classification/condition bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub transport: String,
    pub nexthop: String,
    pub recipient: String,
    pub flags: ResolveFlags,
}

/// Is the destination domain one of ours?
///
/// A `[literal]` domain is local when the literal is one of the addresses
/// we listen on; anything else is decided by `mydestination`.
pub fn resolve_local(ctx: &ResolveContext, domain: &str) -> bool {
    let domain = match domain.strip_suffix('.') {
        Some(rest) if !rest.ends_with('.') => rest,
        _ => domain,
    };

    if let Some(literal) = domain.strip_prefix('[').and_then(|d| d.strip_suffix(']')) {
        let literal = if literal.len() >= 5 && literal[..5].eq_ignore_ascii_case("ipv6:") {
            &literal[5..]
        } else {
            literal
        };
        return match literal.parse::<IpAddr>() {
            Ok(addr) => ctx.own_addrs.contains(&addr),
            Err(_) => false,
        };
    }

    ctx.mydestination.matches(domain).unwrap_or(false)
}

fn rfind_op(tree: &TokenTree, from: TokenId, op: char) -> Option<TokenId> {
    tree.rfind_kind(from, TokenKind::Special(op))
}

/// Resolve an internalized address to `(transport, nexthop, recipient,
/// flags)` according to the configured rule set.
///
/// For a fixed context the function is pure: the same address always
/// yields the same resolution, and resolving the recipient of a previous
/// resolution yields an equivalent one.
pub async fn resolve_addr(
    ctx: &ResolveContext,
    rewriter: &dyn Rewriter,
    addr: &str,
) -> Resolution {
    let mut flags = ResolveFlags::empty();
    let mut transport = String::new();
    let mut nexthop = String::new();
    let mut blame: Option<&'static str> = None;

    // The address arrives internalized, so externalize before scanning
    // unless configured otherwise. Quoting deliberately leaves `@` alone:
    // routing operators must stay visible so that user@domain@domain
    // relay attempts are caught even when forwarded by a primary MX.
    let mut tree = if ctx.resolve_dequoted_address {
        TokenTree::scan_address(addr)
    } else {
        TokenTree::scan_address(&quote_local_part(addr))
    };

    // Strip all instances of the local domain. Terminate when no
    // destination domain is left, or when the destination is remote.
    let mut saved_domain: Option<Segment> = None;
    let mut domain: Option<TokenId> = None;

    while !tree.is_empty() {
        // Strip a trailing dot at the end of the domain, but not
        // dot-dot: bogus addresses are left alone so that diagnostics
        // stay accurate.
        let tail = tree.tail().expect("non-empty tree has a tail");
        if tree.kind(tail) == TokenKind::Special('.')
            && rfind_op(&tree, tail, '@').is_some()
            && tree.prev(tail).map(|p| tree.kind(p)) != Some(TokenKind::Special('.'))
        {
            let dot = tree.sub_keep_before(tail);
            tree.free_sub(dot);
        }

        // Strip a trailing @.
        let Some(tail) = tree.tail() else { break };
        if tree.kind(tail) == TokenKind::Special('@') {
            let at = tree.sub_keep_before(tail);
            tree.free_sub(at);
            continue;
        }

        // A lone empty string becomes the postmaster.
        let head = tree.head().expect("non-empty tree has a head");
        if head == tree.tail().unwrap()
            && tree.kind(head) == TokenKind::QuotedString
            && tree.text(head).is_empty()
        {
            tree.replace_with_scan(POSTMASTER);
            if let Err(err) = rewriter.rewrite(REWRITE_CANONICAL, &mut tree).await {
                tracing::warn!("canonical rewrite failed: {err}");
            }
        }

        // Strip (and save) @domain if local.
        if let Some(at) = tree.tail().and_then(|t| rfind_op(&tree, t, '@')) {
            let domain_text = match tree.next(at) {
                Some(first) => tree.internalize_from(first),
                None => String::new(),
            };
            if !resolve_local(ctx, &domain_text) {
                domain = Some(at);
                break;
            }
            let seg = tree.sub_keep_before(at);
            if let Some(old) = saved_domain.take() {
                tree.free_sub(old);
            }
            saved_domain = Some(seg);
        }

        // After stripping the local domain, replace foo%bar by foo@bar,
        // site!user by user@site, rewrite to canonical form, and retry.
        // Otherwise we're done.
        let has_op = |op: char| {
            tree.tail()
                .and_then(|t| rfind_op(&tree, t, op))
                .is_some()
        };
        if has_op('@')
            || (ctx.swap_bangpath && has_op('!'))
            || (ctx.allow_percent_hack && has_op('%'))
        {
            if let Err(err) = rewriter.rewrite(REWRITE_CANONICAL, &mut tree).await {
                tracing::warn!("canonical rewrite failed: {err}");
                domain = None;
                break;
            }
        } else {
            domain = None;
            break;
        }
    }

    // A remote destination whose local part still contains routing
    // operators is a source-routed attempt forwarded from a primary MX.
    // The local swap_bangpath and percent_hack settings are ignored here
    // because we cannot know how the primary MX is set up.
    if let Some(at) = domain {
        if let Some(prev) = tree.prev(at) {
            if rfind_op(&tree, prev, '@').is_some()
                || rfind_op(&tree, prev, '!').is_some()
                || rfind_op(&tree, prev, '%').is_some()
            {
                flags |= ResolveFlags::ROUTED;
            }
        }
    }

    // Make sure the resolved recipient has the user@domain form. If no
    // domain was specified, assume the local machine.
    if domain.is_none() {
        match saved_domain.take() {
            Some(seg) => tree.sub_append(seg),
            None => {
                tree.append_special('@');
                tree.append_scan(&ctx.myhostname);
            }
        }
    }
    let recipient = tree.internalize();

    if let Some(at) = domain {
        // Non-local destination: classify by the lowercased domain.
        nexthop = match tree.next(at) {
            Some(first) => tree.internalize_from(first).to_ascii_lowercase(),
            None => String::new(),
        };

        let literal_shape = nexthop
            .chars()
            .all(|c| matches!(c, '[' | ']' | '.' | '0'..='9'));
        if !literal_shape && !valid_hostname(&nexthop) {
            flags |= ResolveFlags::ERROR;
        }

        match ctx.virtual_alias_domains.matches(&nexthop) {
            Ok(true) => {
                if ctx
                    .virtual_mailbox_domains
                    .matches(&nexthop)
                    .unwrap_or(false)
                {
                    tracing::warn!(
                        "do not list domain {nexthop} in BOTH \
                         virtual_alias_domains and virtual_mailbox_domains"
                    );
                }
                transport = ctx.error_transport.clone();
                nexthop = "User unknown".to_string();
                blame = Some("error_transport");
                flags |= ResolveFlags::ALIAS;
            }
            Err(err) => {
                tracing::warn!("virtual_alias_domains lookup failure: {err}");
                flags |= ResolveFlags::FAIL;
            }
            Ok(false) => {
                match ctx.virtual_mailbox_domains.matches(&nexthop) {
                    Ok(true) => {
                        transport = ctx.virtual_transport.clone();
                        blame = Some("virtual_transport");
                        flags |= ResolveFlags::VIRTUAL;
                    }
                    Err(err) => {
                        tracing::warn!("virtual_mailbox_domains lookup failure: {err}");
                        flags |= ResolveFlags::FAIL;
                    }
                    Ok(false) => match ctx.relay_domains.matches(&nexthop) {
                        Ok(true) => {
                            transport = ctx.relay_transport.clone();
                            blame = Some("relay_transport");
                            flags |= ResolveFlags::RELAY;
                        }
                        Err(err) => {
                            tracing::warn!("relay_domains lookup failure: {err}");
                            flags |= ResolveFlags::FAIL;
                        }
                        Ok(false) => {
                            transport = ctx.default_transport.clone();
                            blame = Some("default_transport");
                            flags |= ResolveFlags::DEFAULT;
                        }
                    },
                }

                // For virtual, relay and default destinations the
                // relayhost setting overrides the destination domain.
                if !flags.contains(ResolveFlags::FAIL) && !ctx.relayhost.is_empty() {
                    nexthop = ctx.relayhost.to_ascii_lowercase();
                }
            }
        }

        // A transport of the form name:destination embeds its own next
        // hop, which takes precedence over everything above.
        if let Some((chan, dest)) = transport.split_once(':') {
            let chan = chan.to_string();
            if !dest.is_empty() {
                nexthop = dest.to_string();
            }
            transport = chan;
        }
    } else {
        // Local delivery: the default local transport, with the local
        // machine as next hop unless the transport embeds one.
        if let Some(pos) = recipient.rfind('@') {
            let rcpt_domain = &recipient[pos + 1..];
            if ctx
                .virtual_alias_domains
                .matches(rcpt_domain)
                .unwrap_or(false)
            {
                tracing::warn!(
                    "do not list domain {rcpt_domain} in BOTH \
                     mydestination and virtual_alias_domains"
                );
            }
            if ctx
                .virtual_mailbox_domains
                .matches(rcpt_domain)
                .unwrap_or(false)
            {
                tracing::warn!(
                    "do not list domain {rcpt_domain} in BOTH \
                     mydestination and virtual_mailbox_domains"
                );
            }
        }
        match ctx.local_transport.split_once(':') {
            Some((chan, dest)) => {
                transport = chan.to_string();
                nexthop = if dest.is_empty() {
                    ctx.myhostname.clone()
                } else {
                    dest.to_string()
                };
            }
            None => {
                transport = ctx.local_transport.clone();
                nexthop = ctx.myhostname.clone();
            }
        }
        blame = Some("local_transport");
        flags |= ResolveFlags::LOCAL;
    }

    // Sanity checks.
    if !flags.contains(ResolveFlags::FAIL) {
        if transport.is_empty() {
            match blame {
                None => panic!("resolve_addr: null blame"),
                Some(param) => {
                    tracing::warn!("parameter {param}: null transport is not allowed");
                    flags |= ResolveFlags::FAIL;
                }
            }
        } else if nexthop.is_empty() {
            panic!("resolve_addr: null nexthop");
        }
    }

    // Bounce recipients that have moved. Doing it here rather than in a
    // delivery agent covers virtual addresses too, and needs no delivery
    // agent run just for the sake of a relocation notice.
    if !flags.contains(ResolveFlags::FAIL) && !ctx.relocated_maps.is_empty() {
        match lookup_addr(&ctx.relocated_maps, &recipient) {
            Ok(Some(newloc)) => {
                transport = ctx.error_transport.clone();
                nexthop = format!("user has moved to {newloc}");
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("relocated_maps lookup failure: {err}");
                flags |= ResolveFlags::FAIL;
            }
        }
    }

    // The transport map overrides any transport and next-hop info set up
    // above, except for the error transport: a "user has moved" or "User
    // unknown" result must never be reclassified into a deliverable one.
    if !flags.contains(ResolveFlags::FAIL)
        && !ctx.transport_maps.is_empty()
        && transport != ctx.error_transport
    {
        match transport_lookup(&ctx.transport_maps, &recipient) {
            Ok(Some(entry)) => {
                let (chan, dest) = entry.split_once(':').unwrap_or((entry.as_str(), ""));
                if !chan.is_empty() {
                    transport = chan.to_string();
                }
                if !dest.is_empty() {
                    nexthop = dest.to_string();
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("transport_maps lookup failure: {err}");
                flags |= ResolveFlags::FAIL;
            }
        }
    }

    Resolution {
        transport,
        nexthop,
        recipient,
        flags,
    }
}

/// Look up an address the way user-oriented tables are keyed: the full
/// address first, then the bare local part, then the `@domain` form.
fn lookup_addr(
    tables: &Tables,
    addr: &str,
) -> Result<Option<String>, match_list::LookupError> {
    if let Some(value) = tables.lookup(addr)? {
        return Ok(Some(value));
    }
    if let Some(pos) = addr.rfind('@') {
        let (user, domain) = (&addr[..pos], &addr[pos + 1..]);
        if let Some(value) = tables.lookup(user)? {
            return Ok(Some(value));
        }
        if let Some(value) = tables.lookup(&format!("@{domain}"))? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Transport table keying: the full address, the domain, then parent
/// domains written with a leading dot.
fn transport_lookup(
    tables: &Tables,
    addr: &str,
) -> Result<Option<String>, match_list::LookupError> {
    if let Some(value) = tables.lookup(addr)? {
        return Ok(Some(value));
    }
    if let Some(pos) = addr.rfind('@') {
        let domain = &addr[pos + 1..];
        if let Some(value) = tables.lookup(domain)? {
            return Ok(Some(value));
        }
        let mut rest = domain;
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(value) = tables.lookup(&format!(".{parent}"))? {
                return Ok(Some(value));
            }
            rest = parent;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rewrite::RuleRewriter;
    use match_list::MemTable;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn ctx() -> ResolveContext {
        let mut ctx = ResolveContext::new("mx.example.com");
        ctx.mydestination = StringList::new("mydestination", &strings(&["example.com"]));
        ctx
    }

    async fn resolve(ctx: &ResolveContext, addr: &str) -> Resolution {
        let rewriter = RuleRewriter::for_context(ctx);
        let result = resolve_addr(ctx, &rewriter, addr).await;
        check_class_invariant(&result);
        result
    }

    /// Exactly one classification bit on success; none once FAIL is set
    /// before classification, and a non-empty transport without FAIL
    /// implies a non-empty nexthop.
    fn check_class_invariant(result: &Resolution) {
        let classes = (result.flags & ResolveFlags::CLASS_MASK).bits().count_ones();
        if result.flags.contains(ResolveFlags::FAIL) {
            assert!(classes <= 1, "{result:?}");
        } else {
            assert_eq!(classes, 1, "{result:?}");
            if !result.transport.is_empty() {
                assert!(!result.nexthop.is_empty(), "{result:?}");
            }
        }
    }

    #[tokio::test]
    async fn bare_postmaster() {
        let result = resolve(&ctx(), "").await;
        assert_eq!(
            result,
            Resolution {
                transport: "local".to_string(),
                nexthop: "mx.example.com".to_string(),
                recipient: "postmaster@example.com".to_string(),
                flags: ResolveFlags::LOCAL,
            }
        );
    }

    #[tokio::test]
    async fn local_domain_strip() {
        let result = resolve(&ctx(), "alice@example.com").await;
        assert_eq!(
            result,
            Resolution {
                transport: "local".to_string(),
                nexthop: "mx.example.com".to_string(),
                recipient: "alice@example.com".to_string(),
                flags: ResolveFlags::LOCAL,
            }
        );
    }

    #[tokio::test]
    async fn remote_default() {
        let result = resolve(&ctx(), "bob@other.org").await;
        assert_eq!(
            result,
            Resolution {
                transport: "smtp".to_string(),
                nexthop: "other.org".to_string(),
                recipient: "bob@other.org".to_string(),
                flags: ResolveFlags::DEFAULT,
            }
        );
    }

    #[tokio::test]
    async fn relayhost_override() {
        let mut ctx = ctx();
        ctx.relayhost = "smart.isp.net".to_string();
        let result = resolve(&ctx, "bob@other.org").await;
        assert_eq!(result.transport, "smtp");
        assert_eq!(result.nexthop, "smart.isp.net");
        assert_eq!(result.flags, ResolveFlags::DEFAULT);
    }

    #[tokio::test]
    async fn relay_classification() {
        let mut ctx = ctx();
        ctx.relay_domains = DomainList::new(
            "relay_domains",
            &strings(&["client.org"]),
            MatchStyle::Subdomain,
        );
        let result = resolve(&ctx, "c@client.org").await;
        assert_eq!(result.transport, "relay");
        assert_eq!(result.nexthop, "client.org");
        assert_eq!(result.flags, ResolveFlags::RELAY);

        // Subdomain style covers the children too.
        let result = resolve(&ctx, "c@dept.client.org").await;
        assert_eq!(result.flags, ResolveFlags::RELAY);
    }

    #[tokio::test]
    async fn source_routed_attempt_is_flagged() {
        let result = resolve(&ctx(), "a@b.org@c.org").await;
        assert_eq!(result.recipient, "a@b.org@c.org");
        assert_eq!(result.nexthop, "c.org");
        assert_eq!(result.transport, "smtp");
        assert_eq!(result.flags, ResolveFlags::DEFAULT | ResolveFlags::ROUTED);
    }

    #[tokio::test]
    async fn channel_override_via_colon() {
        let mut ctx = ctx();
        ctx.default_transport = "smtp:relay.isp.net".to_string();
        let result = resolve(&ctx, "bob@other.org").await;
        assert_eq!(result.transport, "smtp");
        assert_eq!(result.nexthop, "relay.isp.net");

        // The channel-embedded next hop wins over relayhost.
        ctx.relayhost = "smart.isp.net".to_string();
        let result = resolve(&ctx, "bob@other.org").await;
        assert_eq!(result.nexthop, "relay.isp.net");
    }

    #[tokio::test]
    async fn percent_hack_and_bang_paths() {
        let result = resolve(&ctx(), "alice%other.org@example.com").await;
        assert_eq!(result.recipient, "alice@other.org");
        assert_eq!(result.nexthop, "other.org");
        assert_eq!(result.flags, ResolveFlags::DEFAULT);

        let result = resolve(&ctx(), "other.org!bob@example.com").await;
        assert_eq!(result.recipient, "bob@other.org");
        assert_eq!(result.flags, ResolveFlags::DEFAULT);
    }

    #[tokio::test]
    async fn disabled_percent_hack_keeps_the_operator() {
        let mut ctx = ctx();
        ctx.allow_percent_hack = false;
        ctx.swap_bangpath = false;
        let result = resolve(&ctx, "alice%other.org@example.com").await;
        // With the hack disabled the percent form is an ordinary local
        // part delivered locally.
        assert_eq!(result.recipient, "alice%other.org@example.com");
        assert_eq!(result.flags, ResolveFlags::LOCAL);
    }

    #[tokio::test]
    async fn virtual_alias_answers_user_unknown() {
        let mut ctx = ctx();
        ctx.virtual_alias_domains =
            StringList::new("virtual_alias_domains", &strings(&["virt.example"]));
        let result = resolve(&ctx, "x@virt.example").await;
        assert_eq!(result.transport, "error");
        assert_eq!(result.nexthop, "User unknown");
        assert_eq!(result.flags, ResolveFlags::ALIAS);
    }

    #[tokio::test]
    async fn virtual_mailbox_classification() {
        let mut ctx = ctx();
        ctx.virtual_mailbox_domains =
            StringList::new("virtual_mailbox_domains", &strings(&["vbox.example"]));
        let result = resolve(&ctx, "x@vbox.example").await;
        assert_eq!(result.transport, "virtual");
        assert_eq!(result.nexthop, "vbox.example");
        assert_eq!(result.flags, ResolveFlags::VIRTUAL);
    }

    #[tokio::test]
    async fn relayhost_applies_to_virtual_mailbox() {
        let mut ctx = ctx();
        ctx.virtual_mailbox_domains =
            StringList::new("virtual_mailbox_domains", &strings(&["vbox.example"]));
        ctx.relayhost = "smart.isp.net".to_string();
        let result = resolve(&ctx, "x@vbox.example").await;
        assert_eq!(result.nexthop, "smart.isp.net");
        assert_eq!(result.flags, ResolveFlags::VIRTUAL);
    }

    #[tokio::test]
    async fn relocated_users_bounce_with_the_new_location() {
        let mut ctx = ctx();
        ctx.relocated_maps = Tables::new("relocated_maps")
            .with(MemTable::new("relocated").with("carol@example.com", "carol@new.example"));
        let result = resolve(&ctx, "carol@example.com").await;
        assert_eq!(result.transport, "error");
        assert_eq!(result.nexthop, "user has moved to carol@new.example");
        assert_eq!(result.flags, ResolveFlags::LOCAL);

        // The @domain form matches any user in the domain.
        let mut ctx = self::ctx();
        ctx.relocated_maps = Tables::new("relocated_maps")
            .with(MemTable::new("relocated").with("@gone.example", "elsewhere.example"));
        let result = resolve(&ctx, "any@gone.example").await;
        assert_eq!(result.transport, "error");
        assert_eq!(result.nexthop, "user has moved to elsewhere.example");
    }

    #[tokio::test]
    async fn transport_map_overrides_transport_and_nexthop() {
        let mut ctx = ctx();
        ctx.transport_maps = Tables::new("transport_maps").with(
            MemTable::new("transport")
                .with("other.org", "relay:[gw.other.org]")
                .with(".client.org", "smtp:inner.client.org")
                .with("special.example", ":fixed.next.hop"),
        );

        let result = resolve(&ctx, "bob@other.org").await;
        assert_eq!(result.transport, "relay");
        assert_eq!(result.nexthop, "[gw.other.org]");
        assert_eq!(result.flags, ResolveFlags::DEFAULT);

        // Parent-domain entries use the leading-dot form.
        let result = resolve(&ctx, "c@sub.client.org").await;
        assert_eq!(result.transport, "smtp");
        assert_eq!(result.nexthop, "inner.client.org");

        // A value with an empty transport part only replaces the nexthop.
        let result = resolve(&ctx, "x@special.example").await;
        assert_eq!(result.transport, "smtp");
        assert_eq!(result.nexthop, "fixed.next.hop");
    }

    #[tokio::test]
    async fn error_transport_is_never_reclassified() {
        let mut ctx = ctx();
        ctx.relocated_maps = Tables::new("relocated_maps")
            .with(MemTable::new("relocated").with("gone@dest.example", "a@b.example"));
        ctx.transport_maps = Tables::new("transport_maps")
            .with(MemTable::new("transport").with("dest.example", "smtp:bypass.example"));

        let result = resolve(&ctx, "gone@dest.example").await;
        assert_eq!(result.transport, "error");
        assert_eq!(result.nexthop, "user has moved to a@b.example");

        // A non-relocated user in the same domain still gets the
        // transport override.
        let result = resolve(&ctx, "here@dest.example").await;
        assert_eq!(result.transport, "smtp");
        assert_eq!(result.nexthop, "bypass.example");
    }

    #[tokio::test]
    async fn lookup_failures_latch_fail() {
        let mut ctx = ctx();
        ctx.virtual_alias_domains =
            StringList::new("virtual_alias_domains", &strings(&["virt.example"]))
                .fail_with("table unreadable");
        let result = resolve(&ctx, "bob@other.org").await;
        assert!(result.flags.contains(ResolveFlags::FAIL));
        assert_eq!(result.transport, "");

        let mut ctx = self::ctx();
        ctx.relocated_maps = Tables::new("relocated_maps")
            .with(MemTable::new("relocated").fail_with("io timeout"));
        let result = resolve(&ctx, "alice@example.com").await;
        assert!(result.flags.contains(ResolveFlags::FAIL));

        let mut ctx = self::ctx();
        ctx.transport_maps = Tables::new("transport_maps")
            .with(MemTable::new("transport").fail_with("io timeout"));
        let result = resolve(&ctx, "bob@other.org").await;
        assert!(result.flags.contains(ResolveFlags::FAIL));
    }

    #[tokio::test]
    async fn malformed_domains_are_marked_error() {
        let result = resolve(&ctx(), "user@bad..name").await;
        assert!(result.flags.contains(ResolveFlags::ERROR));
        assert!(result.flags.contains(ResolveFlags::DEFAULT));
        assert_eq!(result.nexthop, "bad..name");
    }

    #[tokio::test]
    async fn trailing_dot_and_at_are_stripped() {
        let result = resolve(&ctx(), "user@example.com.").await;
        assert_eq!(result.recipient, "user@example.com");
        assert_eq!(result.flags, ResolveFlags::LOCAL);

        let result = resolve(&ctx(), "user@").await;
        assert_eq!(result.recipient, "user@mx.example.com");
        assert_eq!(result.flags, ResolveFlags::LOCAL);
    }

    #[tokio::test]
    async fn literal_domains_match_own_addresses() {
        let mut ctx = ctx();
        ctx.own_addrs = vec!["127.0.0.1".parse().unwrap()];
        let result = resolve(&ctx, "a@[127.0.0.1]").await;
        assert_eq!(result.recipient, "a@[127.0.0.1]");
        assert_eq!(result.flags, ResolveFlags::LOCAL);

        let result = resolve(&ctx, "a@[192.0.2.99]").await;
        assert_eq!(result.transport, "smtp");
        assert_eq!(result.nexthop, "[192.0.2.99]");
        assert_eq!(result.flags, ResolveFlags::DEFAULT);
    }

    #[tokio::test]
    async fn local_transport_colon_form() {
        let mut ctx = ctx();
        ctx.local_transport = "cyrus:lmtp.example.com".to_string();
        let result = resolve(&ctx, "alice@example.com").await;
        assert_eq!(result.transport, "cyrus");
        assert_eq!(result.nexthop, "lmtp.example.com");
        assert_eq!(result.flags, ResolveFlags::LOCAL);
    }

    #[tokio::test]
    async fn null_transport_is_a_config_failure() {
        let mut ctx = ctx();
        ctx.local_transport = String::new();
        let result = resolve(&ctx, "alice@example.com").await;
        assert!(result.flags.contains(ResolveFlags::FAIL));
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let ctx = ctx();
        for input in ["", "alice@example.com", "bob@other.org", "a%b@example.com"] {
            let first = resolve(&ctx, input).await;
            let second = resolve(&ctx, &first.recipient).await;
            assert_eq!(first.transport, second.transport, "input {input}");
            assert_eq!(first.nexthop, second.nexthop, "input {input}");
            assert_eq!(first.recipient, second.recipient, "input {input}");
        }
    }

    #[tokio::test]
    async fn quoted_locals_hide_operators_unless_dequoted() {
        // An internalized local part containing a space gets quoted on
        // externalization and survives as one token.
        let result = resolve(&ctx(), "odd local@example.com").await;
        assert_eq!(result.recipient, "odd local@example.com");
        assert_eq!(result.flags, ResolveFlags::LOCAL);
    }

    #[test]
    fn parent_domain_derivation() {
        assert_eq!(parent_domain("mx.example.com"), "example.com");
        assert_eq!(parent_domain("example.com"), "com");
        assert_eq!(parent_domain("localhost"), "localhost");
    }

    #[test]
    fn resolve_local_forms() {
        let mut ctx = ctx();
        ctx.own_addrs = vec!["192.0.2.1".parse().unwrap()];
        assert!(resolve_local(&ctx, "example.com"));
        assert!(resolve_local(&ctx, "example.com."));
        assert!(!resolve_local(&ctx, "example.com.."));
        assert!(!resolve_local(&ctx, "other.org"));
        assert!(resolve_local(&ctx, "[192.0.2.1]"));
        assert!(!resolve_local(&ctx, "[192.0.2.2]"));
        assert!(!resolve_local(&ctx, "[not-an-ip]"));
    }
}
