use crate::resolver::{fully_qualify, Answer, DnsError, Resolver};
use hickory_resolver::proto::op::response_code::ResponseCode;
use hickory_resolver::proto::rr::RecordType;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Why a next-hop lookup produced no usable addresses.
///
/// `Retry` is a soft condition: the caller should keep the mail queued and
/// come back later. `Fail` is permanent: the caller should bounce.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("{0}")]
    Retry(String),
    #[error("{0}")]
    Fail(String),
}

impl AddrError {
    /// Keep the stricter of two errors; a permanent failure outranks a
    /// soft one.
    fn merge(self, other: AddrError) -> AddrError {
        match (&self, &other) {
            (AddrError::Fail(_), _) => self,
            (_, AddrError::Fail(_)) => other,
            _ => self,
        }
    }
}

/// One candidate delivery address: the host it belongs to, the MX
/// preference it inherited, and the address itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MxAddress {
    pub name: String,
    pub pref: u16,
    pub addr: IpAddr,
}

/// Environment for next-hop lookups.
#[derive(Debug, Clone)]
pub struct NexthopConfig {
    /// The addresses this mail system is listening on, used to spot
    /// ourselves in an MX list. Both v4 and v6 addresses participate.
    pub self_addrs: Vec<IpAddr>,
    /// Bound on each individual DNS question.
    pub lookup_timeout: Duration,
}

impl Default for NexthopConfig {
    fn default() -> Self {
        Self {
            self_addrs: vec![],
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

enum Outcome {
    Answer(Answer),
    NotFound,
    Error(AddrError),
}

async fn lookup(
    resolver: &dyn Resolver,
    cfg: &NexthopConfig,
    name: &str,
    rrtype: RecordType,
) -> Outcome {
    let fq = match fully_qualify(name) {
        Ok(fq) => fq,
        Err(err) => {
            return Outcome::Error(AddrError::Fail(format!("invalid domain {name}: {err}")));
        }
    };

    match timeout(cfg.lookup_timeout, resolver.resolve(fq, rrtype)).await {
        Err(_) => Outcome::Error(AddrError::Retry(format!(
            "DNS {rrtype} lookup for {name} timed out"
        ))),
        Ok(Err(DnsError::InvalidName(why))) => Outcome::Error(AddrError::Fail(why)),
        Ok(Err(DnsError::ResolveFailed(why))) => Outcome::Error(AddrError::Retry(why)),
        Ok(Ok(answer)) => {
            if answer.response_code == ResponseCode::Refused {
                Outcome::Error(AddrError::Fail(format!(
                    "DNS {rrtype} lookup for {name} was refused"
                )))
            } else if answer.nxdomain || answer.records.is_empty() {
                Outcome::NotFound
            } else {
                Outcome::Answer(answer)
            }
        }
    }
}

/// Interpret `host` as an IP literal: a bare address, or one wrapped in
/// square brackets, optionally carrying the `IPv6:` tag.
fn parse_literal(host: &str) -> Option<IpAddr> {
    let body = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let body = if body.len() >= 5 && body[..5].eq_ignore_ascii_case("ipv6:") {
        &body[5..]
    } else {
        body
    };
    // MX exchange names arrive fully qualified; a trailing root dot must
    // not defeat literal detection.
    let body = body.strip_suffix('.').unwrap_or(body);
    body.parse().ok()
}

/// Look up the addresses of one host and stamp them with `pref`.
/// A and AAAA answers both contribute, in that order.
async fn addr_one(
    resolver: &dyn Resolver,
    cfg: &NexthopConfig,
    host: &str,
    pref: u16,
) -> Result<Vec<MxAddress>, AddrError> {
    if let Some(addr) = parse_literal(host) {
        return Ok(vec![MxAddress {
            name: host.to_string(),
            pref,
            addr,
        }]);
    }

    let mut list = vec![];
    let mut soft = false;

    for rrtype in [RecordType::A, RecordType::AAAA] {
        match lookup(resolver, cfg, host, rrtype).await {
            Outcome::Answer(answer) => {
                for addr in answer.as_addr() {
                    list.push(MxAddress {
                        name: host.to_string(),
                        pref,
                        addr,
                    });
                }
            }
            Outcome::NotFound => {}
            Outcome::Error(AddrError::Retry(why)) => {
                tracing::debug!("address lookup for {host}: {why}");
                soft = true;
            }
            Outcome::Error(err @ AddrError::Fail(_)) => return Err(err),
        }
    }

    if list.is_empty() {
        if soft {
            return Err(AddrError::Retry(format!(
                "address lookup for {host} failed temporarily"
            )));
        }
        return Err(AddrError::Fail(format!("no address records for {host}")));
    }
    Ok(list)
}

/// Truncate an address list at the first entry belonging to this mail
/// system: anything at our own preference or worse would loop the mail
/// back to us.
fn truncate_self(
    list: Vec<MxAddress>,
    cfg: &NexthopConfig,
    name: &str,
) -> Result<Vec<MxAddress>, AddrError> {
    let self_pref = match list
        .iter()
        .find(|entry| cfg.self_addrs.contains(&entry.addr))
    {
        Some(entry) => {
            tracing::debug!("found myself in the MX list of {name} at pref {}", entry.pref);
            entry.pref
        }
        None => return Ok(list),
    };

    let keep: Vec<MxAddress> = list
        .into_iter()
        .filter(|entry| entry.pref < self_pref)
        .collect();

    if keep.is_empty() {
        return Err(AddrError::Fail(format!(
            "mail for {name} loops back to myself"
        )));
    }
    Ok(keep)
}

/// Mail-exchanger resolution for a destination domain.
///
/// Returns the candidate addresses in most-preferred-first order,
/// truncated so that only hosts more preferred than this mail system
/// itself remain. When the domain has no MX records at all, falls through
/// to a plain host lookup.
pub async fn domain_addr(
    resolver: &dyn Resolver,
    cfg: &NexthopConfig,
    name: &str,
) -> Result<Vec<MxAddress>, AddrError> {
    let answer = match lookup(resolver, cfg, name, RecordType::MX).await {
        Outcome::Error(err) => return Err(err),
        Outcome::NotFound => return host_addr(resolver, cfg, name).await,
        Outcome::Answer(answer) => answer,
    };

    let mut mx_hosts = answer.as_mx();
    mx_hosts.sort_by_key(|(pref, _)| *pref);

    // As long as we are able to look up any host address, we ignore
    // problems with individual exchangers.
    let mut list = vec![];
    let mut worst: Option<AddrError> = None;
    for (pref, host) in &mx_hosts {
        match addr_one(resolver, cfg, host, *pref).await {
            Ok(addrs) => list.extend(addrs),
            Err(err) => {
                worst = Some(match worst.take() {
                    Some(seen) => seen.merge(err),
                    None => err,
                });
            }
        }
    }

    if list.is_empty() {
        return Err(worst.unwrap_or_else(|| {
            AddrError::Retry(format!("no mail exchanger of {name} has any address"))
        }));
    }

    truncate_self(list, cfg, name)
}

/// Host-form resolution: the nexthop names a host rather than a domain,
/// so no MX processing applies.
pub async fn host_addr(
    resolver: &dyn Resolver,
    cfg: &NexthopConfig,
    host: &str,
) -> Result<Vec<MxAddress>, AddrError> {
    addr_one(resolver, cfg, host, 0).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::TestResolver;
    use std::net::Ipv4Addr;

    fn cfg_with_self(addrs: &[&str]) -> NexthopConfig {
        NexthopConfig {
            self_addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
            ..NexthopConfig::default()
        }
    }

    fn two_mx_zone() -> TestResolver {
        TestResolver::default().with_zone(
            r#"
$ORIGIN t.org.
t.org.  600 IN MX 20 backup.t.org.
t.org.  600 IN MX 10 mx.example.com.
backup  600 IN A 192.0.2.20
"#,
        )
        .with_zone(
            r#"
$ORIGIN mx.example.com.
mx.example.com. 600 IN A 192.0.2.1
"#,
        )
    }

    #[tokio::test]
    async fn orders_by_preference() {
        let resolver = two_mx_zone();
        let cfg = NexthopConfig::default();
        let list = domain_addr(&resolver, &cfg, "t.org").await.unwrap();
        k9::snapshot!(
            &list,
            r#"
[
    MxAddress {
        name: "mx.example.com.",
        pref: 10,
        addr: 192.0.2.1,
    },
    MxAddress {
        name: "backup.t.org.",
        pref: 20,
        addr: 192.0.2.20,
    },
]
"#
        );
    }

    #[tokio::test]
    async fn truncates_at_self_preference() {
        let resolver = two_mx_zone();
        // We are backup.t.org: only the more-preferred exchanger survives.
        let cfg = cfg_with_self(&["192.0.2.20"]);
        let list = domain_addr(&resolver, &cfg, "t.org").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "mx.example.com.");
        assert_eq!(list[0].pref, 10);
    }

    #[tokio::test]
    async fn loop_to_self_is_permanent() {
        let resolver = two_mx_zone();
        // We are the primary: nothing is more preferred than us.
        let cfg = cfg_with_self(&["192.0.2.1"]);
        let err = domain_addr(&resolver, &cfg, "t.org").await.unwrap_err();
        assert_eq!(
            err,
            AddrError::Fail("mail for t.org loops back to myself".to_string())
        );
    }

    #[tokio::test]
    async fn no_mx_falls_back_to_host_lookup() {
        let resolver = TestResolver::default().with_zone(
            r#"
$ORIGIN plain.example.
plain.example. 600 IN A 192.0.2.77
"#,
        );
        let cfg = NexthopConfig::default();
        let list = domain_addr(&resolver, &cfg, "plain.example").await.unwrap();
        assert_eq!(
            list,
            vec![MxAddress {
                name: "plain.example".to_string(),
                pref: 0,
                addr: Ipv4Addr::new(192, 0, 2, 77).into(),
            }]
        );
    }

    #[tokio::test]
    async fn refused_is_permanent_soft_failure_is_retryable() {
        let resolver = TestResolver::default()
            .with_response_code("refused.example", ResponseCode::Refused)
            .with_soft_failure("flaky.example");
        let cfg = NexthopConfig::default();

        let err = domain_addr(&resolver, &cfg, "refused.example")
            .await
            .unwrap_err();
        assert!(matches!(err, AddrError::Fail(_)));

        let err = domain_addr(&resolver, &cfg, "flaky.example")
            .await
            .unwrap_err();
        assert!(matches!(err, AddrError::Retry(_)));
    }

    #[tokio::test]
    async fn nonexistent_host_fails() {
        let resolver = TestResolver::default();
        let cfg = NexthopConfig::default();
        let err = host_addr(&resolver, &cfg, "ghost.example").await.unwrap_err();
        assert!(matches!(err, AddrError::Fail(_)));
    }

    #[tokio::test]
    async fn literal_hosts_skip_dns() {
        let resolver = TestResolver::default();
        let cfg = NexthopConfig::default();

        let list = host_addr(&resolver, &cfg, "192.0.2.9").await.unwrap();
        assert_eq!(list[0].addr, IpAddr::from(Ipv4Addr::new(192, 0, 2, 9)));
        assert_eq!(list[0].pref, 0);

        let list = host_addr(&resolver, &cfg, "[IPv6:::1]").await.unwrap();
        assert_eq!(list[0].addr, "::1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn literal_mx_target_contributes_its_address() {
        let resolver = TestResolver::default().with_zone(
            r#"
$ORIGIN lit.example.
lit.example. 600 IN MX 5 1.2.3.4.
"#,
        );
        let cfg = NexthopConfig::default();
        let list = domain_addr(&resolver, &cfg, "lit.example").await.unwrap();
        assert_eq!(
            list,
            vec![MxAddress {
                name: "1.2.3.4.".to_string(),
                pref: 5,
                addr: Ipv4Addr::new(1, 2, 3, 4).into(),
            }]
        );
    }

    #[tokio::test]
    async fn partial_exchanger_failure_is_tolerated() {
        let resolver = TestResolver::default()
            .with_zone(
                r#"
$ORIGIN p.example.
p.example. 600 IN MX 10 dead.p.example.
p.example. 600 IN MX 20 live.p.example.
live       600 IN A 192.0.2.30
"#,
            )
            .with_soft_failure("dead.p.example");
        let cfg = NexthopConfig::default();
        let list = domain_addr(&resolver, &cfg, "p.example").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "live.p.example.");
    }

    #[cfg(feature = "live-dns-tests")]
    #[tokio::test]
    async fn live_lookup() {
        let resolver = crate::resolver::HickoryResolver::new().unwrap();
        let cfg = NexthopConfig::default();
        let list = domain_addr(&resolver, &cfg, "gmail.com").await.unwrap();
        assert!(!list.is_empty());
        assert!(list.windows(2).all(|w| w[0].pref <= w[1].pref));
    }
}
