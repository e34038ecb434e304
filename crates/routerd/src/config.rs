use anyhow::Context;
use mail_resolve::{parent_domain, ResolveContext};
use match_list::{DomainList, FileTable, MatchStyle, StringList, Tables};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:10025".to_string()
}

fn default_local_transport() -> String {
    "local".to_string()
}

fn default_default_transport() -> String {
    "smtp".to_string()
}

fn default_relay_transport() -> String {
    "relay".to_string()
}

fn default_virtual_transport() -> String {
    "virtual".to_string()
}

fn default_error_transport() -> String {
    "error".to_string()
}

/// The daemon configuration as it appears in the TOML file. Parameter
/// names are external contracts; unknown keys are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Defaults to the system hostname.
    pub myhostname: Option<String>,
    /// Defaults to `myhostname` minus its first label.
    pub myorigin: Option<String>,
    /// Domains this system delivers locally. Defaults to `myhostname`
    /// plus the localhost names.
    #[serde(default)]
    pub mydestination: Vec<String>,
    #[serde(default)]
    pub virtual_alias_domains: Vec<String>,
    #[serde(default)]
    pub virtual_mailbox_domains: Vec<String>,
    #[serde(default)]
    pub relay_domains: Vec<String>,
    /// Whether `relay_domains` entries also cover their subdomains.
    #[serde(default = "default_true")]
    pub relay_domains_match_subdomains: bool,
    #[serde(default)]
    pub relocated_maps: Vec<PathBuf>,
    #[serde(default)]
    pub transport_maps: Vec<PathBuf>,
    #[serde(default = "default_local_transport")]
    pub local_transport: String,
    #[serde(default = "default_default_transport")]
    pub default_transport: String,
    #[serde(default = "default_relay_transport")]
    pub relay_transport: String,
    #[serde(default = "default_virtual_transport")]
    pub virtual_transport: String,
    #[serde(default = "default_error_transport")]
    pub error_transport: String,
    #[serde(default)]
    pub relayhost: String,
    #[serde(default)]
    pub resolve_dequoted_address: bool,
    #[serde(default = "default_true")]
    pub swap_bangpath: bool,
    #[serde(default = "default_true")]
    pub allow_percent_hack: bool,
    /// The addresses this mail system listens on, for `[literal]`
    /// locality and loop detection.
    #[serde(default)]
    pub inet_interfaces: Vec<IpAddr>,
    /// Where the resolver endpoint listens.
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must be valid")
    }
}

impl RouterConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn build_context(&self) -> anyhow::Result<ResolveContext> {
        let myhostname = match &self.myhostname {
            Some(host) => host.clone(),
            None => gethostname::gethostname().to_string_lossy().into_owned(),
        };
        let mut ctx = ResolveContext::new(&myhostname);
        if let Some(origin) = &self.myorigin {
            ctx.myorigin = origin.clone();
        }

        let mydestination = if self.mydestination.is_empty() {
            vec![
                myhostname.clone(),
                format!("localhost.{}", parent_domain(&myhostname)),
                "localhost".to_string(),
            ]
        } else {
            self.mydestination.clone()
        };
        ctx.mydestination = StringList::new("mydestination", &mydestination);
        ctx.virtual_alias_domains =
            StringList::new("virtual_alias_domains", &self.virtual_alias_domains);
        ctx.virtual_mailbox_domains =
            StringList::new("virtual_mailbox_domains", &self.virtual_mailbox_domains);
        ctx.relay_domains = DomainList::new(
            "relay_domains",
            &self.relay_domains,
            if self.relay_domains_match_subdomains {
                MatchStyle::Subdomain
            } else {
                MatchStyle::Exact
            },
        );

        ctx.relocated_maps = open_tables("relocated_maps", &self.relocated_maps)?;
        ctx.transport_maps = open_tables("transport_maps", &self.transport_maps)?;

        ctx.local_transport = self.local_transport.clone();
        ctx.default_transport = self.default_transport.clone();
        ctx.relay_transport = self.relay_transport.clone();
        ctx.virtual_transport = self.virtual_transport.clone();
        ctx.error_transport = self.error_transport.clone();
        ctx.relayhost = self.relayhost.clone();
        ctx.resolve_dequoted_address = self.resolve_dequoted_address;
        ctx.swap_bangpath = self.swap_bangpath;
        ctx.allow_percent_hack = self.allow_percent_hack;
        ctx.own_addrs = self.inet_interfaces.clone();
        Ok(ctx)
    }
}

fn open_tables(name: &str, paths: &[PathBuf]) -> anyhow::Result<Tables> {
    let mut tables = Tables::new(name);
    for path in paths {
        let table = FileTable::open(path)
            .with_context(|| format!("opening {name} table {}", path.display()))?;
        tables.push(Box::new(table));
    }
    Ok(tables)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_takes_defaults() {
        let config: RouterConfig = toml::from_str(
            r#"
myhostname = "mx.example.com"
mydestination = ["example.com"]
"#,
        )
        .unwrap();
        assert_eq!(config.default_transport, "smtp");
        assert_eq!(config.listen, "127.0.0.1:10025");
        assert!(config.swap_bangpath);

        let ctx = config.build_context().unwrap();
        assert_eq!(ctx.myorigin, "example.com");
        assert_eq!(ctx.mydestination.matches("example.com"), Ok(true));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<RouterConfig>("my_hostname = \"typo.example\"").unwrap_err();
        assert!(err.to_string().contains("my_hostname"));
    }

    #[test]
    fn tables_are_loaded_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("transport");
        std::fs::write(&map, "other.org smtp:relay.example.com\n").unwrap();

        let config: RouterConfig = toml::from_str(&format!(
            r#"
myhostname = "mx.example.com"
transport_maps = [{map:?}]
"#
        ))
        .unwrap();
        let ctx = config.build_context().unwrap();
        assert_eq!(
            ctx.transport_maps.lookup("other.org").unwrap().as_deref(),
            Some("smtp:relay.example.com")
        );
    }

    #[test]
    fn missing_table_is_a_startup_error() {
        let config: RouterConfig = toml::from_str(
            r#"
myhostname = "mx.example.com"
relocated_maps = ["/nonexistent/relocated"]
"#,
        )
        .unwrap();
        assert!(config.build_context().is_err());
    }
}
