//! DNS capability for the mail router: a pluggable [`Resolver`] and the
//! mail-exchanger next-hop lookup built on top of it.

use arc_swap::ArcSwap;
pub use hickory_resolver::Name;
use std::sync::{Arc, LazyLock};

mod mx;
mod resolver;

pub use mx::{domain_addr, host_addr, AddrError, MxAddress, NexthopConfig};
pub use resolver::{
    fully_qualify, Answer, DnsError, HickoryResolver, Resolver, TestResolver,
};

// The process-wide default resolver. A daemon reads its configuration
// after startup and may want to install a differently-configured backend
// at that point, so the slot is swappable; lookups already running
// against the old backend just finish there. The payload is a boxed
// trait object because the swap slot needs a sized value.
static DEFAULT_RESOLVER: LazyLock<ArcSwap<Box<dyn Resolver>>> = LazyLock::new(|| {
    ArcSwap::from_pointee(Box::new(
        HickoryResolver::new().expect("Parsing /etc/resolv.conf failed"),
    ))
});

/// Install a new process-wide default resolver.
pub fn reconfigure_resolver(resolver: impl Resolver) {
    DEFAULT_RESOLVER.store(Arc::new(Box::new(resolver)));
}

/// The current default resolver.
pub fn get_resolver() -> Arc<Box<dyn Resolver>> {
    DEFAULT_RESOLVER.load_full()
}
