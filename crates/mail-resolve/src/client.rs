use crate::rewrite::{RewriteError, Rewriter};
use async_trait::async_trait;
use attr_proto::{expect_str, read_frame, write_frame, Attr};
use rfc822_tokens::TokenTree;
use tokio::io::{AsyncRead, AsyncWrite};

struct CacheEntry {
    rule: String,
    input: String,
    output: String,
}

/// Out-of-process rewriting: ship the externalized address to a rewrite
/// service over the attribute protocol and scan what comes back.
///
/// Requests on one stream are serialized. A one-entry reply cache absorbs
/// the common case of the resolver re-canonicalizing an unchanged address.
pub struct RewriteClient<S> {
    stream: tokio::sync::Mutex<S>,
    cache: std::sync::Mutex<Option<CacheEntry>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RewriteClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: tokio::sync::Mutex::new(stream),
            cache: std::sync::Mutex::new(None),
        }
    }

    async fn call(&self, rule: &str, addr: &str) -> Result<String, RewriteError> {
        let mut stream = self.stream.lock().await;
        write_frame(
            &mut *stream,
            &[("rule", Attr::Str(rule)), ("addr", Attr::Str(addr))],
        )
        .await
        .map_err(|err| RewriteError::Service(err.to_string()))?;

        let attrs = read_frame(&mut *stream)
            .await
            .map_err(|err| RewriteError::Service(err.to_string()))?
            .ok_or_else(|| RewriteError::Service("rewrite service closed the stream".to_string()))?;
        let addr = expect_str(&attrs, 0, "addr")
            .map_err(|err| RewriteError::Service(err.to_string()))?;
        Ok(addr.to_string())
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Rewriter for RewriteClient<S> {
    async fn rewrite(&self, rule: &str, tree: &mut TokenTree) -> Result<(), RewriteError> {
        let input = tree.externalize();

        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.as_ref() {
                if entry.rule == rule && entry.input == input {
                    *tree = TokenTree::scan_address(&entry.output);
                    return Ok(());
                }
            }
        }

        let output = self.call(rule, &input).await?;
        *tree = TokenTree::scan_address(&output);
        *self.cache.lock().unwrap() = Some(CacheEntry {
            rule: rule.to_string(),
            input,
            output,
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rewrite::{RuleRewriter, REWRITE_CANONICAL};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A minimal rewrite endpoint: read `rule`/`addr`, apply the rule
    /// engine, reply with `addr`.
    async fn serve(
        mut stream: tokio::io::DuplexStream,
        rules: RuleRewriter,
        served: Arc<AtomicUsize>,
    ) {
        while let Ok(Some(attrs)) = read_frame(&mut stream).await {
            let rule = expect_str(&attrs, 0, "rule").unwrap().to_string();
            let addr = expect_str(&attrs, 1, "addr").unwrap().to_string();
            let mut tree = TokenTree::scan_address(&addr);
            rules.rewrite(&rule, &mut tree).await.unwrap();
            served.fetch_add(1, Ordering::SeqCst);
            write_frame(&mut stream, &[("addr", Attr::Str(&tree.externalize()))])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn remote_rewrite_round_trip() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        let served = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve(
            server_stream,
            RuleRewriter::new("example.com", true, true),
            served.clone(),
        ));

        let client = RewriteClient::new(client_stream);

        let mut tree = TokenTree::scan_address("other.org!bob");
        client.rewrite(REWRITE_CANONICAL, &mut tree).await.unwrap();
        assert_eq!(tree.internalize(), "bob@other.org");

        // Same input again: answered from the one-entry cache.
        let mut tree = TokenTree::scan_address("other.org!bob");
        client.rewrite(REWRITE_CANONICAL, &mut tree).await.unwrap();
        assert_eq!(tree.internalize(), "bob@other.org");
        assert_eq!(served.load(Ordering::SeqCst), 1);

        // A different input misses the cache.
        let mut tree = TokenTree::scan_address("postmaster");
        client.rewrite(REWRITE_CANONICAL, &mut tree).await.unwrap();
        assert_eq!(tree.internalize(), "postmaster@example.com");
        assert_eq!(served.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dead_service_is_an_error() {
        let (client_stream, server_stream) = tokio::io::duplex(64);
        drop(server_stream);
        let client = RewriteClient::new(client_stream);
        let mut tree = TokenTree::scan_address("a@b");
        assert!(matches!(
            client.rewrite(REWRITE_CANONICAL, &mut tree).await,
            Err(RewriteError::Service(_))
        ));
    }
}
