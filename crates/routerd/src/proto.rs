use attr_proto::{expect_str, read_frame, write_frame, Attr, AttrError};
use mail_resolve::{resolve_addr, ResolveContext, Rewriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// Serve resolution requests on one stream until the peer goes away, a
/// framing error occurs, or shutdown is signalled between requests.
///
/// A request is exactly one `addr` attribute; anything else on the wire
/// terminates the session. The reply carries `transport`, `nexthop`,
/// `recipient` and `flags`, in that order.
pub async fn serve_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    ctx: &ResolveContext,
    rewriter: &dyn Rewriter,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AttrError> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = read_frame(&mut stream) => frame?,
        };
        let Some(attrs) = frame else {
            return Ok(());
        };

        let addr = expect_str(&attrs, 0, "addr")?;
        if let Some((name, _)) = attrs.get(1) {
            return Err(AttrError::UnexpectedAttr {
                expected: "end of request".to_string(),
                got: name.clone(),
            });
        }

        let resolution = resolve_addr(ctx, rewriter, addr).await;
        tracing::debug!(
            "`{addr}` -> (`{}` `{}` `{}` {:#x})",
            resolution.transport,
            resolution.nexthop,
            resolution.recipient,
            resolution.flags.bits(),
        );

        write_frame(
            &mut stream,
            &[
                ("transport", Attr::Str(&resolution.transport)),
                ("nexthop", Attr::Str(&resolution.nexthop)),
                ("recipient", Attr::Str(&resolution.recipient)),
                ("flags", Attr::U32(resolution.flags.bits())),
            ],
        )
        .await?;
    }
}
