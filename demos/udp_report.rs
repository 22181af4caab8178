//! Shows the three send-error policies on a datagram socket.
//!
//! An IPv4 socket sends to an IPv6 destination, which the OS rejects. Each policy
//! handles the rejection differently:
//!
//! - `ignore`: nothing happens
//! - `drop`: the socket is unbound with the error as reason
//! - `report`: `receive_senderror` fires and the socket stays open

use anyhow::Context as _;
use mill_reactor::{
    AsyncSocketError, Context, ErrorHandlingPolicy, EventLoop, Handler, ReactorConfig,
    UnbindReason,
};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Reporter {
    policy: ErrorHandlingPolicy,
}

impl Handler for Reporter {
    fn receive_senderror(&mut self, ctx: &mut Context<'_>, error: &AsyncSocketError) {
        let (address, port) = error.destination().unwrap_or(("?", "?"));
        warn!(
            policy = %self.policy,
            code = ?error.code(),
            flagged = ctx.is_error(),
            %address,
            %port,
            "send error reported"
        );
    }

    fn unbind(&mut self, _ctx: &mut Context<'_>, reason: Option<&UnbindReason>) {
        match reason {
            Some(reason) => info!(policy = %self.policy, %reason, "unbound"),
            None => info!(policy = %self.policy, "closed"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let policy: ErrorHandlingPolicy = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or("report")
        .parse()
        .context("policy must be one of ignore, drop or report")?;

    let config = ReactorConfig::builder().send_error_handling(policy).build();
    let mut event_loop = EventLoop::new(config).context("creating event loop")?;

    event_loop
        .run(|reactor| -> anyhow::Result<()> {
            let id = reactor.open_datagram_socket("127.0.0.1", 0, Reporter { policy })?;
            reactor.send_datagram(id, b"hello", "::1", 5555)?;
            reactor.add_timer(Duration::from_millis(200), |reactor| reactor.stop());
            Ok(())
        })
        .context("event loop failed")??;

    Ok(())
}
