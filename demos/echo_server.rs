//! TCP echo server on the IPv6 loopback (falls back to IPv4 with `--v4`).
//!
//! ```text
//! cargo run --example echo_server
//! nc ::1 8080
//! ```

use anyhow::Context as _;
use mill_reactor::{Context, EventLoop, Handler, UnbindReason};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PORT: u16 = 8080;

struct EchoHandler {
    bytes: usize,
}

impl Handler for EchoHandler {
    fn receive_data(&mut self, ctx: &mut Context<'_>, data: &[u8]) {
        self.bytes += data.len();
        if let Err(e) = ctx.send_data(data) {
            info!(conn = %ctx.id(), error = %e, "echo failed");
        }
    }

    fn unbind(&mut self, ctx: &mut Context<'_>, reason: Option<&UnbindReason>) {
        match reason {
            Some(reason) => info!(conn = %ctx.id(), bytes = self.bytes, %reason, "client gone"),
            None => info!(conn = %ctx.id(), bytes = self.bytes, "client disconnected"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address = if std::env::args().any(|arg| arg == "--v4") {
        "127.0.0.1"
    } else {
        "::1"
    };

    let mut event_loop = EventLoop::with_defaults().context("creating event loop")?;
    let stop = event_loop.stop_handle();
    std::thread::spawn(move || {
        let mut line = String::new();
        // Enter on stdin stops the server.
        let _ = std::io::stdin().read_line(&mut line);
        let _ = stop.stop();
    });

    let server = event_loop
        .run(|reactor| reactor.start_server(address, PORT, || EchoHandler { bytes: 0 }))
        .context("event loop failed")?
        .with_context(|| format!("listening on {address}:{PORT}"))?;

    info!(addr = %server.local_addr(), "server stopped");
    Ok(())
}
