//! The accept loop: every connection gets a session slot and a thread.
//!
//! A connection that arrives when the table is full is dropped without any
//! acknowledgment; there is nothing useful to tell a client that cannot get
//! a slot.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::player::SessionRunner;
use crate::server::Server;

/// Bind the listener and spawn the accept loop thread. Binding errors are
/// returned so startup can fail with exit code 1.
pub fn spawn_listener(server: Arc<Server>) -> anyhow::Result<JoinHandle<()>> {

    let listener = TcpListener::bind(&server.cfg.listen_addr)?;
    info!("listening on {}", server.cfg.listen_addr);

    let handle = thread::Builder::new()
        .name("Listener".to_string())
        .spawn(move || accept_loop(server, listener))?;

    Ok(handle)

}

fn accept_loop(server: Arc<Server>, listener: TcpListener) {

    // Accept errors are not expected; after enough of them in a row the
    // listener gives up and the process exits non-zero.
    let mut failures = 0;
    while failures < 100 {

        let stream = match listener.accept() {
            Ok((stream, addr)) => {
                info!("accepted {addr}");
                failures = 0;
                stream
            }
            Err(e) => {
                warn!("accept failed: {e}");
                failures += 1;
                continue;
            }
        };

        if !server.running() {
            return;
        }

        let Some(session) = server.sessions.allocate() else {
            // No free slot: refuse by closing, no ack.
            warn!("connection refused, no free session slot");
            continue;
        };

        let runner = SessionRunner::new(Arc::clone(&server), Arc::clone(&session), stream);
        let spawned = thread::Builder::new()
            .name(format!("Session #{}", session.slot))
            .spawn(move || runner.run());
        if let Err(e) = spawned {
            error!("session thread spawn failed: {e}");
            server.sessions.remove(&session);
        }

    }

    error!("too many accept errors, giving up");
    std::process::exit(1);

}
