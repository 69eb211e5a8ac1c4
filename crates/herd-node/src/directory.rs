use crate::events::{emit, EventError, EventListing};
use herd_protocol::discovery::{is_websocket_secure, with_fallback_port};
use herd_protocol::{Directory, HttpDirectory};

/// Query every directory server and print each listed address, marking
/// which ones discovery would dial and on which fallback address.
pub async fn run(servers: &[String]) -> anyhow::Result<()> {
    anyhow::ensure!(
        !servers.is_empty(),
        "no directory servers (use --bootstrap or HERD_BOOTSTRAP_SERVERS)"
    );
    let directory = HttpDirectory::new()?;

    for server in servers {
        eprintln!("querying {server}");
        match directory.listeners(server).await {
            Ok(addrs) => print_listing(server, "listener", addrs),
            Err(e) => emit(&EventError::new(format!("listeners from {server}"), e)),
        }
        match directory.peers(server).await {
            Ok(addrs) => print_listing(server, "peer", addrs),
            Err(e) => emit(&EventError::new(format!("peers from {server}"), e)),
        }
    }
    Ok(())
}

fn print_listing(server: &str, kind: &'static str, addrs: Vec<String>) {
    for address in addrs {
        let dialable = is_websocket_secure(&address);
        let fallback = if dialable {
            with_fallback_port(&address)
        } else {
            None
        };
        emit(&EventListing {
            event: "listing",
            server: server.to_string(),
            kind,
            address,
            dialable,
            fallback,
        });
    }
}
