use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use wc_bridge::{BridgeRegistry, RegistryEvent, SessionMeta, TransactionEvents};

use crate::output::{Output, StreamLine};

#[derive(Serialize)]
struct SessionList {
    sessions: Vec<SessionMeta>,
}

/// Join the dApp's pairing URI and stay connected until Ctrl-C or until the
/// session closes.
pub async fn pair(
    uri: &str,
    account: Option<String>,
    registry: &BridgeRegistry,
    output: &Output,
) -> Result<()> {
    if account.is_none() {
        warn!("no account given, the session request will be rejected");
    }
    let mut events = registry.subscribe();
    let session_id = registry.create_session(uri, account.clone()).await?;
    output.success(
        "pair",
        json!({ "sessionId": session_id, "account": account }),
    );
    stream(registry, &mut events, Some(session_id.as_str()), false, output).await
}

pub async fn list(account: Option<&str>, registry: &BridgeRegistry, output: &Output) -> Result<()> {
    let sessions = registry.sessions(account).await?;
    output.success("list", SessionList { sessions });
    Ok(())
}

pub async fn show(id: &str, registry: &BridgeRegistry, output: &Output) -> Result<()> {
    let meta = registry.session(id).await?;
    output.success("show", meta);
    Ok(())
}

/// Tell the dApp the session is over and drop it locally.
pub async fn close(id: &str, registry: &BridgeRegistry, output: &Output) -> Result<()> {
    registry.close_session(id).await?;
    output.success("close", json!({ "sessionId": id }));
    Ok(())
}

/// Bring every stored session online and print what happens on them.
pub async fn listen(reject: bool, registry: &BridgeRegistry, output: &Output) -> Result<()> {
    let mut events = registry.subscribe();
    let count = registry.activate_all().await?;
    output.stream(StreamLine::Listening { sessions: count });
    stream(registry, &mut events, None, reject, output).await
}

async fn stream(
    registry: &BridgeRegistry,
    events: &mut broadcast::Receiver<RegistryEvent>,
    until_closed: Option<&str>,
    reject: bool,
    output: &Output,
) -> Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("missed {} registry events", missed);
                continue;
            }
            Err(RecvError::Closed) => return Ok(()),
        };

        output.stream(StreamLine::Registry(&event));

        match &event {
            RegistryEvent::Request { call, .. } if reject => {
                let request_id = call.id();
                match registry.on_transaction_rejected(request_id).await {
                    Ok(()) => output.stream(StreamLine::Rejected { request_id }),
                    Err(e) => warn!("could not reject request {}: {}", request_id, e),
                }
            }
            RegistryEvent::SessionClosed { session_id, .. }
                if until_closed == Some(session_id.as_str()) =>
            {
                return Ok(());
            }
            _ => {}
        }
    }
}
