//! Runs a whole in-process world: one tokio task per node over
//! [`LocalWorld`] transports.

use std::future::Future;

use futures::{stream::FuturesUnordered, StreamExt};
use tracing::{debug_span, Instrument};

use crate::{
    registry::{HandlerRegistry, RegistryBuilder},
    Error, LocalWorld, NodeId, Runtime, RuntimeConfig, Transport,
};

/// Launches `num_nodes` nodes and waits for all of them.
///
/// `build` registers the application's handlers and runs once per node, so
/// every node gets the same registry; whatever it returns (usually the typed
/// handles) is passed to that node's `body`. The first node to fail or panic
/// aborts the others, and its error or panic is re-raised here.
pub async fn launch<B, H, F, Fut>(
    num_nodes: NodeId,
    config: RuntimeConfig,
    build: B,
    body: F,
) -> Result<(), Error>
where
    B: Fn(&mut RegistryBuilder) -> H,
    F: Fn(Runtime, H) -> Fut,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let mut running: FuturesUnordered<_> = LocalWorld::endpoints(num_nodes)
        .into_iter()
        .map(|transport| {
            let node = transport.this_node();
            let mut builder = HandlerRegistry::builder();
            let handles = build(&mut builder);
            let rt = Runtime::new(config.clone(), transport, builder.build());
            tokio::spawn(body(rt, handles).instrument(debug_span!("world", node)))
        })
        .collect();

    while let Some(joined) = running.next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => Err(e),
            Err(e) => Ok(e),
        };
        for handle in running.iter() {
            handle.abort();
        }
        match failure {
            Err(e) => Err(e)?,
            Ok(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Ok(_) => Err(Error::Aborted)?,
        }
    }
    Ok(())
}

/// Installs a test-friendly subscriber once per process.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}
