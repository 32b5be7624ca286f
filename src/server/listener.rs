use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::http::connection::Connection;
use crate::proxy::{ForwardingEngine, Relay, RuleSet};
use crate::static_files::StaticFiles;

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    // Rules are validated before the socket opens; a bad rule set never
    // serves a single request.
    let rules = RuleSet::from_config(&cfg.proxy)?;
    info!("Loaded {} forwarding rule(s)", rules.len());

    let engine = Arc::new(ForwardingEngine::new(Arc::new(rules), Relay::default()));
    let statics = Arc::new(StaticFiles::new(&cfg.static_files.root)?);

    let listener = TcpListener::bind(&cfg.server.listen_addr).await?;
    info!("Listening on {}", cfg.server.listen_addr);

    loop {
        let (socket, peer) = listener.accept().await?;

        let engine = engine.clone();
        let statics = statics.clone();
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, engine, statics);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
