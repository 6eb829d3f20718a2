use bittorrent::{Engine, EngineConfig, TorrentConfig};

#[tokio::main]
async fn main() {
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let torrent_path = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("usage: bittorrent <path-to.torrent>");
        std::process::exit(1);
    });

    let (engine, mut events) = Engine::new(EngineConfig::default()).await.expect("failed to start engine");
    tracing::info!("listening on port {}", engine.listen_port());

    let bytes = std::fs::read(&torrent_path).expect("failed to read torrent file");
    let handle = engine
        .add_from_file_bytes(&bytes, TorrentConfig::default())
        .await
        .expect("failed to add torrent");
    tracing::info!("added torrent {:?}", handle);

    while let Some(event) = events.recv().await {
        tracing::info!("engine event: {:?}", event);
    }
}
