use content_blocks::{
    ContentBlockEvent, EngineConfig, FixedHeightMeasurer, HttpFetcher, HttpFetcherConfig,
    JsonFileStorage,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let project_token = std::env::var("CONTENT_BLOCKS_PROJECT_TOKEN").unwrap();
    let api_key = std::env::var("CONTENT_BLOCKS_API_KEY").unwrap();
    let customer_id = std::env::var("CONTENT_BLOCKS_CUSTOMER_ID").unwrap();

    let fetcher_config =
        HttpFetcherConfig::new(project_token, api_key).with_customer_id("registered", customer_id);

    // Definitions are fetched by the host, personalization by the engine's fetch worker.
    let definitions = HttpFetcher::new(fetcher_config.clone())
        .fetch_definitions()
        .await
        .unwrap();

    let mut engine = EngineConfig::new()
        .with_status_storage(JsonFileStorage::new("content-block-statuses.json"))
        .with_tracking_sink(|event: ContentBlockEvent| println!("Tracked: {:?}", event))
        .start(HttpFetcher::new(fetcher_config), FixedHeightMeasurer(200.0));
    engine.load_response(definitions);

    match engine.prepare("home_top").await {
        Some(content) => {
            println!("Showing {} ({}pt): {}", content.block_id, content.height, content.html);
            engine.display_session(content.tag).unwrap();
        }
        None => println!("Nothing to show"),
    }

    engine.shutdown().await;
}
