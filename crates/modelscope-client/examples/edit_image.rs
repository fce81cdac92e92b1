/// Edit an image through the ModelScope Images API
///
/// Run with:
/// MODELSCOPE_TOKEN=ms-... cargo run --example edit_image --package modelscope-client -- <image-url> [prompt]
use modelscope_client::{
    BackendFactory, BackendType, ClientConfig, HttpClient, ImageSize, Result, SettingsStore,
    TaskClient, TaskRequest,
};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(image_url) = args.next() else {
        eprintln!("usage: edit_image <image-url> [prompt]");
        return Ok(());
    };
    let prompt = args.next().unwrap_or_else(|| "turn it into a watercolor painting".to_string());

    println!("=== Image Edit Example ===\n");

    let config = ClientConfig::default();
    let settings = SettingsStore::new(SettingsStore::default_path())
        .load()?
        .with_env_overrides();
    if settings.token().is_none() {
        println!("Set MODELSCOPE_TOKEN or `modelscope-cli settings set modelscope_token ...` first");
        return Ok(());
    }

    let http = HttpClient::reqwest(config.request_timeout())?;
    let backend = BackendFactory::create(BackendType::ImagesApi, &config, &settings, http);
    let client = TaskClient::new(backend, BackendFactory::poll_policy(BackendType::ImagesApi, &config));

    let request = TaskRequest::new(prompt)
        .with_image_url(image_url)
        .with_model(settings.selected_model.clone())
        .with_size(ImageSize::new(1024, 1024));

    println!("Model: {}", settings.selected_model);
    println!("Prompt: {}\n", request.prompt);

    let result = client
        .run(&request, |update| {
            println!("  [{}/{}] {}", update.attempt, update.max_attempts, update.phase);
        })
        .await?;

    println!("\n✓ {} image(s):", result.images.len());
    for url in &result.images {
        println!("  {}", url);
    }
    Ok(())
}
