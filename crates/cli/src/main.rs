use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use modelscope_client::catalog::{presets, ResolutionTier};
use modelscope_client::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modelscope-cli")]
#[command(about = "ModelScope image client - submit, poll and caption image tasks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Client configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Edit images with an instruction through the ModelScope Images API
    Edit {
        /// Edit instruction (falls back to the saved custom prompt)
        prompt: Option<String>,

        /// Source image URLs
        #[arg(short, long = "image-url", required = true)]
        image_urls: Vec<String>,

        /// Model id (defaults to the selected model)
        #[arg(short, long)]
        model: Option<String>,

        /// Output size, e.g. 1024x1024
        #[arg(long)]
        size: Option<String>,

        #[arg(long)]
        negative: Option<String>,

        #[arg(long)]
        seed: Option<i64>,

        /// Send only model, prompt, size and image URLs
        #[arg(long)]
        quick: bool,
    },

    /// Generate images from a prompt
    Generate {
        prompt: String,

        /// Backend (muse, images-api, local)
        #[arg(short, long, default_value = "muse")]
        backend: String,

        /// Output size, e.g. 1328x1328
        #[arg(long, conflicts_with = "ratio")]
        size: Option<String>,

        /// Aspect ratio preset, e.g. 16:9
        #[arg(long)]
        ratio: Option<String>,

        /// Resolution tier for --ratio (sm, hd, 2k)
        #[arg(long, default_value = "hd")]
        tier: String,

        /// LoRA as ID or ID:SCALE, repeatable
        #[arg(long = "lora")]
        loras: Vec<String>,

        /// Checkpoint name from the model catalog
        #[arg(long)]
        checkpoint: Option<String>,

        #[arg(short, long)]
        num_images: Option<u32>,

        #[arg(long)]
        seed: Option<i64>,

        /// Skip the hires fix pass
        #[arg(long)]
        no_hires: bool,
    },

    /// Upload an image, caption it and generate from the caption
    Process {
        /// Image file
        file: Option<PathBuf>,

        /// Image URL instead of a file
        #[arg(long, conflicts_with = "file")]
        url: Option<String>,

        /// Backend for the generation step (muse, images-api, local)
        #[arg(short, long, default_value = "local")]
        backend: String,

        /// Caption with the vision chat API instead of the local service
        #[arg(long)]
        vision: bool,

        /// Prompt prefix put before the caption
        #[arg(long)]
        prefix: Option<String>,

        /// Let the local service run every stage in one call
        #[arg(long, conflicts_with_all = ["url", "vision"])]
        one_shot: bool,
    },

    /// Caption an image
    Analyze {
        file: Option<PathBuf>,

        #[arg(long, conflicts_with = "file")]
        url: Option<String>,

        /// Use the vision chat API instead of the local service
        #[arg(long)]
        vision: bool,

        /// Custom vision instruction
        #[arg(long)]
        instruction: Option<String>,
    },

    /// Fetch the status of a task once
    Status {
        task_id: String,

        #[arg(short, long, default_value = "images-api")]
        backend: String,
    },

    /// List checkpoints, LoRAs and size presets
    Models {
        /// Fetch the catalog from the local service
        #[arg(long, conflicts_with = "dir")]
        remote: bool,

        /// Directory holding checkpoint.json and loraArgs.json
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Check that the local service is reachable
    Health,

    /// Show or change persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print settings with credentials masked
    Show,
    /// Set one value
    Set { key: String, value: String },
    /// Restore defaults
    Reset,
    /// Print the settings file location
    Path,
}

/// Loaded once per invocation
struct App {
    config: ClientConfig,
    settings: Settings,
    store: SettingsStore,
}

impl App {
    fn load(config: Option<PathBuf>, settings: Option<PathBuf>) -> Result<Self> {
        let config = match config {
            Some(path) => ClientConfig::load(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => ClientConfig::default(),
        };
        let store = SettingsStore::new(settings.unwrap_or_else(SettingsStore::default_path));
        let settings = store
            .load()
            .with_context(|| format!("failed to load settings {}", store.path().display()))?
            .with_env_overrides();
        Ok(Self {
            config,
            settings,
            store,
        })
    }

    fn http(&self) -> Result<HttpClient> {
        Ok(HttpClient::reqwest(self.config.request_timeout())?)
    }

    fn local_service(&self) -> Result<Arc<LocalService>> {
        Ok(Arc::new(LocalService::from_config(
            &self.config,
            &self.settings,
            self.http()?,
        )))
    }

    fn task_client(&self, backend_type: BackendType) -> Result<Arc<TaskClient>> {
        let backend = BackendFactory::create(backend_type, &self.config, &self.settings, self.http()?);
        let policy = BackendFactory::poll_policy(backend_type, &self.config);
        Ok(Arc::new(TaskClient::new(backend, policy)))
    }

    fn analyzer(&self, vision: bool, instruction: Option<String>) -> Result<Arc<dyn ImageAnalyzer>> {
        if vision {
            let mut analyzer = VisionChatAnalyzer::from_config(&self.config, &self.settings, self.http()?);
            if let Some(instruction) = instruction {
                analyzer = analyzer.with_instruction(instruction);
            }
            Ok(Arc::new(analyzer))
        } else {
            Ok(Arc::new(
                LocalAnalyzer::new(self.local_service()?)
                    .with_max_chars(self.config.vision.max_caption_chars),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let ctx = App::load(cli.config, cli.settings)?;

    match cli.command {
        Commands::Edit {
            prompt,
            image_urls,
            model,
            size,
            negative,
            seed,
            quick,
        } => edit_command(&ctx, prompt, image_urls, model, size, negative, seed, quick).await,
        Commands::Generate {
            prompt,
            backend,
            size,
            ratio,
            tier,
            loras,
            checkpoint,
            num_images,
            seed,
            no_hires,
        } => {
            let size = resolve_size(size, ratio, &tier)?;
            generate_command(&ctx, prompt, &backend, size, loras, checkpoint, num_images, seed, no_hires)
                .await
        }
        Commands::Process {
            file,
            url,
            backend,
            vision,
            prefix,
            one_shot,
        } => process_command(&ctx, file, url, &backend, vision, prefix, one_shot).await,
        Commands::Analyze {
            file,
            url,
            vision,
            instruction,
        } => analyze_command(&ctx, file, url, vision, instruction).await,
        Commands::Status { task_id, backend } => status_command(&ctx, &task_id, &backend).await,
        Commands::Models { remote, dir } => models_command(&ctx, remote, dir).await,
        Commands::Health => health_command(&ctx).await,
        Commands::Settings { action } => settings_command(ctx, action),
    }
}

#[allow(clippy::too_many_arguments)]
async fn edit_command(
    ctx: &App,
    prompt: Option<String>,
    image_urls: Vec<String>,
    model: Option<String>,
    size: Option<String>,
    negative: Option<String>,
    seed: Option<i64>,
    quick: bool,
) -> Result<()> {
    let prompt = prompt.unwrap_or_else(|| ctx.settings.custom_prompt.clone());
    let size = match size {
        Some(s) => s.parse::<ImageSize>()?,
        None => ctx.settings.edit_size,
    };

    let mut request = TaskRequest::new(prompt)
        .with_size(size)
        .with_model(model.unwrap_or_else(|| ctx.settings.selected_model.clone()));
    for url in image_urls {
        request = request.with_image_url(url);
    }
    if let Some(negative) = negative {
        request = request.with_negative_prompt(negative);
    }
    if let Some(seed) = seed {
        request = request.with_seed(seed);
    }
    if quick {
        request = request.quick();
    }

    info!("Editing {} image(s) at {}", request.image_urls.len(), size);
    let client = ctx.task_client(BackendType::ImagesApi)?;
    let result = run_task(client, request).await?;
    print_result(&result);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn generate_command(
    ctx: &App,
    prompt: String,
    backend: &str,
    size: Option<ImageSize>,
    loras: Vec<String>,
    checkpoint: Option<String>,
    num_images: Option<u32>,
    seed: Option<i64>,
    no_hires: bool,
) -> Result<()> {
    let backend_type: BackendType = backend.parse()?;
    let mut request = TaskRequest::new(prompt);
    if let Some(size) = size {
        request = request.with_size(size);
    }
    for lora in &loras {
        request = request.with_lora(lora.parse()?);
    }
    if let Some(name) = checkpoint {
        let catalog = ModelCatalog::default();
        let checkpoint = catalog
            .checkpoint(&name)
            .with_context(|| format!("unknown checkpoint '{name}'"))?;
        request = request.with_checkpoint(checkpoint.clone());
    }
    if let Some(n) = num_images {
        request = request.with_num_images(n);
    }
    if let Some(seed) = seed {
        request = request.with_seed(seed);
    }
    if no_hires {
        request.enable_hires = Some(false);
    }

    let client = ctx.task_client(backend_type)?;
    info!("Generating through {}", client.backend().name());
    let result = run_task(client, request).await?;
    print_result(&result);
    Ok(())
}

async fn process_command(
    ctx: &App,
    file: Option<PathBuf>,
    url: Option<String>,
    backend: &str,
    vision: bool,
    prefix: Option<String>,
    one_shot: bool,
) -> Result<()> {
    if one_shot {
        let path = file.context("--one-shot needs an image file")?;
        return process_one_shot(ctx, &path).await;
    }

    let input = match (file, url) {
        (Some(path), _) => PipelineInput::File(read_file(&path).await?),
        (None, Some(url)) => PipelineInput::Url(url),
        (None, None) => bail!("pass an image file or --url"),
    };

    let client = ctx.task_client(backend.parse()?)?;
    let bar = spinner();
    let template = TaskRequest::new(prefix.unwrap_or_default());

    let mut pipeline = Pipeline::new(ctx.analyzer(vision, None)?, client)
        .with_template(template)
        .with_observer(Arc::new(BarObserver(bar.clone())));
    if !vision {
        pipeline = pipeline.with_uploader(ctx.local_service()?);
    }
    let pipeline = Arc::new(pipeline);

    let watcher = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                pipeline.cancel();
            }
        })
    };
    let outcome = pipeline.run(input).await;
    watcher.abort();
    bar.finish_and_clear();

    let output = outcome.context("pipeline failed")?;
    println!("Caption: {}", output.caption.text);
    println!("Task:    {}", output.task_id);
    print_result(&output.result);
    Ok(())
}

async fn process_one_shot(ctx: &App, path: &Path) -> Result<()> {
    let file = read_file(path).await?;
    let service = ctx.local_service()?;
    let bar = upload_bar(file.len());

    let progress: ProgressFn = {
        let bar = bar.clone();
        Arc::new(move |p: UploadProgress| bar.set_position(p.sent))
    };
    let request = TaskRequest::default();
    let result = service
        .process_image_complete(file, &request, Some(progress))
        .await
        .context("local service processing failed")?;
    bar.finish_and_clear();

    if let Some(prompt) = &result.prompt {
        println!("Caption: {}", prompt);
    }
    print_result(&result);
    Ok(())
}

async fn analyze_command(
    ctx: &App,
    file: Option<PathBuf>,
    url: Option<String>,
    vision: bool,
    instruction: Option<String>,
) -> Result<()> {
    let analyzer = ctx.analyzer(vision, instruction)?;
    let source = match (file, url) {
        (Some(path), _) => {
            let file = read_file(&path).await?;
            if vision {
                ImageSource::File(file)
            } else {
                ImageSource::Uploaded(ctx.local_service()?.upload(file, None).await?)
            }
        }
        (None, Some(url)) => ImageSource::Url(url),
        (None, None) => bail!("pass an image file or --url"),
    };

    let caption = analyzer.analyze(&source).await.context("analysis failed")?;
    info!("Caption from {}", caption.provider);
    println!("{}", caption.text);
    Ok(())
}

async fn status_command(ctx: &App, task_id: &str, backend: &str) -> Result<()> {
    let client = ctx.task_client(backend.parse()?)?;
    let report = client
        .status(task_id)
        .await
        .with_context(|| format!("failed to fetch status of {task_id}"))?;

    println!("Task {}: {}", task_id, report.status.phase());
    if let Some(percent) = report.percent {
        println!("  progress: {:.0}%", percent);
    }
    if let Some(detail) = &report.detail {
        println!("  {}", detail);
    }
    match &report.status {
        TaskStatus::Completed(result) => print_result(result),
        TaskStatus::Failed(reason) => println!("  reason: {}", reason),
        _ => {}
    }
    Ok(())
}

async fn models_command(ctx: &App, remote: bool, dir: Option<PathBuf>) -> Result<()> {
    let catalog = match dir {
        Some(dir) => ModelCatalog::load_dir(&dir),
        None if remote => ctx.local_service()?.catalog().await,
        None => ModelCatalog::default(),
    };

    println!("Checkpoints:");
    for checkpoint in &catalog.checkpoints {
        println!(
            "  {:<28} {:>8}  steps {:>2}  cfg {:.1}",
            checkpoint.show_info,
            checkpoint.model_version_id,
            checkpoint.num_inference_steps,
            checkpoint.guidance_scale
        );
    }

    println!("LoRAs:");
    for lora in &catalog.loras {
        println!(
            "  {:<28} {:>8}  scale {:.2}",
            lora.name.as_deref().unwrap_or("-"),
            lora.model_version_id,
            lora.scale
        );
    }

    for tier in [ResolutionTier::Sm, ResolutionTier::Hd, ResolutionTier::TwoK] {
        let sizes: Vec<String> = presets(tier)
            .into_iter()
            .map(|(ratio, size)| format!("{ratio}={size}"))
            .collect();
        println!("{} sizes: {}", tier, sizes.join("  "));
    }
    Ok(())
}

async fn health_command(ctx: &App) -> Result<()> {
    let service = ctx.local_service()?;
    match service.health().await {
        Ok(health) if health.success => {
            println!("{} is up: {}", service.base_url(), health.status);
            Ok(())
        }
        Ok(health) => bail!("{} reported a problem: {}", service.base_url(), health.message),
        Err(e) => Err(e).with_context(|| format!("{} is unreachable", service.base_url())),
    }
}

fn settings_command(app: App, action: SettingsAction) -> Result<()> {
    let store = app.store;
    match action {
        SettingsAction::Show => {
            // Reload so environment overrides are not shown as stored values
            let settings = store.load()?.redacted();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsAction::Set { key, value } => {
            let mut settings = store.load()?;
            settings.set(&key, &value)?;
            store.save(&settings)?;
            println!("{} updated", key);
        }
        SettingsAction::Reset => {
            store.reset()?;
            println!("Settings reset to defaults");
        }
        SettingsAction::Path => println!("{}", store.path().display()),
    }
    Ok(())
}

/// Submit, poll with a spinner, and cancel on Ctrl-C
async fn run_task(client: Arc<TaskClient>, request: TaskRequest) -> Result<TaskResult> {
    let bar = spinner();
    bar.set_message("submitting");

    let watcher = {
        let client = client.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                client.cancel();
            }
        })
    };

    let progress_bar = bar.clone();
    let outcome = client
        .run(&request, move |update| progress_bar.set_message(describe(update)))
        .await;
    watcher.abort();
    bar.finish_and_clear();

    outcome.context("task did not complete")
}

fn describe(update: &ProgressUpdate) -> String {
    let mut message = format!(
        "{} {} ({}/{})",
        update.task_id, update.phase, update.attempt, update.max_attempts
    );
    if let Some(percent) = update.percent {
        message.push_str(&format!(" {:.0}%", percent));
    }
    if let Some(detail) = &update.detail {
        message.push_str(&format!(" - {}", detail));
    }
    message
}

fn print_result(result: &TaskResult) {
    println!("{} image(s):", result.images.len());
    for url in &result.images {
        println!("  {}", url);
    }
}

fn resolve_size(size: Option<String>, ratio: Option<String>, tier: &str) -> Result<Option<ImageSize>> {
    if let Some(size) = size {
        return Ok(Some(size.parse()?));
    }
    match ratio {
        Some(ratio) => {
            let tier: ResolutionTier = tier.parse()?;
            let size = catalog::preset(tier, &ratio)
                .with_context(|| format!("no {tier} preset for ratio {ratio}"))?;
            Ok(Some(size))
        }
        None => Ok(None),
    }
}

async fn read_file(path: &Path) -> Result<UploadFile> {
    UploadFile::from_path(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn upload_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message("uploading");
    bar
}

/// Renders pipeline events on a spinner
struct BarObserver(ProgressBar);

impl PipelineObserver for BarObserver {
    fn on_stage(&self, stage: Stage) {
        self.0.set_message(stage.to_string());
    }

    fn on_upload_progress(&self, progress: UploadProgress) {
        self.0.set_message(format!("upload {}%", progress.percent()));
    }

    fn on_caption(&self, caption: &Caption) {
        self.0.println(format!("Caption: {}", caption.text));
    }

    fn on_submitted(&self, task_id: &str) {
        info!("Submitted task {}", task_id);
    }

    fn on_progress(&self, update: &ProgressUpdate) {
        self.0.set_message(describe(update));
    }

    fn on_error(&self, stage: Stage, error: &ClientError) {
        self.0.println(format!("{} failed: {}", stage, error));
    }
}
