use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use inference_kernel::config::KernelConfig;
use inference_kernel::logging::init_tracing;
use inference_kernel::native::{CandleLibrary, CandleOptions, NativeLibrary};
use inference_kernel::{transport, GenerationOptions, Generator, KernelServices, LoadOutcome, ModelContainer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = KernelConfig::load()?;
    init_tracing(&config.logging);

    let lib: Arc<dyn NativeLibrary> = Arc::new(CandleLibrary::new(CandleOptions {
        tokenizer_path: config.model.tokenizer_path.clone(),
        tokenizer_repo: config.model.tokenizer_repo.clone(),
    }));
    let container = Arc::new(ModelContainer::new(lib));
    let generator = Generator::new(
        Arc::clone(&container),
        GenerationOptions::from_config(&config.generation, &config.logging),
    );
    let services = Arc::new(KernelServices::new(config.clone(), Arc::clone(&container), generator));

    if config.model.model_path().is_some() {
        let shutdown = services.shutdown.clone();
        let progress = Box::new(move |_: f32| !shutdown.is_cancelled());
        match container.load_model(&config.model, progress).await {
            Ok(LoadOutcome::Loaded) => {}
            Ok(LoadOutcome::Aborted) => warn!("startup model load aborted"),
            Err(e) => warn!(error = %e, "startup model load failed, continuing without a model"),
        }
    }

    let listener = TcpListener::bind((config.network.host.as_str(), config.network.port)).await?;

    let shutdown = services.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    transport::serve(listener, Arc::clone(&services)).await?;

    container.unload_model(true).await?;
    info!("kernel stopped");
    Ok(())
}
