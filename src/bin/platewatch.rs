use platewatch::{cli::Cli, init_logging, platewatch_service, system_info::system_info};
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let mut args = Cli::from_config_and_args()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&args)?);
        return Ok(());
    }

    let _guard = init_logging(args.log_level, &mut args.log_path)?;
    system_info()?;
    args.log_config();

    // Run the tokio runtime on the main thread
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let (platewatch_future, cancellation_token) = platewatch_service(args)?;

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl+C received, shutting down server"),
                Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
            }
            cancellation_token.cancel();
        });

        let worker_handle = platewatch_future.await?;
        if let Some(handle) = worker_handle {
            info!("Waiting for recognition worker to complete...");
            if let Err(e) = handle.join() {
                error!("Recognition worker panicked: {:?}", e);
            }
        }
        anyhow::Ok(())
    })?;

    info!("Platewatch stopped");
    Ok(())
}
