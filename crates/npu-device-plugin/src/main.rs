use anyhow::Result;
use clap::Parser;
use npu_device_plugin::app::ApplicationBuilder;
use npu_device_plugin::config::Cli;
use npu_device_plugin::config::Commands;
use npu_device_plugin::config::DaemonArgs;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init_with_file();

    tracing::info!("Starting npu device plugin daemon {}", &**version::VERSION);
    tracing::info!(
        node = %daemon_args.node_name,
        use_volcano = daemon_args.use_volcano,
        enable_vnpu = daemon_args.enable_vnpu,
        "daemon configuration"
    );

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;

    Ok(())
}
