use clap::Parser;
use log::info;
use usp_client::mock_service::{MockServiceConfig, MockUspService};

#[derive(Parser, Debug)]
#[command(name = "mock_usp_service")]
#[command(about = "Mock speech service that answers audio turns with scripted recognition events")]
struct Args {
    /// Address to bind the service to
    #[arg(short, long, default_value = "127.0.0.1:9009")]
    address: String,

    /// Subscription key clients must present (any key accepted when unset)
    #[arg(short, long)]
    key: Option<String>,

    /// Reject every connection with 401
    #[arg(long)]
    reject_auth: bool,

    /// Emit speech.startDetected/endDetected around each turn
    #[arg(long)]
    detection_events: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    info!("Starting mock USP service with args: {:?}", args);

    let config = MockServiceConfig {
        bind_address: args.address,
        expected_subscription_key: args.key,
        reject_auth: args.reject_auth,
        include_detection_events: args.detection_events,
        ..MockServiceConfig::default()
    };

    let mut service = MockUspService::new(config);
    let port = service.start()?;
    info!("Mock USP service started on port {}", port);

    // Handle Ctrl+C gracefully
    let should_stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let should_stop_clone = should_stop.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down...");
        should_stop_clone.store(true, std::sync::atomic::Ordering::Relaxed);
    })?;

    while !should_stop.load(std::sync::atomic::Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    service.stop();
    info!("Mock USP service stopped");

    Ok(())
}
