//! The Bundle Protocol Agent daemon: wires the routing table, contact
//! manager, bundle processor, and CLAs together and runs until killed.

use bpa_core::contact_manager::CmWaker;
use bpa_core::processor::{BpConfig, BundleProcessor, FailedForwardPolicy};
use bpa_core::{config as config_agent, echo, ClaRegistry, ContactManager, RoutingTable};
use bpa_proto::time::SystemTimeProvider;
use clap::Parser;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bpad", about = "Delay-tolerant networking bundle protocol agent")]
struct Args {
    /// Local node EID, e.g. dtn://node1/ or ipn:1.0
    #[arg(long, default_value = "dtn://bpad/")]
    eid: String,

    /// Disable generation of status-report bundles
    #[arg(long)]
    no_status_reports: bool,

    /// Re-route bundles whose transmission failed instead of dropping
    /// them
    #[arg(long)]
    reschedule_on_failure: bool,

    /// Accept configuration commands from remote nodes
    #[arg(long)]
    allow_remote_config: bool,

    /// Offset applied to the DTN clock, in milliseconds
    #[arg(long, default_value_t = 0)]
    time_offset_ms: i64,

    /// Lifetime of echo replies, in seconds
    #[arg(long, default_value_t = 300)]
    echo_lifetime_s: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = BpConfig::new(&args.eid)?;
    config.status_reporting = !args.no_status_reports;
    if args.reschedule_on_failure {
        config.failed_forward_policy = FailedForwardPolicy::TryReSchedule;
    }

    let time = Arc::new(SystemTimeProvider::with_offset(args.time_offset_ms));
    let routing = Arc::new(Mutex::new(RoutingTable::new()));
    let registry = Arc::new(ClaRegistry::new());
    let (waker, wake_queue) = CmWaker::new();

    let processor = BundleProcessor::new(
        config,
        routing.clone(),
        registry.clone(),
        waker,
        time.clone(),
    );
    let handle = processor.handle();

    let manager = ContactManager::new(routing, registry.clone(), handle.clone(), time, wake_queue);

    config_agent::setup(&handle, args.allow_remote_config);
    echo::setup(&handle, args.echo_lifetime_s * 1000);
    registry.launch_all();

    info!(eid = %handle.local_eid(), "bpad starting");
    let cm_thread = std::thread::spawn(move || manager.run());
    processor.run();
    let _ = cm_thread.join();
    Ok(())
}
