use log::info;
use pmu_metrics::config::LoaderConfig;
use pmu_metrics::metadata::Metadata;
use pmu_metrics::pmu::loader;

fn main() -> pmu_metrics::Result<()> {
    env_logger::init();

    // Platform description produced by the target probing layer
    let metadata_path = match std::env::args().nth(1) {
        Some(a) => a,
        None => std::env::var("PMU_METADATA")?,
    };
    let metadata: Metadata = serde_json::from_str(&std::fs::read_to_string(metadata_path)?)?;

    // Resource root from the second argument or the environment
    let config = match std::env::args().nth(2) {
        Some(root) => LoaderConfig::new(root),
        None => LoaderConfig::from_env()?,
    };

    let session = loader::load(&config, &metadata)?;
    let groups: Vec<String> = session.groups.iter().map(|g| g.perf_string()).collect();
    info!("{:#?}", groups);
    info!(
        "{} metrics, uncollectable events {:?}",
        session.metrics.len(),
        session.uncollectable
    );

    Ok(())
}
