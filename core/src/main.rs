//! CLI entry point for inferbridge-rs.
//!
//! Starts an embedded server on a model repository, waits for it and the
//! target model to become ready, runs one asynchronous add/sub request and
//! checks every returned value. Exits non-zero on any failure.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use inferbridge_rs::cli::Cli;
use inferbridge_rs::config::Config;
use inferbridge_rs::inference::{infer, InferenceRequest, RequestHeader};
use inferbridge_rs::server::{EmbeddedServer, InferenceServer, ServerOptions};
use inferbridge_rs::status::ServerStatus;
use inferbridge_rs::{CpuAllocator, MemoryType, ReadinessPoller, ResponseAllocator};

const ELEMENTS: usize = 16;

fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse_args();

    let mut config = if let Some(config_path) = &cli.config {
        Config::from_yaml_file(config_path)
            .with_context(|| format!("Failed to load config: {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(repository) = cli.model_repository {
        config.server.model_repository = Some(repository);
    }
    if let Some(model) = cli.model {
        config.model.name = model;
    }
    if let Some(version) = cli.model_version {
        config.model.version = version;
    }

    let options = ServerOptions::from_config(&config)?;
    let server = EmbeddedServer::new(options).context("creating server")?;

    let poller = ReadinessPoller::from_config(&config.health);
    poller
        .wait_for_server(&server)
        .context("failed to find healthy inference server")?;

    let status = ServerStatus::from_slice(
        &server
            .server_status()
            .context("unable to get server status")?,
    )?;
    info!("Server Status:");
    info!("{}", serde_json::to_string_pretty(&status)?);

    let model = config.model.name.as_str();
    poller
        .wait_for_model(&server, model, config.model.version)
        .with_context(|| format!("waiting for model '{}'", model))?;

    let allocator: Arc<dyn ResponseAllocator> = Arc::new(CpuAllocator::new());

    let header = RequestHeader::new(123)
        .with_batch_size(1)
        .input("INPUT0")
        .input("INPUT1")
        .output("OUTPUT0")
        .output("OUTPUT1");
    let serialized = header.serialize()?;

    let input0: Vec<i32> = (0..ELEMENTS as i32).collect();
    let input1 = vec![1i32; ELEMENTS];

    let mut request = InferenceRequest::new(model, -1, &serialized)
        .context("creating inference request")?;
    request
        .set_input_i32("INPUT0", &input0)
        .context("assigning INPUT0 data")?;
    request
        .set_input_i32("INPUT1", &input1)
        .context("assigning INPUT1 data")?;

    let pending = infer(&server, request, Arc::clone(&allocator)).context("running inference")?;
    let response = pending.wait().context("waiting for response")?;
    response.status().context("response")?;

    info!("Model \"{}\" response header:", model);
    info!("{}", serde_json::to_string_pretty(response.header()?)?);

    let expected_bytes = ELEMENTS * std::mem::size_of::<i32>();
    let output0 = response.output("OUTPUT0").context("getting OUTPUT0 result")?;
    output0.expect_layout(expected_bytes, MemoryType::Cpu)?;
    let output1 = response.output("OUTPUT1").context("getting OUTPUT1 result")?;
    output1.expect_layout(expected_bytes, MemoryType::Cpu)?;

    let sums = output0.to_i32_vec()?;
    let diffs = output1.to_i32_vec()?;
    for i in 0..ELEMENTS {
        info!("{} + {} = {}", input0[i], input1[i], sums[i]);
        info!("{} - {} = {}", input0[i], input1[i], diffs[i]);

        if input0[i] + input1[i] != sums[i] {
            bail!("incorrect sum in {}", output0.name());
        }
        if input0[i] - input1[i] != diffs[i] {
            bail!("incorrect difference in {}", output1.name());
        }
    }

    drop(response);
    info!("outstanding responses: {}", server.outstanding_responses());
    Ok(())
}
