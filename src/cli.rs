// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for device operations
//!
//! This module provides command-line functionality for:
//! - Listing available devices
//! - Streaming frames with several concurrent consumers
//! - Saving a single frame to disk

use depthshare::backends::device::parameters::ParameterValue;
use depthshare::backends::synthetic::{PARAM_SERVICE_PRIORITY, SyntheticProvider};
use depthshare::snapshot;
use depthshare::{Access, CaptureSettings, Config, DeviceManager, DeviceRegistry, SourceFlags};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long `snapshot` waits for the first frame
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval of secondary consumers and Ctrl+C checks
const CONSUMER_POLL: Duration = Duration::from_millis(10);

pub struct StreamOptions {
    pub device: usize,
    pub sources: SourceFlags,
    pub frames: u64,
    pub consumers: usize,
    pub priority: Option<i64>,
}

fn create_registry(config: &Config) -> DeviceRegistry {
    let mut registry = DeviceRegistry::new(CaptureSettings::from(config));
    registry.register_provider(Box::new(SyntheticProvider::standard()));
    registry.refresh();
    registry
}

fn select_device(
    registry: &DeviceRegistry,
    index: usize,
) -> Result<DeviceManager, Box<dyn std::error::Error>> {
    let devices = registry.devices();
    if devices.is_empty() {
        return Err("No devices found".into());
    }
    devices.get(index).cloned().ok_or_else(|| {
        format!(
            "Device index {} out of range (0-{})",
            index,
            devices.len() - 1
        )
        .into()
    })
}

/// List all available devices
pub fn list_devices(config: &Config, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let registry = create_registry(config);
    let infos = registry.infos();

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }

    if infos.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Available devices:");
    println!();
    for (index, info) in infos.iter().enumerate() {
        println!("  [{}] {} ({})", index, info.unique_name, info.provider);
        println!(
            "      Color: {}  Depth: {}  @ {}fps",
            info.color, info.depth, info.framerate
        );
        println!("      Sources: {}", info.supported_sources);
        if !info.parameters.is_empty() {
            println!("      Parameters: {}", info.parameters.join(", "));
        }
        println!();
    }

    Ok(())
}

/// Ctrl+C sets the returned flag
fn install_stop_handler() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;
    Ok(stop_flag)
}

/// Secondary consumer: samples the last frame until told to stop
fn spawn_observer(access: Access, done: Arc<AtomicBool>) -> JoinHandle<u64> {
    std::thread::spawn(move || {
        let mut last_index = 0;
        let mut seen = 0;
        while !done.load(Ordering::SeqCst) {
            if let Some(frame) = access.last_frame()
                && frame.frame_index != last_index
            {
                last_index = frame.frame_index;
                seen += 1;
            }
            std::thread::sleep(CONSUMER_POLL);
        }
        access.release();
        seen
    })
}

/// Stream frames from a device, sharing it between several consumers
pub fn stream(config: &Config, options: StreamOptions) -> Result<(), Box<dyn std::error::Error>> {
    let registry = create_registry(config);
    let device = select_device(&registry, options.device)?;
    println!("Using device: {}", device.unique_name());

    let stop_flag = install_stop_handler()?;

    let primary = device.acquire_access(options.sources)?;
    let has_priority = device
        .parameters()
        .iter()
        .any(|spec| spec.name() == PARAM_SERVICE_PRIORITY);
    if has_priority {
        let level = options
            .priority
            .unwrap_or_else(|| config.service_priority.level());
        primary.update_parameters(&[(PARAM_SERVICE_PRIORITY, ParameterValue::Int(level))])?;
    }

    let done = Arc::new(AtomicBool::new(false));
    let mut observers = Vec::new();
    for _ in 1..options.consumers.max(1) {
        let access = device.acquire_access(options.sources)?;
        observers.push(spawn_observer(access, Arc::clone(&done)));
    }

    println!(
        "Streaming {} with {} consumer(s)... (press Ctrl+C to stop)",
        device.enabled_sources(),
        device.lease_count()
    );

    let rt = tokio::runtime::Runtime::new()?;
    let start = Instant::now();
    let (seen, skipped) = rt.block_on(async {
        let mut receiver = primary.subscribe()?;
        let mut seen = 0u64;
        let mut skipped = 0u64;
        let mut last_index = 0u64;

        while !stop_flag.load(Ordering::SeqCst) {
            match tokio::time::timeout(CONSUMER_POLL * 20, receiver.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
            let Some(frame) = receiver.borrow_and_update().clone() else {
                continue;
            };
            if last_index > 0 {
                skipped += frame.frame_index.saturating_sub(last_index + 1);
            }
            last_index = frame.frame_index;
            seen += 1;

            print!(
                "\rFrame {:>6}  planes: {}",
                frame.frame_index,
                frame.sources()
            );
            std::io::Write::flush(&mut std::io::stdout())?;

            if options.frames > 0 && seen >= options.frames {
                break;
            }
        }
        Ok::<_, Box<dyn std::error::Error>>((seen, skipped))
    })?;
    println!();

    done.store(true, Ordering::SeqCst);
    let observed: Vec<u64> = observers
        .into_iter()
        .map(|handle| handle.join().unwrap_or(0))
        .collect();
    primary.release();

    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
    println!(
        "Received {} frames ({} skipped) in {:.1}s, {:.1} fps",
        seen,
        skipped,
        elapsed,
        seen as f64 / elapsed
    );
    for (index, count) in observed.iter().enumerate() {
        println!("  Consumer {}: {} frames", index + 2, count);
    }
    println!("Device state: {}", device.capture_state());

    Ok(())
}

/// Save a single frame of the selected device
pub fn snapshot(
    config: &Config,
    device_index: usize,
    sources: SourceFlags,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = create_registry(config);
    let device = select_device(&registry, device_index)?;
    println!("Using device: {}", device.unique_name());

    // Only ask for what the device can deliver
    let sources = sources & device.supported_sources();
    let access = device.acquire_access(sources)?;
    let output_dir = output.unwrap_or_else(|| config.snapshot_dir());

    println!("Capturing {}...", sources);
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let mut receiver = access.subscribe()?;
        let frame = tokio::time::timeout(SNAPSHOT_TIMEOUT, receiver.wait_for(Option::is_some))
            .await
            .map_err(|_| "Timed out waiting for a frame")??
            .clone()
            .ok_or("Capture stopped before a frame arrived")?;
        let result = snapshot::save_frame(frame, output_dir).await?;
        Ok::<_, Box<dyn std::error::Error>>(result)
    })?;
    access.release();

    println!("Snapshot saved: {}", result.directory.display());
    for file in &result.files {
        if let Some(name) = file.file_name() {
            println!("  {}", name.to_string_lossy());
        }
    }
    Ok(())
}

/// Print the configuration and where it lives
pub fn show_config(config: &Config, save: bool) -> Result<(), Box<dyn std::error::Error>> {
    match Config::path() {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: unavailable"),
    }
    println!("{}", serde_json::to_string_pretty(config)?);

    if save {
        let path = config.save()?;
        println!("Saved: {}", path.display());
    }
    Ok(())
}
