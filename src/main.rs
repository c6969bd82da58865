//! Oxidized-PSX - PS1 Emulator
//!
//! Headless runner: boots the BIOS or a side-loaded EXE for a number of
//! frames and reports what the CPU and GPU did.

use anyhow::{bail, Context};
use px_core::Config;
use px_system::System;
use std::path::PathBuf;

const DEFAULT_FRAMES: u64 = 60;

#[derive(Debug, Default)]
struct Args {
    frames: Option<u64>,
    exe: Option<PathBuf>,
    bios: Option<PathBuf>,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let mut args = Self::default();
        let mut iter = std::env::args().skip(1);

        while let Some(arg) = iter.next() {
            let mut value = || iter.next().with_context(|| format!("{} needs a value", arg));
            match arg.as_str() {
                "--frames" => {
                    let frames = value()?;
                    args.frames = Some(frames.parse().with_context(|| format!("bad frame count '{}'", frames))?);
                }
                "--exe" => args.exe = Some(PathBuf::from(value()?)),
                "--bios" => args.bios = Some(PathBuf::from(value()?)),
                "-h" | "--help" => {
                    println!("usage: oxidized-psx [--frames N] [--exe PATH] [--bios PATH]");
                    std::process::exit(0);
                }
                other => bail!("unknown argument '{}'", other),
            }
        }

        Ok(args)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse()?;

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", Config::config_path().display(), e);
            Config::default()
        }
    };
    px_core::logging::init(&config.debug);

    tracing::info!("Starting Oxidized-PSX PS1 Emulator");

    let bios_path = args.bios.unwrap_or_else(|| config.general.bios_path.clone());
    let bios = if bios_path.as_os_str().is_empty() {
        tracing::warn!("No BIOS configured, running with an empty ROM");
        Vec::new()
    } else {
        std::fs::read(&bios_path).with_context(|| format!("reading BIOS {}", bios_path.display()))?
    };

    let mut system = System::new(&config, &bios).context("creating system")?;

    if let Some(exe_path) = &args.exe {
        let exe = std::fs::read(exe_path).with_context(|| format!("reading EXE {}", exe_path.display()))?;
        system.load_exe(&exe).with_context(|| format!("loading EXE {}", exe_path.display()))?;
    }

    let frames = args.frames.unwrap_or(DEFAULT_FRAMES);
    for _ in 0..frames {
        system.run_frame();
    }

    let cache_stats = system.code_cache().stats().clone();
    let gpu_stats = system.gpu().lock().stats();
    tracing::info!(
        "Ran {} frames: {} blocks compiled, {} executed, {} invalidated pages",
        system.frame_count(),
        cache_stats.blocks_compiled,
        cache_stats.blocks_executed,
        cache_stats.invalidated_pages
    );
    tracing::info!(
        "Last frame: {} polygons, {} vertices, {} fills, {} copies",
        gpu_stats.num_polygons,
        gpu_stats.num_vertices,
        gpu_stats.num_vram_fills,
        gpu_stats.num_vram_copies
    );

    Ok(())
}
