use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use flashprobe_core::analysis::{AnalysisContext, ai_analyze_with, analyze};
use flashprobe_core::chip::{ChipDatabase, ChipInfo, FlashInterface, UfsLunType};
use flashprobe_core::session::{CancelToken, DumpOutcome, EraseOutcome, FlashSession, SessionConfig};
use flashprobe_core::transport::{EmulatedDevice, Endpoint};
use flashprobe_core::TracingObserver;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Flash memory acquisition and analysis tool", long_about = None)]
struct Args {
    /// Programmer endpoint (usb:<bus>:<addr>, tcp:<host>:<port>, unix:<path>)
    #[arg(short, long, global = true)]
    device: Option<Endpoint>,

    /// Use the built-in emulated programmer instead of hardware
    #[arg(long, global = true)]
    emulate: bool,

    /// Session configuration (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Flash interface to select (nand, spi-nand, nor, emmc, ufs)
    #[arg(short, long, global = true)]
    interface: Option<FlashInterface>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List attached and configured programmers
    Scan,
    /// Identify the attached chip
    Info,
    /// Read pages into a file
    Dump {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// First page
        #[arg(long, default_value = "0", value_parser = parse_number)]
        start: u64,
        /// Number of pages; the whole target when omitted
        #[arg(long, value_parser = parse_number)]
        pages: Option<u64>,
        /// Page size in bytes; the chip page size when omitted
        #[arg(long, value_parser = parse_number)]
        page_size: Option<u64>,
        /// UFS LUN to read from
        #[arg(long)]
        lun: Option<UfsLunType>,
        /// Run the analysis pipeline on the result
        #[arg(long)]
        analyze: bool,
        /// Fail when any page could not be ECC corrected
        #[arg(long)]
        strict: bool,
    },
    /// Program pages from a file
    Write {
        /// Input file, a whole number of pages
        input: PathBuf,
        /// First page
        #[arg(long, default_value = "0", value_parser = parse_number)]
        start: u64,
        /// Read every chunk back and compare
        #[arg(long)]
        verify: bool,
    },
    /// Erase a sector, a block or the whole chip
    Erase {
        /// Byte address of a sector to erase
        #[arg(long, value_parser = parse_number, conflicts_with_all = ["block", "chip"])]
        sector: Option<u64>,
        /// Byte address of a block to erase
        #[arg(long, value_parser = parse_number, conflicts_with = "chip")]
        block: Option<u64>,
        /// Erase the entire chip
        #[arg(long)]
        chip: bool,
        /// Confirm a full chip erase
        #[arg(long)]
        yes: bool,
    },
    /// Clear block protection bits
    Unlock,
    /// Select a UFS LUN and show its geometry
    SelectLun {
        /// user, boot-a, boot-b or rpmb
        lun: UfsLunType,
    },
    /// Analyse a dump file offline
    Analyze {
        /// Dump file
        input: PathBuf,
        #[arg(long, default_value = "2048", value_parser = parse_number)]
        page_size: u64,
        #[arg(long, default_value = "64", value_parser = parse_number)]
        pages_per_block: u64,
        /// Also run pattern, anomaly and recovery analysis
        #[arg(long)]
        deep: bool,
    },
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: a global tracing subscriber was already set");
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if args.interface.is_some() {
        config.interface = args.interface;
    }

    match args.command {
        Cmd::Analyze {
            input,
            page_size,
            pages_per_block,
            deep,
        } => analyze_file(&input, page_size as usize, pages_per_block as usize, deep),
        Cmd::Scan => {
            let session = FlashSession::new(config);
            let found = session.scan_devices();
            if found.is_empty() {
                println!("No programmers found");
            }
            for endpoint in found {
                println!("{}", endpoint);
            }
            Ok(())
        }
        command => {
            let mut session = open_session(config, args.device.as_ref(), args.emulate)?;
            execute(&mut session, command)
        }
    }
}

fn open_session(config: SessionConfig, device: Option<&Endpoint>, emulate: bool) -> Result<FlashSession<TracingObserver>> {
    let db = match &config.chip_db_path {
        Some(path) => Arc::new(ChipDatabase::builtin_with_file(path)?),
        None => ChipDatabase::builtin_shared(),
    };
    let mut session = FlashSession::new(config).with_database(db);

    if emulate {
        info!("Using emulated programmer");
        session.attach(Box::new(EmulatedDevice::default()))?;
        return Ok(session);
    }
    let endpoint = match device {
        Some(endpoint) => endpoint.clone(),
        None => session
            .scan_devices()
            .into_iter()
            .next()
            .context("no programmer found; pass --device or --emulate")?,
    };
    session.connect(&endpoint)?;
    Ok(session)
}

fn execute(session: &mut FlashSession<TracingObserver>, command: Cmd) -> Result<()> {
    match command {
        Cmd::Info => {
            print_chip(session);
            Ok(())
        }
        Cmd::Dump {
            output,
            start,
            pages,
            page_size,
            lun,
            analyze,
            strict,
        } => {
            if let Some(lun) = lun {
                session.select_ufs_lun(lun)?;
            }
            dump(session, &output, start, pages, page_size, analyze, strict)
        }
        Cmd::Write { input, start, verify } => {
            let data = fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let pages = session.write(start, &data, verify)?;
            println!("Wrote {} pages from {}", pages, input.display());
            Ok(())
        }
        Cmd::Erase {
            sector,
            block,
            chip,
            yes,
        } => {
            if let Some(address) = sector {
                session.erase_sector(address)?;
                println!("Erased sector at 0x{:X}", address);
            } else if let Some(address) = block {
                session.erase_block(address)?;
                println!("Erased block at 0x{:X}", address);
            } else if chip {
                match session.erase_chip(yes, &CancelToken::new())? {
                    EraseOutcome::Complete { blocks } => println!("Chip erased ({} blocks)", blocks),
                    EraseOutcome::Cancelled { erased_blocks } => {
                        println!("Chip erase cancelled after {} blocks", erased_blocks)
                    }
                }
            } else {
                bail!("nothing to erase: pass --sector, --block or --chip");
            }
            Ok(())
        }
        Cmd::Unlock => {
            let bits = session.unlock_all()?;
            println!("Protection cleared ({})", bits);
            Ok(())
        }
        Cmd::SelectLun { lun } => {
            session.select_ufs_lun(lun)?;
            let info = session
                .chip_info()
                .and_then(|c| c.lun(lun))
                .context("selected LUN missing from chip info")?;
            println!(
                "Selected {}: {} bytes, {}-byte blocks{}",
                lun,
                info.capacity_bytes,
                info.block_size,
                if info.write_protected { ", write protected" } else { "" }
            );
            Ok(())
        }
        // Handled in `run` without a session.
        Cmd::Scan | Cmd::Analyze { .. } => Ok(()),
    }
}

fn dump(
    session: &mut FlashSession<TracingObserver>,
    output: &Path,
    start: u64,
    pages: Option<u64>,
    page_size: Option<u64>,
    run_analysis: bool,
    strict: bool,
) -> Result<()> {
    let chip = session.chip_info().context("no chip identified")?.clone();
    let page_size = match page_size {
        Some(size) => u32::try_from(size).context("page size too large")?,
        None => transfer_unit(session, &chip),
    };
    if page_size == 0 {
        bail!("page size must be non-zero");
    }
    let pages = match pages {
        Some(pages) => pages,
        None => target_capacity(session, &chip)
            .and_then(|bytes| (bytes / page_size as u64).checked_sub(start))
            .context("target capacity unknown or start past the end; pass --pages")?,
    };

    let report = match session.dump(start, pages, page_size, &CancelToken::new()) {
        Ok(DumpOutcome::Complete(report)) => report,
        Ok(DumpOutcome::Cancelled(partial)) => {
            fs::write(output, &partial.data)?;
            bail!("dump cancelled; {} bytes saved", partial.data.len());
        }
        Err(e) => {
            if let Some(partial) = e.partial_dump() {
                fs::write(output, &partial.data)?;
                warn!(bytes = partial.data.len(), "Partial dump saved");
            }
            return Err(e.into());
        }
    };

    fs::write(output, &report.data).with_context(|| format!("writing {}", output.display()))?;
    println!("Saved {} bytes to {}", report.data.len(), output.display());
    if report.corrected_bits() > 0 {
        println!("ECC corrected {} bits", report.corrected_bits());
    }
    let uncorrectable: Vec<u64> = report.uncorrectable_pages().collect();
    if !uncorrectable.is_empty() {
        println!("Uncorrectable pages: {:?}", uncorrectable);
    }

    if run_analysis {
        let context = AnalysisContext {
            page_ecc: &report.page_ecc,
            first_page: start,
            chip: Some(&chip),
        };
        let ppb = chip.block_size.max(1) as usize;
        println!("{}", analyze(&report.data, page_size as usize, ppb).to_text());
        println!("{}", ai_analyze_with(&report.data, page_size as usize, ppb, &context).to_text());
    }
    if strict {
        report.ensure_correctable()?;
    }
    Ok(())
}

/// Natural transfer unit: the chip page, or the selected LUN block on UFS.
fn transfer_unit(session: &FlashSession<TracingObserver>, chip: &ChipInfo) -> u32 {
    session
        .selected_lun()
        .and_then(|lun| chip.lun(lun))
        .map(|l| l.block_size)
        .unwrap_or(chip.page_size)
}

fn target_capacity(session: &FlashSession<TracingObserver>, chip: &ChipInfo) -> Option<u64> {
    match session.selected_lun() {
        Some(lun) => chip.lun(lun).map(|l| l.capacity_bytes),
        None => chip.capacity_known().then(|| chip.capacity_bytes()),
    }
}

fn print_chip(session: &FlashSession<TracingObserver>) {
    if let Some(firmware) = session.firmware_version() {
        println!("Programmer firmware: {}", firmware);
    }
    let Some(chip) = session.chip_info() else {
        println!("No chip identified");
        return;
    };
    println!("Interface:    {}", chip.interface);
    println!("Chip:         {} {}", chip.manufacturer, chip.model);
    println!("ID:           {}", chip.id_hex());
    println!("Resolved:     {}", chip.resolved);
    println!("Capacity:     {} MiB", chip.size_mb);
    println!("Page size:    {} + {} spare", chip.page_size, chip.oob_size);
    println!("Block size:   {} pages", chip.block_size);
    if let Some(protection) = chip.protection {
        println!("Protection:   {}", protection);
    }
    for lun in &chip.luns {
        println!(
            "LUN {:<8} {} bytes, {}-byte blocks{}",
            lun.lun_type.to_string(),
            lun.capacity_bytes,
            lun.block_size,
            if lun.enabled { "" } else { " (disabled)" }
        );
    }
}

fn analyze_file(input: &Path, page_size: usize, pages_per_block: usize, deep: bool) -> Result<()> {
    let data = fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    if data.is_empty() {
        bail!("{} is empty", input.display());
    }
    println!("{}", analyze(&data, page_size, pages_per_block).to_text());
    if deep {
        let response = ai_analyze_with(&data, page_size, pages_per_block, &AnalysisContext::default());
        println!("{}", response.to_text());
    }
    Ok(())
}
