//! ess-dump: read a preserved exynos-snapshot region image.
//!
//! The image is whatever the reserved region held when the system came back
//! up, saved to a file. Nothing here writes to it.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use exynos_ss::layout::place_items;
use exynos_ss::{
    Config, DumpLine, Dumper, NoSymbols, SnapshotImage, SymbolResolver, SymbolTable,
    parse_base_address,
};
use exynos_ss_common::{Category, sign};
use log::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ess-dump", about = "Inspect a preserved exynos-snapshot region", version)]
struct Args {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show where each item lands for a configuration
    Layout {
        /// Configuration file; built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Physical base, as given to ess_setup=
        #[arg(short, long, default_value = "0x80000000")]
        base: String,
    },
    /// How the previous run ended, per-CPU markers, items and rings
    Status {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Saved registers of one CPU
    Regs {
        image: PathBuf,
        #[arg(short, long)]
        cpu: usize,
        #[arg(long)]
        json: bool,
    },
    /// Replay a ring, oldest record first
    Dump {
        image: PathBuf,
        /// Category name, e.g. irq or task
        #[arg(short = 'k', long)]
        category: String,
        /// CPU shard; every shard when omitted
        #[arg(short, long)]
        cpu: Option<usize>,
        /// System.map used to name function pointers
        #[arg(short, long)]
        symbols: Option<PathBuf>,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Print the text of a byte-ring item such as log_kernel
    Item { image: PathBuf, name: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.no_color {
        colored::control::set_override(false);
    }

    match args.command {
        Command::Layout { config, base } => layout(config.as_deref(), &base),
        Command::Status { image, json } => status(&open(&image)?, json),
        Command::Regs { image, cpu, json } => regs(&open(&image)?, cpu, json),
        Command::Dump {
            image,
            category,
            cpu,
            symbols,
            json,
        } => dump(&open(&image)?, &category, cpu, symbols.as_deref(), json),
        Command::Item { image, name } => item(&open(&image)?, &name),
    }
}

fn open(path: &Path) -> Result<SnapshotImage> {
    let image = SnapshotImage::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?;
    debug!(
        "opened {} (paddr {:#x}, {} items)",
        path.display(),
        image.base().paddr,
        image.items().len()
    );
    Ok(image)
}

fn layout(config: Option<&Path>, base: &str) -> Result<()> {
    let cfg = match config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    cfg.validate()?;
    let paddr = parse_base_address(Some(base))?;
    let (placements, total) = place_items(&cfg.item_table());

    println!("{}", "Region".bold());
    println!("  paddr {paddr:#x} size {total:#x}");
    println!("{}", "Items".bold());
    for p in &placements {
        println!(
            "  {:<16} paddr {:#012x} size {:#010x}{}{}",
            p.name,
            paddr + p.offset as u64,
            p.size,
            if p.persist { " persist" } else { "" },
            if p.enabled { "" } else { " off" }
        );
    }
    println!("{}", "Rings".bold());
    for &c in Category::ALL.iter().filter(|&&c| cfg.category_enabled(c)) {
        let shards = if c.per_cpu() { cfg.boot.nr_cpus } else { 1 };
        println!(
            "  {:<16} {} x {:>5} x {:>3}B",
            c.name(),
            shards,
            cfg.capacity(c),
            c.record_size()
        );
    }
    Ok(())
}

fn mark(name: &str) -> colored::ColoredString {
    match name {
        "PANIC" | "SAFE_FAULT" | "DEAD" => name.red().bold(),
        "ALIVE" | "NORMAL_REBOOT" => name.green(),
        _ => name.normal(),
    }
}

fn status(image: &SnapshotImage, json: bool) -> Result<()> {
    let status = image.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let base = image.base();
    println!("{}", "Region".bold());
    println!(
        "  paddr {:#x} vaddr {:#x} size {:#x}",
        base.paddr, base.vaddr, base.size
    );
    println!("  scratch {}", mark(status.scratch));
    println!("  reason  {}", mark(status.reason));
    if !status.panic_string.is_empty() {
        println!("  panic   {}", status.panic_string);
    }

    println!("{}", "CPUs".bold());
    for cpu in &status.cpus {
        if cpu.power == "RESET" && cpu.panic == "RESET" {
            continue;
        }
        println!("  cpu{} power {} panic {}", cpu.cpu, mark(cpu.power), mark(cpu.panic));
    }

    println!("{}", "Items".bold());
    for item in image.items() {
        println!(
            "  {:<16} paddr {:#012x} size {:#010x}{}{}",
            item.name,
            item.paddr,
            item.size,
            if item.persist { " persist" } else { "" },
            if item.enabled { "" } else { " off" }
        );
    }

    match image.kevents() {
        Some(view) => {
            println!("{}", "Rings".bold());
            for ring in view.rings() {
                let heads: Vec<String> = (0..ring.shards)
                    .map(|s| {
                        view.write_index(ring.category, s)
                            .map_or_else(|| "?".to_string(), |i| i.to_string())
                    })
                    .collect();
                println!(
                    "  {:<16} capacity {:>5} head [{}]",
                    ring.category.name(),
                    ring.capacity,
                    heads.join(", ")
                );
            }
        }
        None => warn!("image has no event rings"),
    }
    Ok(())
}

fn regs(image: &SnapshotImage, cpu: usize, json: bool) -> Result<()> {
    if cpu >= exynos_ss_common::MAX_CPUS {
        bail!("cpu {cpu} out of range (max {})", exynos_ss_common::MAX_CPUS - 1);
    }
    let header = image.header();
    let mmu = header.mmu_registers(cpu);
    let core = header.core_registers(cpu);
    if json {
        let value = serde_json::json!({
            "cpu": cpu,
            "panic": sign::name(header.core_panic_stat(cpu)),
            "mmu": mmu,
            "core": core,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "{} cpu{cpu} ({})",
        "Registers".bold(),
        mark(sign::name(header.core_panic_stat(cpu)))
    );
    for (i, pair) in core.regs.chunks(2).enumerate() {
        let line: Vec<String> = pair
            .iter()
            .enumerate()
            .map(|(j, v)| format!("x{:<2} {v:#018x}", i * 2 + j))
            .collect();
        println!("  {}", line.join("  "));
    }
    println!("  sp  {:#018x}  pc  {:#018x}", core.sp, core.pc);
    println!("  pstate {:#010x}", core.pstate);
    println!("{}", "System registers".bold());
    let sysregs = [
        ("SCTLR", mmu.sctlr),
        ("TTBR0", mmu.ttbr0),
        ("TTBR1", mmu.ttbr1),
        ("TCR", mmu.tcr),
        ("ESR", mmu.esr),
        ("FAR", mmu.far),
        ("CONTEXTIDR", mmu.contextidr),
        ("TPIDR_EL0", mmu.tpidr_el0),
        ("TPIDRRO_EL0", mmu.tpidrro_el0),
        ("TPIDR_EL1", mmu.tpidr_el1),
        ("MAIR", mmu.mair),
        ("ELR", mmu.elr),
        ("SP_EL0", mmu.sp_el0),
    ];
    for (name, value) in sysregs {
        println!("  {name:<12} {value:#018x}");
    }
    Ok(())
}

fn load_symbols(path: Option<&Path>) -> Result<Box<dyn SymbolResolver>> {
    match path {
        Some(path) => {
            let table = SymbolTable::load(path)
                .with_context(|| format!("Failed to read symbols from {}", path.display()))?;
            info!("{} symbols from {}", table.len(), path.display());
            Ok(Box::new(table))
        }
        None => Ok(Box::new(NoSymbols)),
    }
}

fn dump(
    image: &SnapshotImage,
    category: &str,
    cpu: Option<usize>,
    symbols: Option<&Path>,
    json: bool,
) -> Result<()> {
    let category =
        Category::from_name(category).ok_or_else(|| anyhow!("unknown category {category:?}"))?;
    let view = image
        .kevents()
        .ok_or_else(|| anyhow!("image has no event rings"))?;
    let layout = view
        .layout(category)
        .ok_or_else(|| anyhow!("category {} is not recorded in this image", category.name()))?;
    let shards: Vec<usize> = match cpu {
        Some(cpu) => vec![cpu],
        None => (0..layout.shards).collect(),
    };
    let resolver = load_symbols(symbols)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut total = 0usize;
    for shard in shards {
        let dumper = Dumper::open(view, category, shard, resolver.as_ref())?;
        for line in dumper {
            print_line(&mut out, &line, json)?;
            total += 1;
        }
    }
    out.flush()?;
    debug!("{total} {} records", category.name());
    Ok(())
}

fn print_line(out: &mut impl Write, line: &DumpLine, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer(&mut *out, line)?;
        writeln!(out)?;
    } else {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn item(image: &SnapshotImage, name: &str) -> Result<()> {
    let bytes = image
        .item_bytes(name)
        .ok_or_else(|| anyhow!("no item {name:?} in this image"))?;
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let mut out = io::stdout().lock();
    out.write_all(String::from_utf8_lossy(&bytes[..end]).as_bytes())?;
    out.flush()?;
    Ok(())
}
