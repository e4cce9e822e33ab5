// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! authpool-slot-viewer - Inspect authpool slot tables
//!
//! Attaches to a named slot table and prints the state of its slots.

use authpool::{SlotSnapshot, SlotTable};
use clap::Parser;
use colored::*;
use serde::Serialize;

/// Inspect authpool slot tables
#[derive(Parser, Debug)]
#[command(name = "authpool-slot-viewer")]
#[command(version)]
#[command(about = "Inspect authpool slot tables")]
struct Args {
    /// Segment name, as in clientauth.segment (e.g. /authpool)
    #[arg()]
    segment: String,

    /// Show idle slots too
    #[arg(short, long)]
    all: bool,

    /// Output format: pretty, json
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,
}

#[derive(Clone, Debug)]
enum OutputFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "json" | "j" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

#[derive(Debug, Serialize)]
struct TableReport {
    segment: String,
    slots: usize,
    workers: usize,
    lock_holder: u32,
    pool_owner: u32,
    entries: Vec<SlotReport>,
}

#[derive(Debug, Serialize)]
struct SlotReport {
    index: usize,
    worker: usize,
    owner_pid: u32,
    owner_alive: bool,
    available: bool,
    done_processing: bool,
    generation: u32,
    user: String,
    database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<SlotSnapshot> for SlotReport {
    fn from(slot: SlotSnapshot) -> Self {
        Self {
            index: slot.index,
            worker: slot.worker,
            owner_pid: slot.owner_pid,
            owner_alive: slot.owner_alive,
            available: slot.available,
            done_processing: slot.done_processing,
            generation: slot.generation,
            user: slot.user_name,
            database: slot.database_name,
            error: slot.error.then_some(slot.error_msg),
        }
    }
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let table = SlotTable::open_existing(&args.segment)?;
    let layout = table.layout();

    let entries = table
        .snapshot()
        .into_iter()
        .filter(|slot| args.all || !slot.is_idle())
        .map(SlotReport::from)
        .collect();

    let report = TableReport {
        segment: args.segment.clone(),
        slots: layout.slots,
        workers: layout.workers,
        lock_holder: table.lock_holder(),
        pool_owner: table.pool_owner(),
        entries,
    };

    match args.format {
        OutputFormat::Pretty => print_pretty(&report, args.all),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn print_pretty(report: &TableReport, all: bool) {
    println!();
    println!("{}", "=== authpool Slot Table ===".bold());
    println!(
        "  {}  {} slots, {} workers",
        report.segment.cyan(),
        report.slots,
        report.workers
    );
    if report.pool_owner == 0 {
        println!("  {}", "No pool running".yellow());
    } else {
        println!("  Pool run by pid {}", report.pool_owner);
    }
    if report.lock_holder != 0 {
        println!("  Lock held by pid {}", report.lock_holder.to_string().yellow());
    }
    println!();

    if report.entries.is_empty() {
        let msg = if all { "No slots" } else { "All slots idle" };
        println!("  {}", msg.green());
        println!();
        return;
    }

    for slot in &report.entries {
        let state = match (slot.available, slot.done_processing) {
            (true, true) => format!("{:<9}", "IDLE").green(),
            (false, false) => format!("{:<9}", "PENDING").yellow(),
            (false, true) => format!("{:<9}", "ANSWERED").blue(),
            (true, false) => format!("{:<9}", "ABANDONED").magenta(),
        };
        let owner = if slot.owner_pid == 0 {
            "-".dimmed()
        } else if slot.owner_alive {
            slot.owner_pid.to_string().normal()
        } else {
            format!("{} (dead)", slot.owner_pid).red()
        };

        println!(
            "  #{:<3} {} worker={} gen={} owner={}",
            slot.index, state, slot.worker, slot.generation, owner
        );
        if !slot.user.is_empty() || !slot.database.is_empty() {
            println!("       user=\"{}\" database=\"{}\"", slot.user, slot.database);
        }
        if let Some(ref err) = slot.error {
            println!("       {}: {}", "Rejected".red(), err);
        }
    }

    let pending = report
        .entries
        .iter()
        .filter(|s| !s.done_processing)
        .count();
    println!();
    println!("{}", "--- Summary ---".dimmed());
    println!("  Shown: {}  Pending: {}", report.entries.len(), pending);
    println!();
}
