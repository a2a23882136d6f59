//! TICKVAULT - Interactive Shell
//! A thin wrapper around the trigger scheduler for trying it out by hand.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use tickvault::config::Config;
use tickvault::engine::codec::BincodeCodec;
use tickvault::engine::TriggerScheduler;

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║              TICKVAULT                    ║");
    println!("  ║      Durable Delayed-Trigger Scheduler    ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    after <ms> <message>  - Deliver a message after <ms> milliseconds");
    println!("    pending               - Count undelivered triggers");
    println!("    compact               - Rewrite the log online");
    println!("    stats                 - Show scheduler statistics");
    println!("    exit                  - Shutdown");
    println!();

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());
    let scheduler = match TriggerScheduler::builder(Config::new(data_dir), BincodeCodec::<String>::new())
        .on_fire(|msg: String| println!("\n  fired: {}", msg))
        .open()
    {
        Ok(s) => s,
        Err(err) => {
            eprintln!("[ERROR] Failed to open scheduler: {}", err);
            std::process::exit(1);
        }
    };
    match scheduler.recover() {
        Ok(report) => println!(
            "  Recovered {} triggers ({} overdue dropped)",
            report.rescheduled, report.overdue_dropped
        ),
        Err(err) => eprintln!("[ERROR] Recovery stopped early: {}", err),
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("tickvault> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "after" | "in" => {
                if parts.len() < 3 {
                    println!("  Usage: after <ms> <message>");
                    continue;
                }
                let millis: u64 = match parts[1].parse() {
                    Ok(ms) => ms,
                    Err(_) => {
                        println!("  Not a number of milliseconds: '{}'", parts[1]);
                        continue;
                    }
                };
                let message = parts[2..].join(" ");
                match scheduler.register(Duration::from_millis(millis), message) {
                    Ok(id) => println!("  OK ({})", id),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "pending" => println!("  {} pending", scheduler.pending()),
            "compact" => match scheduler.compact() {
                Ok(stats) => println!(
                    "  OK ({} copied, {} -> {} bytes)",
                    stats.keys_copied, stats.bytes_before, stats.bytes_after
                ),
                Err(e) => println!("  ERROR: {}", e),
            },
            "stats" | "info" => {
                let stats = scheduler.store_stats();
                println!("  Live triggers: {}", stats.live_keys);
                println!("  Log records:   {}", stats.total_records);
                println!("  Log size:      {} bytes", stats.file_size);
                println!("{}", scheduler.metrics().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down TICKVAULT...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }
}
