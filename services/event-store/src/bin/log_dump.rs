//! Event-log inspection utility: prints envelope summaries per segment

use anyhow::Result;
use clap::Parser;
use event_store::{EventFilter, EventLog, Topic};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "log-dump", about = "Dump QuoteHub event-log segments")]
struct Args {
    /// Event-log directory
    #[arg(long, default_value = "./data/events")]
    dir: PathBuf,

    /// Only show this topic (tick|bar|order_command|order_status)
    #[arg(long)]
    topic: Option<String>,

    /// Stop after this many records
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let topics = match args.topic.as_deref() {
        None => Vec::new(),
        Some(name) => vec![parse_topic(name)?],
    };

    let log = EventLog::open(&args.dir, Duration::ZERO)?;
    let stats = log.stats()?;
    println!(
        "{} segment(s), {} event(s), {} byte(s) in {}",
        stats.segment_count,
        stats.total_events,
        stats.total_bytes,
        args.dir.display()
    );

    let mut iter = log.iterate(EventFilter {
        topics,
        ..EventFilter::default()
    })?;
    let mut shown = 0;
    while let Some((event, cursor)) = iter.next_event()? {
        println!(
            "{}:{:<8} id={} topic={} source={} occurred={} replay={}",
            cursor.file,
            cursor.offset,
            event.event_id,
            event.topic,
            event.source,
            event.occurred_at.to_rfc3339(),
            event.replay,
        );
        shown += 1;
        if shown >= args.limit {
            println!("... (showing first {} records)", args.limit);
            break;
        }
    }
    Ok(())
}

fn parse_topic(name: &str) -> Result<Topic> {
    match name {
        "tick" => Ok(Topic::Tick),
        "bar" => Ok(Topic::Bar),
        "order_command" => Ok(Topic::OrderCommand),
        "order_status" => Ok(Topic::OrderStatus),
        other => anyhow::bail!("unknown topic: {other}"),
    }
}
