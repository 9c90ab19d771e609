use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Reports the event rate and delivery lag of a running sensorhub WebSocket feed", long_about = None)]
struct Args {
    /// Gateway WebSocket endpoint
    #[clap(short, long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Report interval in minutes
    #[clap(short, long, default_value_t = 1)]
    report_interval_minutes: u64,
}

#[derive(Default)]
struct Stats {
    arrivals: VecDeque<DateTime<Utc>>,
    // stamp-to-arrival delay per frame, in milliseconds
    lags_ms: VecDeque<(DateTime<Utc>, i64)>,
    field_counts: HashMap<String, usize>,
}

impl Stats {
    fn record(&mut self, frame: &Value, now: DateTime<Utc>) {
        self.arrivals.push_back(now);
        if let Some(stamped) = frame
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        {
            self.lags_ms
                .push_back((now, (now - stamped.with_timezone(&Utc)).num_milliseconds()));
        }
        if let Some(object) = frame.as_object() {
            for key in object.keys().filter(|key| key.as_str() != "timestamp") {
                *self.field_counts.entry(key.clone()).or_default() += 1;
            }
        }
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.arrivals.front().is_some_and(|&t| t < cutoff) {
            self.arrivals.pop_front();
        }
        while self.lags_ms.front().is_some_and(|&(t, _)| t < cutoff) {
            self.lags_ms.pop_front();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_minutes.max(1) * 60;
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let now = Utc::now();
            let mut data = stats_reporter.lock().unwrap_or_else(PoisonError::into_inner);
            data.prune(now - Duration::minutes(1));

            let rate = data.arrivals.len();
            let avg_lag = if data.lags_ms.is_empty() {
                0
            } else {
                data.lags_ms.iter().map(|(_, lag)| lag).sum::<i64>() / data.lags_ms.len() as i64
            };
            let max_lag = data.lags_ms.iter().map(|(_, lag)| *lag).max().unwrap_or(0);

            let mut fields: Vec<_> = data.field_counts.iter().collect();
            fields.sort_by(|a, b| b.1.cmp(a.1));
            let report = fields
                .iter()
                .map(|(field, count)| format!("{}: {}", field, count))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- 1-Minute Summary -----");
            println!("Event rate: {} events/min", rate);
            println!("Delivery lag: avg {} ms, max {} ms", avg_lag, max_lag);
            println!("Fields seen (total): {}", if report.is_empty() { "No data" } else { &report });
            println!("----------------------------\n");
        }
    });

    // Main WebSocket Loop
    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (_write, mut read) = ws_stream.split();
    println!("Connected. Press Ctrl+C to stop.");

    while let Some(Ok(msg)) = read.next().await {
        if let Message::Text(text) = msg {
            match serde_json::from_str::<Value>(&text) {
                Ok(frame) => stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(&frame, Utc::now()),
                Err(e) => eprintln!("Ignoring non-JSON frame: {}", e),
            }
        }
    }

    println!("Gateway closed the connection.");
    Ok(())
}
