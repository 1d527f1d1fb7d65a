use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use colored::*;
use hdrhistogram::Histogram;
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("IO error = {0:?}")]
    Io(#[from] io::Error),
    #[error("Json error = {0:?}")]
    Json(#[from] serde_json::Error),
}

/// Ack latency percentiles in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Latency {
    pub samples: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub max: u64,
}

impl Latency {
    pub fn from_histogram(histogram: &Histogram<u64>) -> Option<Latency> {
        if histogram.len() == 0 {
            return None;
        }

        Some(Latency {
            samples: histogram.len(),
            p50: histogram.value_at_quantile(0.5),
            p90: histogram.value_at_quantile(0.9),
            p99: histogram.value_at_quantile(0.99),
            max: histogram.max(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub run_id: String,
    pub mode: &'static str,
    pub broker: String,
    pub clients: usize,
    pub qos: u8,
    pub total: u64,
    pub cost_secs: f64,
    pub throughput: f64,
    pub reconnects: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<Latency>,
}

/// Messages per second. A run too short to measure reports `total`.
pub fn throughput(total: u64, cost: Duration) -> f64 {
    let cost = cost.as_secs_f64();
    if cost > 0.0 {
        total as f64 / cost
    } else {
        total as f64
    }
}

impl Summary {
    pub fn print(&self) {
        info!(
            "Finish {} mock! total={} cost={:.2}s Throughput={:.2}(messages/sec)",
            self.mode, self.total, self.cost_secs, self.throughput
        );

        let title = format!("{} summary", self.mode);
        println!("\n{}", title.yellow().bold().underline());
        println!("Broker             : {}", self.broker);
        println!("Clients            : {}", self.clients);
        println!("Messages           : {}", self.total);
        println!("Cost               : {:.3}s", self.cost_secs);
        println!(
            "Throughput         : {} messages/s",
            format!("{:.2}", self.throughput).green().bold()
        );

        let reconnects = format!("{}", self.reconnects);
        if self.reconnects == 0 {
            println!("Reconnects         : {}", reconnects);
        } else {
            println!("Reconnects         : {}", reconnects.red());
        }

        if let Some(latency) = &self.latency {
            println!(
                "\n{}",
                format!("Ack latencies of {} samples (us)", latency.samples).bold()
            );
            println!("50 percentile      : {}", latency.p50);
            println!("90 percentile      : {}", latency.p90);
            println!("99 percentile      : {}", latency.p99);
            println!("100                : {}", latency.max);
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}
