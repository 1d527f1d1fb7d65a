use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::Receiver;
use tokio::select;
use tokio_util::sync::CancellationToken;

/// A publish received by one of the subscribers
#[derive(Debug, Clone)]
pub struct Delivery {
    pub client: String,
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkReport {
    pub received: u64,
    /// From the first message to the end of the run
    pub cost: Duration,
}

/// Drains deliveries of all subscribers and does the throughput accounting
pub(crate) struct Sink {
    rx: Receiver<Delivery>,
    expected: u64,
    window: ThroughputWindow,
}

impl Sink {
    /// `expected == 0` never stops on its own
    pub fn new(rx: Receiver<Delivery>, expected: u64, window: Duration) -> Sink {
        Sink {
            rx,
            expected,
            window: ThroughputWindow::new(window),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> SinkReport {
        let mut received = 0;
        let mut first: Option<Instant> = None;

        loop {
            let delivery = select! {
                _ = cancel.cancelled() => break,
                delivery = self.rx.recv_async() => match delivery {
                    Ok(v) => v,
                    // all subscribers are gone
                    Err(_) => break,
                },
            };

            let now = Instant::now();
            received += 1;
            first.get_or_insert(now);

            debug!(
                "Received message({}): client={}, topic={}, message={}",
                received,
                delivery.client,
                delivery.topic,
                String::from_utf8_lossy(&delivery.payload)
            );

            if let Some(rate) = self.window.record(now) {
                info!("Throughput={:.2}(messages/sec)", rate);
            }

            if self.expected != 0 && received >= self.expected {
                break;
            }
        }

        SinkReport {
            received,
            cost: first.map(|t| t.elapsed()).unwrap_or_default(),
        }
    }
}

/// Message rate over consecutive windows. A window opens with the message
/// that arrives after the previous one closed.
#[derive(Debug)]
pub struct ThroughputWindow {
    length: Duration,
    start: Option<Instant>,
    count: u64,
}

impl ThroughputWindow {
    pub fn new(length: Duration) -> ThroughputWindow {
        ThroughputWindow {
            length,
            start: None,
            count: 0,
        }
    }

    /// Counts a message arriving at `now`. Returns the rate of the window
    /// once more than `length` has passed since it opened.
    pub fn record(&mut self, now: Instant) -> Option<f64> {
        let start = match self.start {
            Some(start) => start,
            None => {
                self.start = Some(now);
                self.count = 1;
                return None;
            }
        };

        let elapsed = now.saturating_duration_since(start);
        if elapsed <= self.length {
            self.count += 1;
            return None;
        }

        let rate = self.count as f64 / elapsed.as_secs_f64();
        self.start = Some(now);
        self.count = 1;
        Some(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(i: usize) -> Delivery {
        Delivery {
            client: "mqttbench-1-1".to_owned(),
            topic: format!("mqtt-mock/benchmark/{}", i % 3),
            payload: Bytes::from_static(b"0123456789"),
        }
    }

    #[test]
    fn window_reports_after_it_closes() {
        let t0 = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(3));

        assert_eq!(window.record(t0), None);
        for i in 1..=5 {
            assert_eq!(window.record(t0 + Duration::from_millis(500 * i)), None);
        }

        // 6 messages in the first window, closed 4 seconds after it opened
        let rate = window.record(t0 + Duration::from_secs(4)).unwrap();
        assert!((rate - 1.5).abs() < 1e-9);

        // the closing message opened the next window
        assert_eq!(window.record(t0 + Duration::from_secs(5)), None);
        let rate = window.record(t0 + Duration::from_secs(8)).unwrap();
        assert!((rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let t0 = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(3));
        window.record(t0);
        assert_eq!(window.record(t0 + Duration::from_secs(3)), None);
        assert!(window.record(t0 + Duration::from_millis(3001)).is_some());
    }

    #[tokio::test]
    async fn stops_at_expected_count() {
        let (tx, rx) = flume::bounded(16);
        for i in 0..10 {
            tx.send_async(delivery(i)).await.unwrap();
        }

        let sink = Sink::new(rx, 4, Duration::from_secs(3));
        let report = sink.run(CancellationToken::new()).await;
        assert_eq!(report.received, 4);
        // subscribers notice the sink is gone on their next send
        assert!(tx.send(delivery(10)).is_err());
    }

    #[tokio::test]
    async fn unbounded_sink_stops_when_subscribers_are_gone() {
        let (tx, rx) = flume::bounded(16);
        for i in 0..7 {
            tx.send_async(delivery(i)).await.unwrap();
        }
        drop(tx);

        let sink = Sink::new(rx, 0, Duration::from_secs(3));
        let report = sink.run(CancellationToken::new()).await;
        assert_eq!(report.received, 7);
    }

    #[tokio::test]
    async fn cancelled_before_any_message() {
        let (_tx, rx) = flume::bounded::<Delivery>(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = Sink::new(rx, 10, Duration::from_secs(3)).run(cancel).await;
        assert_eq!(report.received, 0);
        assert_eq!(report.cost, Duration::ZERO);
    }
}
