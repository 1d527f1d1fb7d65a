use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, Incoming, Outgoing, QoS};
use tokio::{select, sync::Barrier, task, time};
use tokio_util::sync::CancellationToken;

use crate::{
    bench::{wait_polling, RECONNECT_DELAY},
    cli::RunnerConfig,
    common::{get_qos, share, PubStats},
    link::Link,
};

const PROGRESS_EVERY: u64 = 100_000;

pub struct Publisher {
    index: usize,
    link: Link,
    config: Arc<RunnerConfig>,
    payload: Bytes,
    expected: u64,
    // completed publishes of all the publishers
    progress: Arc<AtomicU64>,
}

impl Publisher {
    pub(crate) fn new(
        index: usize,
        link: Link,
        config: Arc<RunnerConfig>,
        payload: Bytes,
        progress: Arc<AtomicU64>,
    ) -> Publisher {
        let expected = share(config.count, config.clients, index);
        Publisher {
            index,
            link,
            config,
            payload,
            expected,
            progress,
        }
    }

    /// Publishes this client's share of messages and waits until every one
    /// of them is complete for its QoS
    pub async fn start(
        mut self,
        barrier: Arc<Barrier>,
        cancel: CancellationToken,
    ) -> (PubStats, Link) {
        let qos = get_qos(self.config.qos);
        let topic = topic(&self.config.topic, self.index);
        let mut stats = PubStats::default();

        // nothing is published yet, so only pings show up here
        stats.reconnects += wait_polling(&mut self.link, &barrier).await.reconnects;

        let stop = cancel.child_token();
        let requests = task::spawn(requests(
            topic,
            self.payload.clone(),
            self.expected,
            self.link.client.clone(),
            qos,
            stop.clone(),
        ));

        // indexed by pkid, when the publish was written to the network
        let mut sent_at: Vec<Option<Instant>> = vec![None; self.config.max_inflight as usize + 1];

        while stats.published < self.expected {
            let event = select! {
                _ = stop.cancelled() => break,
                event = self.link.eventloop.poll() => event,
            };

            let event = match event {
                Ok(v) => v,
                Err(e) => {
                    error!("Id = {}, Connection error = {:?}", self.link.id, e);
                    stats.reconnects += 1;
                    // next poll reconnects
                    time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            debug!("Id = {}, {:?}", self.link.id, event);
            let completed = match step(qos, &event) {
                Step::Sent(pkid) => {
                    if let Some(slot) = sent_at.get_mut(pkid as usize) {
                        *slot = Some(Instant::now());
                    }
                    false
                }
                Step::Done(_) if qos == QoS::AtMostOnce => true,
                Step::Done(pkid) => record_latency(&mut stats, &mut sent_at, pkid),
                Step::Other => false,
            };

            if completed {
                stats.published += 1;
                let total = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
                if total % PROGRESS_EVERY == 0 {
                    info!("{} messages have been published", total);
                }
            }
        }

        stop.cancel();
        if let Err(e) = requests.await {
            error!("Id = {}, Publish task failed = {:?}", self.link.id, e);
        }

        (stats, self.link)
    }
}

/// Topic of the `index`th publisher
fn topic(base: &str, index: usize) -> String {
    format!("{}{}", base, index)
}

/// What an eventloop event means to a publisher at `qos`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Written to the network, ack pending
    Sent(u16),
    /// Complete at its QoS
    Done(u16),
    Other,
}

fn step(qos: QoS, event: &Event) -> Step {
    match event {
        Event::Outgoing(Outgoing::Publish(pkid)) if qos == QoS::AtMostOnce => Step::Done(*pkid),
        Event::Outgoing(Outgoing::Publish(pkid)) => Step::Sent(*pkid),
        Event::Incoming(Incoming::PubAck(ack)) if qos == QoS::AtLeastOnce => Step::Done(ack.pkid),
        Event::Incoming(Incoming::PubComp(comp)) if qos == QoS::ExactlyOnce => {
            Step::Done(comp.pkid)
        }
        _ => Step::Other,
    }
}

/// Takes the send time of `pkid`. False for acks of nothing in flight.
fn record_latency(stats: &mut PubStats, sent_at: &mut [Option<Instant>], pkid: u16) -> bool {
    let elapsed = match sent_at.get_mut(pkid as usize).and_then(Option::take) {
        Some(instant) => instant.elapsed(),
        None => {
            warn!("Pkid = {}, Unsolicited ack", pkid);
            return false;
        }
    };

    stats.latencies.saturating_record(micros(elapsed));
    true
}

fn micros(elapsed: Duration) -> u64 {
    elapsed.as_micros().min(u64::MAX as u128) as u64
}

/// make count number of requests at specified QoS.
async fn requests(
    topic: String,
    payload: Bytes,
    count: u64,
    client: AsyncClient,
    qos: QoS,
    stop: CancellationToken,
) {
    for i in 0..count {
        let publish = client.publish_bytes(topic.as_str(), qos, false, payload.clone());

        // These errors are usually due to eventloop task being dead. We can ignore the
        // error here as the failed eventloop task would have already printed an error
        select! {
            _ = stop.cancelled() => break,
            result = publish => if result.is_err() {
                break;
            },
        }

        debug!(
            "Published message({}): topic={}, size={}",
            i,
            topic,
            payload.len()
        );
    }
}
