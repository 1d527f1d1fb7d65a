use std::sync::{atomic::AtomicU64, Arc};
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use indicatif::ProgressBar;
use rumqttc::Event;
use tokio::{
    pin, select, signal,
    sync::Barrier,
    task::JoinSet,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    cli::{Mode, RunnerConfig},
    common::{client_id, fixed_size_message, PubStats, SubStats, PROGRESS_STYLE, RUN_ID},
    link::Link,
    report::{throughput, Latency, Summary},
};

mod publisher;
mod sink;
mod subscriber;

/// Pause before polling a failed eventloop again, which reconnects it
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// Deliveries buffered between subscribers and the sink
const SINK_CAPACITY: usize = 1024;

#[tokio::main(flavor = "multi_thread")]
pub(crate) async fn start(config: RunnerConfig) -> anyhow::Result<()> {
    println!("{}", config);
    let config = Arc::new(config);
    let links = connect_all(&config).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            ctrl_c.cancel();
        }
    });

    let (summary, links) = match config.mode {
        Mode::Publish { message_size } => {
            publish(links, Arc::clone(&config), message_size, cancel).await
        }
        Mode::Subscribe { window } => subscribe(links, Arc::clone(&config), window, cancel).await?,
    };

    summary.print();
    if let Some(path) = &config.report {
        summary
            .write(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    join_all(links.into_iter().map(Link::disconnect)).await;
    Ok(())
}

async fn connect_all(config: &RunnerConfig) -> anyhow::Result<Vec<Link>> {
    let bar = ProgressBar::new(config.clients as u64)
        .with_prefix("Clients Connected:")
        .with_style((*PROGRESS_STYLE).clone());
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut links = Vec::with_capacity(config.clients);
    for i in 0..config.clients {
        let id = client_id(i);
        bar.set_message(format!("connecting {}", id));
        let link = Link::connect(id.clone(), config)
            .await
            .with_context(|| format!("Failed to connect client {}", id))?;

        links.push(link);
        bar.inc(1);
    }

    bar.finish_with_message("Done!");
    Ok(links)
}

async fn publish(
    links: Vec<Link>,
    config: Arc<RunnerConfig>,
    message_size: usize,
    cancel: CancellationToken,
) -> (Summary, Vec<Link>) {
    let payload = fixed_size_message(message_size);
    let progress = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(links.len() + 1));

    let mut handles_pub = JoinSet::new();
    for (i, link) in links.into_iter().enumerate() {
        let publisher = publisher::Publisher::new(
            i,
            link,
            Arc::clone(&config),
            payload.clone(),
            Arc::clone(&progress),
        );

        handles_pub.spawn(publisher.start(barrier.clone(), cancel.clone()));
    }

    barrier.wait().await;
    let start = Instant::now();
    let (stats, links) = handle_pubs(handles_pub).await;
    let cost = start.elapsed();

    let summary = Summary {
        run_id: RUN_ID.to_string(),
        mode: "publish",
        broker: config.broker.to_string(),
        clients: config.clients,
        qos: config.qos,
        total: stats.published,
        cost_secs: cost.as_secs_f64(),
        throughput: throughput(stats.published, cost),
        reconnects: stats.reconnects,
        latency: Latency::from_histogram(&stats.latencies),
    };

    (summary, links)
}

async fn subscribe(
    links: Vec<Link>,
    config: Arc<RunnerConfig>,
    window: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<(Summary, Vec<Link>)> {
    let (tx, rx) = flume::bounded(SINK_CAPACITY);
    let barrier = Arc::new(Barrier::new(links.len() + 1));

    let mut handles_sub = JoinSet::new();
    for link in links {
        let id = link.id.clone();
        let subscriber = subscriber::Subscriber::new(link, Arc::clone(&config))
            .await
            .with_context(|| format!("Failed to subscribe client {} to {}", id, config.topic))?;

        handles_sub.spawn(subscriber.start(barrier.clone(), tx.clone(), cancel.clone()));
    }
    // the sink sees a disconnect once every subscriber is gone
    drop(tx);

    barrier.wait().await;
    info!("All clients subscribed to {}", config.topic);

    let report = sink::Sink::new(rx, config.count, window)
        .run(cancel.clone())
        .await;

    // sink is done, stop the subscribers
    cancel.cancel();
    let (stats, links) = handle_subs(handles_sub).await;
    debug!(
        "Subscribers received = {}, sink counted = {}",
        stats.publish_count, report.received
    );

    let summary = Summary {
        run_id: RUN_ID.to_string(),
        mode: "subscribe",
        broker: config.broker.to_string(),
        clients: config.clients,
        qos: config.qos,
        total: report.received,
        cost_secs: report.cost.as_secs_f64(),
        throughput: throughput(report.received, report.cost),
        reconnects: stats.reconnects,
        latency: None,
    };

    Ok((summary, links))
}

/// What a link saw while it waited for the others to get ready
#[derive(Debug, Default)]
pub(crate) struct Waited {
    pub events: Vec<Event>,
    pub reconnects: u64,
}

/// Waits on the barrier while polling the eventloop so that pings keep
/// flowing and the broker doesn't drop the connection
pub(crate) async fn wait_polling(link: &mut Link, barrier: &Barrier) -> Waited {
    let mut waited = Waited::default();
    let wait = barrier.wait();
    pin!(wait);

    loop {
        select! {
            biased;
            _ = &mut wait => break,
            event = link.eventloop.poll() => match event {
                Ok(event) => waited.events.push(event),
                Err(e) => {
                    error!("Id = {}, Connection error = {:?}", link.id, e);
                    waited.reconnects += 1;
                    time::sleep(RECONNECT_DELAY).await;
                }
            },
        }
    }

    waited
}

pub async fn handle_pubs(mut handles_pub: JoinSet<(PubStats, Link)>) -> (PubStats, Vec<Link>) {
    let mut aggregate_pubstats = PubStats::default();
    let mut links = Vec::new();

    while let Some(result) = handles_pub.join_next().await {
        match result {
            Ok((pub_stat, link)) => {
                aggregate_pubstats.merge(&pub_stat);
                links.push(link);
            }
            Err(e) => error!("Publisher task failed = {:?}", e),
        }
    }

    (aggregate_pubstats, links)
}

pub async fn handle_subs(mut handles_sub: JoinSet<(SubStats, Link)>) -> (SubStats, Vec<Link>) {
    let mut aggregate_substats = SubStats::default();
    let mut links = Vec::new();

    while let Some(result) = handles_sub.join_next().await {
        match result {
            Ok((sub_stat, link)) => {
                aggregate_substats.merge(&sub_stat);
                links.push(link);
            }
            Err(e) => error!("Subscriber task failed = {:?}", e),
        }
    }

    (aggregate_substats, links)
}
