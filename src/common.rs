use bytes::Bytes;
use hdrhistogram::Histogram;
use indicatif::ProgressStyle;
use once_cell::sync::Lazy;
use rumqttc::QoS;
use uuid::Uuid;

const CLIENT_ID_PREFIX: &str = "mqttbench";

pub static PROGRESS_STYLE: Lazy<indicatif::ProgressStyle> = Lazy::new(|| {
    ProgressStyle::with_template(
        "{spinner:.bold.bright.yellow} {prefix:>20} {pos:>7}/{len:7} {bar:40.cyan/blue} {msg}",
    )
    .expect("progress style template should be correct")
    .progress_chars("##-")
});

/// Process id in hex. Keeps client ids unique between several mock processes
/// running against the same broker.
pub static UNIQUE_ID: Lazy<String> = Lazy::new(|| format!("{:x}", std::process::id()));

/// Identifies one run in written reports
pub static RUN_ID: Lazy<Uuid> = Lazy::new(Uuid::new_v4);

/// Client id of the `index`th (0 based) client of this process
pub fn client_id(index: usize) -> String {
    format!("{}-{}-{}", CLIENT_ID_PREFIX, *UNIQUE_ID, index + 1)
}

/// `size` bytes of repeating ascii digits, `0123456789012...`
pub fn fixed_size_message(size: usize) -> Bytes {
    (0..size).map(|i| b'0' + (i % 10) as u8).collect()
}

/// Number of messages the `index`th client publishes when `count` messages
/// are handed out round robin over `clients`
pub fn share(count: u64, clients: usize, index: usize) -> u64 {
    if clients == 0 {
        return 0;
    }

    let clients = clients as u64;
    let extra = (index as u64) < count % clients;
    count / clients + extra as u64
}

/// get QoS level. Default is AtLeastOnce.
pub fn get_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Histogram of ack latencies in microseconds
pub fn latency_histogram() -> Histogram<u64> {
    Histogram::<u64>::new(3).expect("3 significant figures should be a valid precision")
}

#[derive(Debug)]
pub struct PubStats {
    pub published: u64,
    pub reconnects: u64,
    pub latencies: Histogram<u64>,
}

impl Default for PubStats {
    fn default() -> Self {
        PubStats {
            published: 0,
            reconnects: 0,
            latencies: latency_histogram(),
        }
    }
}

impl PubStats {
    pub fn merge(&mut self, other: &PubStats) {
        self.published += other.published;
        self.reconnects += other.reconnects;
        if let Err(e) = self.latencies.add(&other.latencies) {
            warn!("Dropping latency samples = {:?}", e);
        }
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubStats {
    pub publish_count: u64,
    pub reconnects: u64,
}

impl SubStats {
    pub fn merge(&mut self, other: &SubStats) {
        self.publish_count += other.publish_count;
        self.reconnects += other.reconnects;
    }
}
