use std::sync::Arc;

use flume::Sender;
use rumqttc::{Event, Incoming, SubscribeReasonCode};
use tokio::{select, sync::Barrier, time};
use tokio_util::sync::CancellationToken;

use crate::{
    bench::{sink::Delivery, wait_polling, RECONNECT_DELAY},
    cli::RunnerConfig,
    common::{get_qos, SubStats},
    link::{ConnectionError, Link},
};

pub struct Subscriber {
    link: Link,
    config: Arc<RunnerConfig>,
}

impl Subscriber {
    pub(crate) async fn new(
        mut link: Link,
        config: Arc<RunnerConfig>,
    ) -> Result<Subscriber, ConnectionError> {
        link.client
            .subscribe(config.topic.as_str(), get_qos(config.qos))
            .await?;

        // waiting for subscription confirmation
        loop {
            let event = link.eventloop.poll().await?;
            if let Event::Incoming(v) = event {
                if subscribed(&config.topic, v)? {
                    break;
                }
            }
        }

        debug!("Subscribed: clientId={}, topic={}", link.id, config.topic);
        Ok(Subscriber { link, config })
    }

    /// Forwards every incoming publish to the sink until the run is
    /// cancelled or the sink hangs up
    pub async fn start(
        mut self,
        barrier: Arc<Barrier>,
        sink: Sender<Delivery>,
        cancel: CancellationToken,
    ) -> (SubStats, Link) {
        let mut stats = SubStats::default();

        // publishes can come in before the others are subscribed
        let waited = wait_polling(&mut self.link, &barrier).await;
        stats.reconnects += waited.reconnects;
        for event in waited.events {
            if !self.handle(event, &mut stats, &sink).await {
                return (stats, self.link);
            }
        }

        loop {
            let event = select! {
                _ = cancel.cancelled() => break,
                event = self.link.eventloop.poll() => event,
            };

            let event = match event {
                Ok(v) => v,
                Err(e) => {
                    error!("Id = {}, Connection error = {:?}", self.link.id, e);
                    stats.reconnects += 1;
                    time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            if !self.handle(event, &mut stats, &sink).await {
                break;
            }
        }

        (stats, self.link)
    }

    /// False once this subscriber should stop
    async fn handle(
        &mut self,
        event: Event,
        stats: &mut SubStats,
        sink: &Sender<Delivery>,
    ) -> bool {
        match action(&self.link.id, event) {
            Action::Forward(delivery) => {
                stats.publish_count += 1;
                // sink is done
                sink.send_async(delivery).await.is_ok()
            }
            Action::Resubscribe => {
                // clean session, so the broker forgot the subscription
                warn!("Id = {}, Reconnected, subscribing again", self.link.id);
                let qos = get_qos(self.config.qos);
                match self.link.client.try_subscribe(self.config.topic.as_str(), qos) {
                    Ok(_) => true,
                    Err(e) => {
                        error!("Id = {}, Resubscribe failed = {:?}", self.link.id, e);
                        false
                    }
                }
            }
            Action::Ignore => true,
        }
    }
}

/// Whether `incoming` confirms the subscription to `topic`. Pings can
/// overtake the SUBACK, anything else is an error.
fn subscribed(topic: &str, incoming: Incoming) -> Result<bool, ConnectionError> {
    match incoming {
        Incoming::SubAck(ack) => {
            let rejected = ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure));
            if rejected {
                return Err(ConnectionError::SubscribeRejected(topic.to_owned()));
            }
            Ok(true)
        }
        Incoming::PingResp => Ok(false),
        incoming => Err(ConnectionError::WrongPacket(incoming)),
    }
}

/// What a subscribed client does with an eventloop event
#[derive(Debug)]
enum Action {
    Forward(Delivery),
    Resubscribe,
    Ignore,
}

fn action(id: &str, event: Event) -> Action {
    match event {
        Event::Incoming(Incoming::Publish(publish)) => Action::Forward(Delivery {
            client: id.to_owned(),
            topic: String::from_utf8_lossy(publish.topic.as_ref()).into_owned(),
            payload: publish.payload,
        }),
        Event::Incoming(Incoming::ConnAck(_)) => Action::Resubscribe,
        Event::Incoming(Incoming::SubAck(_))
        | Event::Incoming(Incoming::PingResp)
        | Event::Outgoing(_) => Action::Ignore,
        incoming => {
            debug!("Id = {}, Unexpected incoming packet = {:?}", id, incoming);
            Action::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Outgoing, PubAck, Publish, QoS, SubAck};

    fn suback(code: SubscribeReasonCode) -> Incoming {
        Incoming::SubAck(SubAck::new(1, vec![code]))
    }

    #[test]
    fn publishes_are_forwarded_with_the_client_id() {
        let publish = Publish::new("mqtt-mock/benchmark/3", QoS::AtLeastOnce, vec![b'0'; 16]);
        let event = Event::Incoming(Incoming::Publish(publish));

        match action("mqttbench-1f-2", event) {
            Action::Forward(delivery) => {
                assert_eq!(delivery.client, "mqttbench-1f-2");
                assert_eq!(delivery.topic, "mqtt-mock/benchmark/3");
                assert_eq!(delivery.payload.len(), 16);
            }
            other => panic!("expected a delivery, got {:?}", other),
        }
    }

    #[test]
    fn reconnect_triggers_a_resubscribe() {
        let connack = ConnAck::new(ConnectReturnCode::Success, false);
        let action = action("mqttbench-1f-1", Event::Incoming(Incoming::ConnAck(connack)));
        assert!(matches!(action, Action::Resubscribe));
    }

    #[test]
    fn acks_and_pings_are_ignored() {
        let events = vec![
            Event::Incoming(suback(SubscribeReasonCode::Success(QoS::AtMostOnce))),
            Event::Incoming(Incoming::PingResp),
            Event::Incoming(Incoming::PubAck(PubAck::new(4))),
            Event::Outgoing(Outgoing::PingReq),
            Event::Outgoing(Outgoing::Subscribe(1)),
        ];

        for event in events {
            assert!(matches!(action("mqttbench-1f-1", event), Action::Ignore));
        }
    }

    #[test]
    fn ping_before_suback_keeps_waiting() {
        let topic = "mqtt-mock/benchmark/";
        assert!(!subscribed(topic, Incoming::PingResp).unwrap());

        let ack = suback(SubscribeReasonCode::Success(QoS::ExactlyOnce));
        assert!(subscribed(topic, ack).unwrap());
    }

    #[test]
    fn suback_failures_and_strays_are_errors() {
        let topic = "mqtt-mock/benchmark/";
        let err = subscribed(topic, suback(SubscribeReasonCode::Failure)).unwrap_err();
        assert!(matches!(err, ConnectionError::SubscribeRejected(t) if t == topic));

        let err = subscribed(topic, Incoming::PubAck(PubAck::new(1))).unwrap_err();
        assert!(matches!(err, ConnectionError::WrongPacket(_)));
    }
}
