use std::time::Duration;
use std::{fs, io};

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, Transport};
use tokio::time;

use crate::cli::{RunnerConfig, Scheme};

const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("IO error = {0:?}")]
    Io(#[from] io::Error),
    #[error("Connection error = {0:?}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("Wrong packet = {0:?}")]
    WrongPacket(Incoming),
    #[error("Client error = {0:?}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Subscription to {0} rejected by broker")]
    SubscribeRejected(String),
    #[error("Tls broker needs a ca file")]
    MissingCa,
}

/// A connected client and the eventloop that drives it
pub struct Link {
    pub id: String,
    pub client: AsyncClient,
    pub eventloop: EventLoop,
}

impl Link {
    pub(crate) async fn connect(id: String, config: &RunnerConfig) -> Result<Link, ConnectionError> {
        // Keep enough room in the request channel to fill the inflight window
        let cap = config.max_inflight as usize + 10;
        let (client, mut eventloop) = AsyncClient::new(options(config, &id)?, cap);
        eventloop
            .network_options
            .set_connection_timeout(config.conn_timeout);

        // waiting for connection
        loop {
            let event = eventloop.poll().await?;
            if let Event::Incoming(v) = event {
                match v {
                    Incoming::ConnAck(_) => break,
                    incoming => return Err(ConnectionError::WrongPacket(incoming)),
                }
            }
        }

        debug!("Connected: clientId={}", id);
        Ok(Link {
            id,
            client,
            eventloop,
        })
    }

    /// Sends a disconnect and polls until it's written out. Gives up quietly
    /// after a short timeout as the broker closes the connection anyway.
    pub async fn disconnect(mut self) {
        let client = self.client.clone();
        let eventloop = &mut self.eventloop;
        let request = async move {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect request failed = {:?}", e);
            }
        };

        let flush = async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };

        let disconnect = async {
            tokio::join!(request, flush);
        };

        if time::timeout(DISCONNECT_TIMEOUT, disconnect).await.is_err() {
            warn!("Id = {}, Disconnect timed out", self.id);
        }
    }
}

pub(crate) fn options(config: &RunnerConfig, id: &str) -> Result<MqttOptions, ConnectionError> {
    let mut options = MqttOptions::new(id, &config.broker.host, config.broker.port);
    options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive)));
    options.set_inflight(config.max_inflight);
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        let password = config.password.as_deref().unwrap_or_default();
        options.set_credentials(username, password);
    }

    if config.broker.scheme == Scheme::Tls || config.ca_file.is_some() {
        let ca_file = config.ca_file.as_ref().ok_or(ConnectionError::MissingCa)?;
        let ca = fs::read(ca_file)?;
        options.set_transport(Transport::tls(ca, None, None));
    }

    Ok(options)
}
