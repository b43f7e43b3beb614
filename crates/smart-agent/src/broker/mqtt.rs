//! MQTT implementation of [`BrokerLink`] on top of `rumqttc`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use rumqttc::{
    AsyncClient, ConnectionError, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BrokerError, BrokerLink, BrokerMessage, BrokerResult, LinkState};
use crate::config::BrokerConfig;

/// Size of the buffer between the MQTT event loop and the router.
const INBOUND_BUFFER_SIZE: usize = 256;

/// How long to keep polling after shutdown so the DISCONNECT packet goes out.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Inbound messages are requested at least once; publishing stays at most once.
const SUBSCRIBE_QOS: QoS = QoS::AtLeastOnce;

/// One MQTT client connection, shared by everything that publishes.
pub struct MqttLink {
    client: AsyncClient,
    topic: String,
    state: watch::Receiver<LinkState>,
}

impl MqttLink {
    /// Connect to the broker and start driving the client's event loop.
    ///
    /// Waits for the broker's CONNACK; any failure before it, or running past
    /// the configured connect timeout, is returned so startup can abort.
    /// After that, connection loss is logged and the event loop keeps
    /// polling, which is how `rumqttc` reconnects.
    ///
    /// The returned task finishes after `shutdown` fires and the DISCONNECT
    /// has been flushed; await it before dropping the runtime.
    pub async fn connect(
        config: &BrokerConfig,
        shutdown: CancellationToken,
    ) -> BrokerResult<(Self, mpsc::Receiver<BrokerMessage>, JoinHandle<()>)> {
        let addr = format!("{}:{}", config.host, config.port);
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, config.request_capacity);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        info!(
            "Connecting to MQTT broker at {} as {}",
            addr, config.client_id
        );
        match tokio::time::timeout(config.connect_timeout(), wait_for_connack(&mut eventloop))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(BrokerError::Connect {
                    addr,
                    message: err.to_string(),
                });
            }
            Err(_) => return Err(BrokerError::ConnectTimeout(config.connect_timeout())),
        }
        state_tx.send_replace(LinkState::Connected);
        info!("Connected to MQTT broker at {}", addr);

        if config.subscribe {
            client.subscribe(config.topic.clone(), SUBSCRIBE_QOS).await?;
            info!("Subscribed to topic {}", config.topic);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER_SIZE);
        let driver = Driver {
            eventloop,
            client: client.clone(),
            topic: config.topic.clone(),
            subscribe: config.subscribe,
            reconnect_delay: config.reconnect_delay(),
            state: state_tx,
            inbound: inbound_tx,
        };
        let driver = tokio::spawn(driver.run(shutdown));

        let link = Self {
            client,
            topic: config.topic.clone(),
            state: state_rx,
        };
        Ok((link, inbound_rx, driver))
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn publish(&self, payload: Bytes) -> BrokerResult<()> {
        if self.state() != LinkState::Connected {
            return Err(BrokerError::Disconnected);
        }
        // QoS 0, not retained. try_publish keeps callers off the request queue.
        self.client
            .try_publish(self.topic.clone(), QoS::AtMostOnce, false, payload.to_vec())?;
        Ok(())
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await? {
            MqttEvent::Incoming(Packet::ConnAck(ack)) => {
                debug!("CONNACK received: {:?}", ack.code);
                return Ok(());
            }
            other => trace!("MQTT event before CONNACK: {:?}", other),
        }
    }
}

/// Owns the `rumqttc` event loop after the initial connect.
struct Driver {
    eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    subscribe: bool,
    reconnect_delay: Duration,
    state: watch::Sender<LinkState>,
    inbound: mpsc::Sender<BrokerMessage>,
}

impl Driver {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            if *self.state.borrow() == LinkState::Disconnected {
                self.state.send_replace(LinkState::Connecting);
            }

            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    self.state.send_replace(LinkState::Connected);
                    info!("Reconnected to MQTT broker");
                    if self.subscribe {
                        if let Err(err) =
                            self.client.try_subscribe(self.topic.clone(), SUBSCRIBE_QOS)
                        {
                            warn!("Failed to resubscribe to {}: {}", self.topic, err);
                        }
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    let message = BrokerMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                    };
                    info!(
                        "Message \"{}\" received on topic \"{}\"",
                        String::from_utf8_lossy(&message.payload),
                        message.topic
                    );
                    if self.inbound.send(message).await.is_err() {
                        debug!("Inbound router is gone; discarding broker message");
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                    self.state.send_replace(LinkState::Disconnected);
                    warn!("Broker sent DISCONNECT");
                }
                Ok(event) => trace!("MQTT event: {:?}", event),
                Err(err) => {
                    let previous = self.state.send_replace(LinkState::Disconnected);
                    if previous == LinkState::Connected {
                        warn!("Connection Lost: {}", err);
                    } else {
                        debug!("Broker still unreachable: {}", err);
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }

        if *self.state.borrow() == LinkState::Connected && self.client.try_disconnect().is_ok() {
            let _ = tokio::time::timeout(DISCONNECT_GRACE, self.eventloop.poll()).await;
        }
        self.state.send_replace(LinkState::Disconnected);
        info!("MQTT event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// CONNACK, session not present, connection accepted.
    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn config_for(port: u16) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "agent-test".to_string(),
            connect_timeout_secs: 1,
            // Keep a dropped link down for the rest of the test.
            reconnect_delay_ms: 60_000,
            ..BrokerConfig::default()
        }
    }

    /// Accept one client, read its CONNECT and answer with CONNACK.
    async fn accept_client(listener: &TcpListener) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(buf[0] >> 4, 1, "expected CONNECT, got {:?}", &buf[..n]);
        socket.write_all(&CONNACK).await.unwrap();
        socket
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        // Grab a free port, then close it again.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = MqttLink::connect(&config_for(port), CancellationToken::new()).await;

        let err = result.err().expect("connect should fail");
        assert!(
            matches!(
                err,
                BrokerError::Connect { .. } | BrokerError::ConnectTimeout(_)
            ),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_connect_times_out_without_connack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accepts the TCP connection but never answers the CONNECT.
        let _silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let result = MqttLink::connect(&config_for(port), CancellationToken::new()).await;

        assert!(matches!(result, Err(BrokerError::ConnectTimeout(_))));
    }

    #[tokio::test]
    async fn test_publish_refused_after_connection_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move { accept_client(&listener).await });

        let shutdown = CancellationToken::new();
        let (link, _inbound, driver) = MqttLink::connect(&config_for(port), shutdown.clone())
            .await
            .unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        link.publish(Bytes::from_static(b"while up")).await.unwrap();

        // Broker goes away.
        drop(broker.await.unwrap());

        let mut state = link.watch_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s != LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        let err = link.publish(Bytes::from_static(b"while down")).await;
        assert!(matches!(err, Err(BrokerError::Disconnected)));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), driver)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_sends_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut socket = accept_client(&listener).await;
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let shutdown = CancellationToken::new();
        let (link, _inbound, driver) = MqttLink::connect(&config_for(port), shutdown.clone())
            .await
            .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(3), driver)
            .await
            .unwrap()
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), broker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.first(), Some(&0xE0), "expected DISCONNECT");
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
