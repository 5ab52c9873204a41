use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rumqttc::{
    Client, ClientError, Connection, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
};

use super::{validate_intensity, Actuator, Credentials, TransportError, TransportOptions};
use crate::cancel::CancelToken;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// What the connection driver reports back to `send`.
#[derive(Debug)]
enum Signal {
    Ack,
    Lost,
}

/// Publishes intensities to `{base}/cmnd/Dimmer`. A background thread owns
/// the connection and reconnects after the broker goes away.
pub struct MqttDimmer {
    client: Client,
    topic: String,
    qos: QoS,
    timeout: Option<Duration>,
    signals: Receiver<Signal>,
    stop: CancelToken,
    driver: Option<JoinHandle<()>>,
}

impl MqttDimmer {
    /// Connect and wait for the broker to accept the session.
    pub fn connect(
        host: &str,
        port: u16,
        credentials: Option<&Credentials>,
        base_topic: &str,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        mqtt_options.set_clean_session(true);
        if let Some(creds) = credentials {
            mqtt_options.set_credentials(creds.username.clone(), creds.password.clone().unwrap_or_default());
        }

        let (client, mut connection) = Client::new(mqtt_options, 10);
        wait_for_connack(&mut connection, options.timeout)?;

        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        let stop = CancelToken::new();
        let driver = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("mqtt-driver".into())
                .spawn(move || drive(connection, signal_tx, stop))?
        };

        Ok(Self {
            client,
            topic: dimmer_topic(base_topic),
            qos: QoS::AtLeastOnce,
            timeout: options.timeout,
            signals: signal_rx,
            stop,
            driver: Some(driver),
        })
    }

    /// Whether `send` waits for the broker to acknowledge each publish.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.qos = if blocking { QoS::AtLeastOnce } else { QoS::AtMostOnce };
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn wait_for_ack(&self) -> Result<(), TransportError> {
        let signal = match self.timeout {
            Some(timeout) => self.signals.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => TransportError::Timeout("publish acknowledgement"),
                RecvTimeoutError::Disconnected => TransportError::Closed,
            })?,
            None => self.signals.recv().map_err(|_| TransportError::Closed)?,
        };
        match signal {
            Signal::Ack => Ok(()),
            // The publish stays queued and goes out again once reconnected.
            Signal::Lost => Err(TransportError::Disconnected),
        }
    }
}

impl Actuator for MqttDimmer {
    fn send(&mut self, intensity: i32) -> Result<(), TransportError> {
        let level = validate_intensity(intensity)?;
        if self.driver.is_none() {
            return Err(TransportError::Closed);
        }

        // Only one publish is ever in flight, so anything still queued is stale.
        while self.signals.try_recv().is_ok() {}

        // Never block the caller on a full request queue while reconnecting.
        match self
            .client
            .try_publish(self.topic.as_str(), self.qos, false, level.to_string().into_bytes())
        {
            Ok(()) => {}
            Err(ClientError::Request(_)) => return Err(TransportError::Closed),
            Err(err) => return Err(err.into()),
        }
        if self.qos == QoS::AtLeastOnce {
            self.wait_for_ack()?;
        }

        log::debug!("Published {} to {}", level, self.topic);
        Ok(())
    }

    fn close(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        self.stop.cancel();
        if let Err(err) = self.client.try_disconnect() {
            log::warn!("Failed to disconnect from broker: {}", err);
        }
        if driver.join().is_err() {
            log::warn!("MQTT driver thread panicked");
        }
        log::info!("Disconnected from broker");
    }
}

impl Drop for MqttDimmer {
    fn drop(&mut self) {
        self.close();
    }
}

/// `{base}/cmnd/Dimmer`, or `cmnd/Dimmer` without a base.
pub fn dimmer_topic(base: &str) -> String {
    let base = base.trim_matches('/');
    if base.is_empty() {
        "cmnd/Dimmer".to_string()
    } else {
        format!("{}/cmnd/Dimmer", base)
    }
}

fn wait_for_connack(connection: &mut Connection, timeout: Option<Duration>) -> Result<(), TransportError> {
    loop {
        let event = match timeout {
            Some(timeout) => connection
                .recv_timeout(timeout)
                .map_err(|_| TransportError::Timeout("connect acknowledgement"))?,
            None => connection.recv().map_err(|_| TransportError::Disconnected)?,
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(TransportError::ConnectRefused(ack.code));
                }
                return Ok(());
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => return Err(TransportError::ConnectRefused(code)),
            Err(err) => return Err(TransportError::Connect(err)),
        }
    }
}

/// Runs the connection's event loop, forwarding publish acks and lost
/// connections. Polling again after an error reconnects, so this only returns
/// once we disconnect or `stop` fires; then the signal channel closes.
fn drive(mut connection: Connection, signals: Sender<Signal>, stop: CancelToken) {
    let mut lost = false;
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                let _ = signals.send(Signal::Ack);
            }
            // Closing while the disconnect request could not be queued.
            Ok(Event::Incoming(Packet::ConnAck(_))) if stop.is_cancelled() => break,
            Ok(Event::Incoming(Packet::ConnAck(_))) if lost => {
                log::info!("Reconnected to broker");
                lost = false;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(err) => {
                if stop.is_cancelled() {
                    break;
                }
                if lost {
                    log::debug!("Reconnect failed: {}", err);
                } else {
                    log::warn!("MQTT connection lost, reconnecting: {}", err);
                    lost = true;
                }
                let _ = signals.send(Signal::Lost);
                if stop.wait_timeout(RECONNECT_DELAY) {
                    break;
                }
            }
        }
    }
}
