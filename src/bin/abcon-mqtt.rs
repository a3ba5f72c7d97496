//! MQTT bridge: couples an AB-bus protocol session to a broker.
//!
//! Companion to a serial bridge that exposes the bus as raw frames on
//! `<root>/packet/rx` and accepts frames to transmit on `<root>/packet/tx`.
//! High-level control arrives as JSON on `<root>/control`; decoded state goes
//! out on `<root>/status` and `<root>/update`.
//!
//! Usage: abcon-mqtt --config aircon.toml [-r] [-p] [-s] [-v]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use log::{LevelFilter, debug, error, info, warn};
use mqtt_async_client::client::{Client, KeepAlive, Publish, QoS, Subscribe, SubscribeTopic};
use serde_json::{Value, json};

use abcon::config::{Config, Credentials};
use abcon::{BroadcastKind, CommandError, DEFAULT_ADDR, Events, FrameSink, Session, UnitState};

#[derive(Parser, Debug)]
#[command(
    name = "abcon-mqtt",
    version,
    about = "Packet processing bridge for a Toshiba air conditioner on MQTT"
)]
struct Args {
    /// Configuration file
    #[arg(short = 'f', long, value_name = "FILE")]
    config: PathBuf,

    /// Disable packet transmission (listen only)
    #[arg(short = 'r', long)]
    listen_only: bool,

    /// Log every bus packet
    #[arg(short = 'p', long)]
    packet_log: bool,

    /// Log every status snapshot
    #[arg(short = 's', long)]
    status_log: bool,

    /// Set logging level to debug
    #[arg(short = 'v', long)]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// Outbox: everything published to the broker funnels through one queue,
// drained from the main loop only.
// ---------------------------------------------------------------------------

struct OutMsg {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

type Outbox = Arc<Mutex<VecDeque<OutMsg>>>;

fn push_out(outbox: &Outbox, topic: String, payload: Vec<u8>, qos: QoS, retain: bool) {
    let Ok(mut queue) = outbox.lock() else { return };
    queue.push_back(OutMsg {
        topic,
        payload,
        qos,
        retain,
    });
}

struct MqttSink {
    root: String,
    outbox: Outbox,
}

impl FrameSink for MqttSink {
    fn transmit(&mut self, frame: &[u8]) {
        push_out(
            &self.outbox,
            format!("{}/packet/tx", self.root),
            frame.to_vec(),
            QoS::AtMostOnce,
            false,
        );
    }
}

struct MqttEvents {
    root: String,
    outbox: Outbox,
    status_log: bool,
}

impl MqttEvents {
    fn push_processor(&self, value: Value, retain: bool) {
        push_out(
            &self.outbox,
            format!("{}/client/processor", self.root),
            value.to_string().into_bytes(),
            QoS::AtLeastOnce,
            retain,
        );
    }

    fn push_json(&self, suffix: &str, value: &impl serde::Serialize) {
        match serde_json::to_vec(value) {
            Ok(bytes) => push_out(
                &self.outbox,
                format!("{}/{suffix}", self.root),
                bytes,
                QoS::AtMostOnce,
                false,
            ),
            Err(e) => warn!("cannot serialise {suffix} payload: {e}"),
        }
    }
}

impl Events for MqttEvents {
    fn on_start(&mut self) {
        self.push_processor(json!({"state": "start"}), true);
    }

    fn on_ready(&mut self) {
        self.push_processor(json!({"state": "ready"}), true);
    }

    fn on_state_change(&mut self, name: &'static str) {
        self.push_processor(json!({"internal_state": name}), false);
    }

    fn on_status(&mut self, unit: &UnitState, _kind: BroadcastKind) {
        let report = unit.status_report();
        if self.status_log {
            info!(target: "abcon::status", "{report:?}");
        }
        self.push_json("status", &report);
    }

    fn on_update(&mut self, unit: &UnitState) {
        self.push_json("update", &unit.sensor_report());
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

fn handle_message(
    session: &mut Session,
    bridge_alive: &mut bool,
    root: &str,
    topic: &str,
    payload: &[u8],
    args: &Args,
) {
    let Some(suffix) = topic.strip_prefix(root).and_then(|t| t.strip_prefix('/')) else {
        return;
    };
    match suffix {
        "packet/rx" => {
            debug!("rx {}", hex(payload));
            if args.packet_log {
                info!(target: "abcon::packet", "RX {}", hex(payload));
            }
            session.on_frame(payload, Instant::now());
        }
        "packet/tx" => {
            debug!("tx {}", hex(payload));
            if args.packet_log {
                info!(target: "abcon::packet", "TX {}", hex(payload));
            }
        }
        "packet/error" => {
            info!("bridge packet error: {}", String::from_utf8_lossy(payload));
            if args.packet_log {
                info!(target: "abcon::packet", "ERR {}", String::from_utf8_lossy(payload));
            }
        }
        "control" => {
            if *bridge_alive {
                dispatch_control(session, payload);
            }
        }
        "client/bridge" => match serde_json::from_slice::<Value>(payload) {
            Ok(value) => match value.get("connection").and_then(Value::as_str) {
                Some("alive") => {
                    info!("bridge connection alive");
                    session.reset();
                    *bridge_alive = true;
                }
                Some("dead") => {
                    warn!("bridge connection dead");
                    session.reset();
                    *bridge_alive = false;
                }
                _ => {}
            },
            Err(e) => error!("client message is not valid json: {e}"),
        },
        // Our own status/update/processor publishes come back on the
        // wildcard subscription; nothing to do with them.
        _ => {}
    }
}

fn dispatch_control(session: &mut Session, payload: &[u8]) {
    let ctrl: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            error!("control message is not valid json: {e}");
            return;
        }
    };
    let Some(map) = ctrl.as_object() else {
        error!("control message is not a json object");
        return;
    };
    info!("control: {ctrl}");
    for (key, value) in map {
        let outcome = match key.as_str() {
            "set_temp" => match value.as_i64() {
                Some(temp) => session.set_temp(temp as i16),
                None => Err(CommandError::InvalidArgument(format!(
                    "temperature must be a number, got {value}"
                ))),
            },
            op @ ("set_power" | "set_mode" | "set_fan" | "set_save" | "set_humid") => {
                match short_cmd(value) {
                    Some(cmd) => match op {
                        "set_power" => session.set_power(&cmd),
                        "set_mode" => session.set_mode(&cmd),
                        "set_fan" => session.set_fan(&cmd),
                        "set_save" => session.set_save(&cmd),
                        _ => session.set_humid(&cmd),
                    },
                    None => Err(CommandError::InvalidArgument(format!(
                        "{op} takes a string value"
                    ))),
                }
            }
            _ => continue,
        };
        if let Err(e) = outcome {
            warn!("{key} rejected: {e}");
        }
    }
}

/// Control values may arrive as strings, bools, or bare numbers.
fn short_cmd(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X} ")).collect::<String>().trim_end().to_string()
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

fn tls_config(creds: &Credentials) -> Result<rustls::ClientConfig, Box<dyn std::error::Error>> {
    use std::fs::File;
    use std::io::BufReader;

    let mut tls = rustls::ClientConfig::new();
    match &creds.cacert {
        Some(path) => {
            let mut reader = BufReader::new(File::open(path)?);
            tls.root_store
                .add_pem_file(&mut reader)
                .map_err(|()| format!("no CA certificates in {}", path.display()))?;
        }
        None => {
            warn!("insecure mode: TLS server verification disabled");
            tls.dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCert));
        }
    }
    if let (Some(certfile), Some(keyfile)) = (&creds.certfile, &creds.keyfile) {
        let certs = rustls::internal::pemfile::certs(&mut BufReader::new(File::open(certfile)?))
            .map_err(|()| format!("no client certificate in {}", certfile.display()))?;
        let mut keys =
            rustls::internal::pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(keyfile)?))
                .map_err(|()| format!("unreadable client key {}", keyfile.display()))?;
        if keys.is_empty() {
            keys = rustls::internal::pemfile::rsa_private_keys(&mut BufReader::new(File::open(
                keyfile,
            )?))
            .map_err(|()| format!("unreadable client key {}", keyfile.display()))?;
        }
        let key = keys
            .into_iter()
            .next()
            .ok_or_else(|| format!("no private key in {}", keyfile.display()))?;
        tls.set_single_client_cert(certs, key)?;
    }
    Ok(tls)
}

struct AcceptAnyCert;

impl rustls::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<rustls::ServerCertVerified, rustls::TLSError> {
        Ok(rustls::ServerCertVerified::assertion())
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    if let Err(e) = run(args) {
        error!("fatal: {e}");
        process::exit(1);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args.config)?;
    let root = config.broker.topic.clone();

    let mut builder = Client::builder();
    builder
        .set_url_string(&format!("mqtt://{}:{}", config.broker.host, config.broker.port))?
        .set_username(config.credentials.username.clone())
        .set_password(config.credentials.password.clone().map(String::into_bytes))
        .set_client_id(config.credentials.client_id.clone())
        .set_keep_alive(KeepAlive::from_secs(30))
        .set_connect_retry_delay(Duration::from_secs(5))
        .set_automatic_connect(true);
    if config.broker.tls {
        info!("using TLS for the MQTT connection");
        builder.set_tls_client_config(tls_config(&config.credentials)?);
    }
    let mut client = builder.build()?;

    client.connect().await?;
    info!(
        "connected to {}:{}, topic root {root}",
        config.broker.host, config.broker.port
    );
    client
        .subscribe(Subscribe::new(vec![SubscribeTopic {
            topic_path: format!("{root}/#"),
            qos: QoS::AtLeastOnce,
        }]))
        .await?;

    let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));
    let mut session = Session::new(DEFAULT_ADDR);
    session.set_events(MqttEvents {
        root: root.clone(),
        outbox: outbox.clone(),
        status_log: args.status_log,
    });
    if args.listen_only {
        info!("listen-only mode: transmission disabled");
    } else {
        session.set_sink(MqttSink {
            root: root.clone(),
            outbox: outbox.clone(),
        });
    }
    let mut bridge_alive = false;

    // Announce ourselves; `ready` follows from the session once the first
    // broadcast lands.
    push_out(
        &outbox,
        format!("{root}/client/processor"),
        json!({"state": "start"}).to_string().into_bytes(),
        QoS::AtLeastOnce,
        true,
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    loop {
        tokio::select! {
            read = client.read_subscriptions() => match read {
                Ok(msg) => handle_message(
                    &mut session,
                    &mut bridge_alive,
                    &root,
                    msg.topic(),
                    msg.payload(),
                    &args,
                ),
                Err(e) => {
                    warn!("mqtt read error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        session.tick(Instant::now());
        drain(&mut client, &outbox).await;
    }

    // Retained offline marker in place of a broker-side will.
    info!("shutting down");
    let mut offline = Publish::new(
        format!("{root}/client/processor"),
        json!({"state": "offline"}).to_string().into_bytes(),
    );
    offline.set_qos(QoS::AtLeastOnce).set_retain(true);
    if let Err(e) = client.publish(&offline).await {
        warn!("cannot publish offline state: {e}");
    }
    client.disconnect().await?;
    Ok(())
}

async fn drain(client: &mut Client, outbox: &Outbox) {
    loop {
        let msg = {
            let Ok(mut queue) = outbox.lock() else { return };
            queue.pop_front()
        };
        let Some(msg) = msg else { return };
        let mut publish = Publish::new(msg.topic, msg.payload);
        publish.set_qos(msg.qos).set_retain(msg.retain);
        if let Err(e) = client.publish(&publish).await {
            warn!("publish failed: {e}");
        }
    }
}
