// LISTEN/NOTIFY transport.
//
// One background task owns a dedicated `PgListener` connection. It LISTENs on
// every channel that has a local subscriber, reconnects with backoff when the
// connection drops and re-issues LISTEN for all live channels. Envelopes that
// exceed the NOTIFY payload limit are written to `backplane_spill` and the
// notification carries only the spill row id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quire_common::protocol::envelope::Envelope;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SubscriberTable;

/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
const NOTIFY_PAYLOAD_LIMIT: usize = 7_900;
const SPILL_PREFIX: &str = "spill:";
const SPILL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(10);

enum ListenCommand {
    Listen(String),
    Unlisten(String),
}

struct PgShared {
    pool: PgPool,
    subscribers: SubscriberTable,
    connected: AtomicBool,
}

#[derive(Clone)]
pub struct PgBackplane {
    shared: Arc<PgShared>,
    commands: mpsc::UnboundedSender<ListenCommand>,
}

impl PgBackplane {
    /// Spawn the listener task. Must be called inside a tokio runtime.
    pub fn start(pool: PgPool) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(PgShared {
            pool,
            subscribers: SubscriberTable::default(),
            connected: AtomicBool::new(false),
        });
        tokio::spawn(run_listener(Arc::clone(&shared), receiver));
        Self { shared, commands }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub(super) async fn publish(&self, envelope: &Envelope) -> bool {
        if !self.is_connected() {
            return false;
        }

        let channel = envelope.key.channel_name();
        let raw = match envelope.encode() {
            Ok(raw) => raw,
            Err(error) => {
                warn!(error = %error, channel = %channel, "failed to encode backplane envelope");
                return false;
            }
        };

        let payload = if raw.len() > NOTIFY_PAYLOAD_LIMIT {
            match spill(&self.shared.pool, &channel, &raw).await {
                Ok(id) => format!("{SPILL_PREFIX}{id}"),
                Err(error) => {
                    warn!(error = %error, channel = %channel, "failed to spill backplane envelope");
                    return false;
                }
            }
        } else {
            raw
        };

        match sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(&payload)
            .execute(&self.shared.pool)
            .await
        {
            Ok(_) => true,
            Err(error) => {
                warn!(error = %error, channel = %channel, "backplane NOTIFY failed");
                false
            }
        }
    }

    pub(super) fn subscribe(&self, channel: &str) -> (u64, mpsc::UnboundedReceiver<Envelope>) {
        let (id, receiver, first) = self.shared.subscribers.add(channel);
        if first {
            let _ = self.commands.send(ListenCommand::Listen(channel.to_owned()));
        }
        (id, receiver)
    }

    pub(super) fn unsubscribe(&self, channel: &str, id: u64) {
        if self.shared.subscribers.remove(channel, id) {
            let _ = self.commands.send(ListenCommand::Unlisten(channel.to_owned()));
        }
    }
}

async fn spill(pool: &PgPool, channel: &str, raw: &str) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO backplane_spill (id, channel, payload) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(channel)
        .bind(raw)
        .execute(pool)
        .await?;
    Ok(id)
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

async fn run_listener(shared: Arc<PgShared>, mut commands: mpsc::UnboundedReceiver<ListenCommand>) {
    let mut backoff = RECONNECT_BACKOFF_MIN;
    loop {
        match connect(&shared).await {
            Ok(mut listener) => {
                backoff = RECONNECT_BACKOFF_MIN;
                shared.connected.store(true, Ordering::SeqCst);
                info!("backplane listener connected");

                let exit = pump(&shared, &mut listener, &mut commands).await;
                shared.connected.store(false, Ordering::SeqCst);
                match exit {
                    PumpExit::Shutdown => {
                        debug!("backplane listener shutting down");
                        return;
                    }
                    PumpExit::Lost(error) => {
                        warn!(error = %error, "backplane listener lost its connection");
                    }
                }
            }
            Err(error) => {
                warn!(error = %error, retry_in_ms = backoff.as_millis() as u64, "backplane listener failed to connect");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
    }
}

async fn connect(shared: &PgShared) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(&shared.pool).await?;
    let channels = shared.subscribers.channels();
    if !channels.is_empty() {
        listener.listen_all(channels.iter().map(String::as_str)).await?;
    }
    Ok(listener)
}

async fn pump(
    shared: &PgShared,
    listener: &mut PgListener,
    commands: &mut mpsc::UnboundedReceiver<ListenCommand>,
) -> PumpExit {
    let mut sweep = tokio::time::interval(SPILL_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            command = commands.recv() => {
                let result = match command {
                    None => return PumpExit::Shutdown,
                    Some(ListenCommand::Listen(channel)) => listener.listen(&channel).await,
                    Some(ListenCommand::Unlisten(channel)) => listener.unlisten(&channel).await,
                };
                if let Err(error) = result {
                    return PumpExit::Lost(error.to_string());
                }
            }
            notification = listener.try_recv() => match notification {
                Ok(Some(notification)) => {
                    deliver(shared, notification.channel(), notification.payload()).await;
                }
                Ok(None) => return PumpExit::Lost("connection closed".to_string()),
                Err(error) => return PumpExit::Lost(error.to_string()),
            },
            _ = sweep.tick() => sweep_spill(&shared.pool).await,
        }
    }
}

async fn deliver(shared: &PgShared, channel: &str, payload: &str) {
    let raw = match payload.strip_prefix(SPILL_PREFIX) {
        Some(id) => match load_spill(&shared.pool, id).await {
            Some(raw) => raw,
            None => {
                warn!(channel = %channel, spill_id = %id, "spilled backplane envelope is missing");
                return;
            }
        },
        None => payload.to_owned(),
    };

    match Envelope::decode(&raw) {
        Ok(envelope) => {
            shared.subscribers.dispatch(channel, &envelope);
        }
        Err(error) => warn!(error = %error, channel = %channel, "dropping malformed backplane envelope"),
    }
}

async fn load_spill(pool: &PgPool, id: &str) -> Option<String> {
    let id = Uuid::parse_str(id).ok()?;
    sqlx::query_scalar::<_, String>("SELECT payload FROM backplane_spill WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
}

async fn sweep_spill(pool: &PgPool) {
    if let Err(error) =
        sqlx::query("DELETE FROM backplane_spill WHERE created_at < now() - interval '5 minutes'")
            .execute(pool)
            .await
    {
        debug!(error = %error, "failed to sweep backplane spill table");
    }
}
