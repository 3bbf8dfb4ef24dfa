//! Loopback session walkthrough.
//!
//! Establishes a session against the in-memory loopback server, streams a few
//! notifications (including a gap), simulates a server restart and closes.
//!
//! Run with `RUST_LOG=debug` to see the engine's own logging.
use anyhow::Context;
use ironua::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

async fn wait_for(
    session: &Session,
    what: &str,
    condition: impl Fn(&Session) -> bool,
) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition(session) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = SessionConfigBuilder::new()
        .session_name("loopback-demo")
        .endpoint_url("opc.tcp://localhost:4840")
        .keep_alive_interval(Duration::from_secs(2))
        .reconnect_period(Duration::from_millis(250))
        .build()?;

    let channel = Arc::new(LoopbackChannel::new());
    let temperature = SubscriptionTemplate::new(SubscriptionSettings::default()).with_observer(
        |event: &SubscriptionEvent| match event {
            SubscriptionEvent::Notification(message) => info!(
                sequence = %message.sequence_number,
                bytes = message.payload.len(),
                "temperature update"
            ),
            SubscriptionEvent::DataLoss(loss) => {
                info!(lost = loss.count(), "temperature updates lost");
            }
            other => info!(event = ?other, "temperature subscription"),
        },
    );

    let session = SessionBuilder::new(config)
        .with_subscription_template(temperature)
        .with_observer(EventKind::StateChanged, |event| {
            if let SessionEvent::StateChanged { from, to } = event {
                info!(%from, %to, "connection state");
            }
        })
        .with_observer(EventKind::SubscriptionsChanged, |event| {
            info!(event = ?event, "subscriptions changed");
        })
        .connect(channel.clone())
        .await?;
    info!(session_id = %session.session_id(), "connected");

    let subscription = SubscriptionId::new(1);
    channel.push_notification(subscription, 1, b"21.5");
    channel.push_notification(subscription, 2, b"21.7");
    channel.push_keep_alive(subscription, 3);
    channel.push_notification(subscription, 200, b"23.0");
    wait_for(&session, "notifications", |s| {
        s.subscription(subscription)
            .is_some_and(|info| info.last_acked.value() == 200)
    })
    .await?;

    info!("simulating a server restart");
    channel.drop_session();
    channel.push_fault(ServiceFault::SessionIdInvalid);
    wait_for(&session, "recovery", |s| {
        s.state() == ConnectionState::Connected && s.session_id().as_str() != "loopback-demo-1"
    })
    .await?;
    info!(
        session_id = %session.session_id(),
        subscriptions = ?session.subscriptions().iter().map(|s| s.id).collect::<Vec<_>>(),
        "recovered"
    );

    let report = session.close().await?;
    info!(
        completed = report.completed,
        cancelled = report.cancelled,
        "closed"
    );
    Ok(())
}
