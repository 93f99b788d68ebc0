mod cli;
mod config;

use std::sync::Arc;

use anyhow::Context;
use duet_client::{
    Components, ControllerSettings, NoticeLevel, RtcTransportFactory, SampleDevice,
    SessionController, SessionHandle, WsRelayConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;

    let mut config = config::load_config(&args.config_path)?;
    if let Some(url) = args.relay_url {
        config.relay.url = url;
    }
    if args.auto_join {
        config.session.auto_join = true;
    }
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{}", issue);
            } else {
                warn!("{}", issue);
            }
        }
        if has_errors {
            error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    info!(
        relay = %config.relay.url,
        auto_join = config.session.auto_join,
        version = env!("CARGO_PKG_VERSION"),
        "Starting duet"
    );

    let mut settings = ControllerSettings::from_config(&config);
    settings.guest_name = args.name;
    let components = Components {
        media: Arc::new(SampleDevice::new(config.media.enabled)),
        relay: Arc::new(WsRelayConnector::new(
            config.relay.url.clone(),
            config.relay.tls_cert.clone(),
            config.relay.max_message_size,
        )),
        transports: Arc::new(RtcTransportFactory::new()),
    };
    let controller = SessionController::new(components, settings);
    let session = controller.handle();
    let controller_task = tokio::spawn(controller.run());

    spawn_status_log(&session);
    spawn_notice_log(&session);

    session.open_media().context("Session controller exited early")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !run_command(&session, line.trim()) {
                            break;
                        }
                    }
                    Ok(None) => {
                        // Detached from a terminal; keep running until signalled
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {e}");
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    if session.shutdown().is_ok()
        && let Err(e) = controller_task.await
    {
        warn!("Session controller panicked: {e:?}");
    }
    info!("Client shutdown complete");
    Ok(())
}

/// Returns false when the user asked to quit.
fn run_command(session: &SessionHandle, command: &str) -> bool {
    let result = match command {
        "" => Ok(()),
        "open" => session.open_media(),
        "join" => session.join_queue(),
        "leave" => session.leave_queue(),
        "next" | "skip" => session.skip(),
        "forget" => session.forget(),
        "reset" => session.reset(),
        "status" => {
            let snapshot = session.snapshot();
            println!(
                "{} as {}{}",
                snapshot.status,
                snapshot.local_identity,
                snapshot
                    .remote_label()
                    .map(|label| format!(" | {label}"))
                    .unwrap_or_default()
            );
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            warn!("Unknown command: {other} (open, join, leave, next, forget, reset, status, quit)");
            Ok(())
        }
    };
    if let Err(e) = result {
        error!("{e}");
        return false;
    }
    true
}

fn spawn_status_log(session: &SessionHandle) {
    let mut updates = session.subscribe();
    tokio::spawn(async move {
        let mut last = updates.borrow_and_update().status;
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.status == last {
                continue;
            }
            info!(
                status = %snapshot.status,
                identity = %snapshot.local_identity,
                remote = %snapshot.remote_label().unwrap_or_default(),
                "Session status"
            );
            last = snapshot.status;
        }
    });
}

fn spawn_notice_log(session: &SessionHandle) {
    let mut notices = session.notices();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => match notice.level {
                    NoticeLevel::Error => warn!("{}", notice.message),
                    NoticeLevel::Info | NoticeLevel::Success => info!("{}", notice.message),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notice log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
