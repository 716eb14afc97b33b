//! Command handlers for the gattlink CLI

use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::info;
use uuid::Uuid;

use gattlink_core::{LinkStatus, Phase, PowerStatus, StatusEvent};

use crate::app::GattlinkApp;
use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command, then stop the service
    pub async fn execute(cli: Cli, mut app: GattlinkApp) -> Result<()> {
        let result = match cli.command {
            Commands::Status => Self::handle_status_command(&app).await,
            Commands::Forget => Self::handle_forget_command(&app).await,
            command => {
                let service = app.config().resolve_service(cli.service)?;
                Self::run_data_command(&mut app, service, command).await
            }
        };
        app.stop().await?;
        result
    }

    async fn run_data_command(app: &mut GattlinkApp, service: Uuid, command: Commands) -> Result<()> {
        match command {
            Commands::Attach { force_scan } => {
                let snapshot = app.attach(service, force_scan).await?;
                match &snapshot.peripheral {
                    Some(peripheral) => println!("Attached to {}", peripheral),
                    None => println!("Attached"),
                }
                Ok(())
            }
            Commands::Read { characteristic } => {
                app.attach(service, false).await?;
                app.service().read(service, characteristic)?;
                let event = app
                    .wait_for("the characteristic value", |event| {
                        matches!(event, StatusEvent::ValueChanged { characteristic: c, .. } if *c == characteristic)
                    })
                    .await?;
                println!("{}", describe(&event));
                Ok(())
            }
            Commands::Write {
                characteristic,
                data,
                ack,
            } => {
                let payload = parse_payload(&data)?;
                app.attach(service, false).await?;
                app.service().write(service, characteristic, payload, ack)?;
                if ack {
                    let event = app
                        .wait_for("the write acknowledgement", |event| {
                            matches!(event, StatusEvent::WriteConfirmed { characteristic: c, .. } if *c == characteristic)
                        })
                        .await?;
                    if let StatusEvent::WriteConfirmed {
                        error: Some(error), ..
                    } = event
                    {
                        return Err(CliError::WriteFailed(error));
                    }
                    println!("Write acknowledged");
                } else {
                    app.drain().await?;
                    println!("Write sent");
                }
                Ok(())
            }
            Commands::Notify {
                characteristic,
                seconds,
            } => Self::handle_notify_command(app, service, characteristic, seconds).await,
            Commands::Rssi { count } => {
                app.attach(service, false).await?;
                for reading in 0..count {
                    if reading > 0 {
                        time::sleep(Duration::from_secs(1)).await;
                    }
                    app.service().read_rssi()?;
                    let event = app
                        .wait_for("an RSSI reading", |event| {
                            matches!(event, StatusEvent::RssiChanged(_))
                        })
                        .await?;
                    println!("{}", describe(&event));
                }
                Ok(())
            }
            Commands::Status | Commands::Forget => Ok(()),
        }
    }

    /// Subscribe, print values until the time is up or Ctrl+C, unsubscribe
    async fn handle_notify_command(
        app: &mut GattlinkApp,
        service: Uuid,
        characteristic: Uuid,
        seconds: u64,
    ) -> Result<()> {
        app.attach(service, false).await?;
        app.service().set_notify(service, characteristic, true)?;
        info!("Listening for {}s... Press Ctrl+C to stop", seconds);

        let until = Instant::now() + Duration::from_secs(seconds);
        loop {
            tokio::select! {
                event = app.status_until(until) => match event {
                    Some(event @ StatusEvent::ValueChanged { .. })
                    | Some(event @ StatusEvent::NotifyStateChanged { .. })
                    | Some(event @ StatusEvent::Link(_)) => println!("{}", describe(&event)),
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        app.service().set_notify(service, characteristic, false)?;
        app.drain().await
    }

    async fn handle_status_command(app: &GattlinkApp) -> Result<()> {
        let snapshot = app.service().snapshot().await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);

        match app.remembered()? {
            Some(record) => println!(
                "Remembered peripheral {} for service {}",
                record.peripheral_id, record.service
            ),
            None => println!("No remembered peripheral"),
        }
        Ok(())
    }

    async fn handle_forget_command(app: &GattlinkApp) -> Result<()> {
        app.service().forget_peripheral()?;
        // Requests are handled in order, so the snapshot reply means the forget ran
        app.service().snapshot().await?;
        println!("Forgot the remembered peripheral");
        Ok(())
    }
}

/// Decode a hex payload, tolerating a `0x` prefix and separators
pub fn parse_payload(data: &str) -> Result<Vec<u8>> {
    let cleaned: String = data
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !matches!(c, ' ' | ':' | '-' | '_'))
        .collect();
    Ok(hex::decode(cleaned)?)
}

/// One-line rendering of a status event
pub fn describe(event: &StatusEvent) -> String {
    match event {
        StatusEvent::Adapter(PowerStatus::OnLine) => "Adapter on".to_string(),
        StatusEvent::Adapter(PowerStatus::OffLine) => "Adapter off".to_string(),
        StatusEvent::Phase(phase) => format!("Phase: {}", phase_name(*phase)),
        StatusEvent::Link(LinkStatus::Connected { peripheral }) => {
            format!("Connected to {}", peripheral)
        }
        StatusEvent::Link(LinkStatus::Disconnected { peripheral, error }) => format!(
            "Disconnected from {}{}",
            peripheral.as_deref().unwrap_or("peripheral"),
            error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        ),
        StatusEvent::WriteConfirmed {
            characteristic,
            error: None,
            ..
        } => format!("{} write acknowledged", characteristic),
        StatusEvent::WriteConfirmed {
            characteristic,
            error: Some(error),
            ..
        } => format!("{} write failed: {}", characteristic, error),
        StatusEvent::NotifyStateChanged {
            characteristic,
            enabled,
            ..
        } => format!(
            "{} notifications {}",
            characteristic,
            if *enabled { "on" } else { "off" }
        ),
        StatusEvent::ValueChanged {
            characteristic,
            value,
            ..
        } => format!("{} = {}", characteristic, hex::encode(value)),
        StatusEvent::RssiChanged(rssi) => format!("RSSI {} dBm", rssi),
    }
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Scanning => "scanning",
        Phase::Retrieving => "retrieving",
        Phase::Ready => "ready",
        Phase::ScanSucceeded => "scan succeeded",
        Phase::RetrieveSucceeded => "retrieve succeeded",
        Phase::ScanTimedOut => "scan timed out",
        Phase::ScanFailed => "scan failed",
        Phase::ConnectTimedOut => "connect timed out",
        Phase::OperationTimedOut => "operation timed out",
        Phase::OperationFailed => "operation failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_accepts_common_spellings() {
        assert_eq!(parse_payload("7e0404").unwrap(), vec![0x7e, 0x04, 0x04]);
        assert_eq!(parse_payload("0x7e:04:04").unwrap(), vec![0x7e, 0x04, 0x04]);
        assert_eq!(parse_payload(" 7E 04 ").unwrap(), vec![0x7e, 0x04]);
        assert!(matches!(
            parse_payload("7e0"),
            Err(CliError::HexDecoding(_))
        ));
    }

    #[test]
    fn test_describe_value_and_disconnect() {
        let value = StatusEvent::ValueChanged {
            service: Uuid::nil(),
            characteristic: Uuid::nil(),
            value: vec![0xde, 0xad],
        };
        assert_eq!(
            describe(&value),
            "00000000-0000-0000-0000-000000000000 = dead"
        );

        let dropped = StatusEvent::Link(LinkStatus::Disconnected {
            peripheral: None,
            error: Some("link lost".into()),
        });
        assert_eq!(describe(&dropped), "Disconnected from peripheral: link lost");
    }
}
