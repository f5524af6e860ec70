pub mod alarm;
pub mod config;
pub mod daemon;
pub mod ring;

use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use wakeytalky_core::{AlarmController, Config, JsonFileStore, LogNotifier, TextVoice, TimerFired};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Local wall-clock time, the time base every alarm uses.
pub fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Parse `YYYY-MM-DDTHH:MM[:SS]`, or fall back to the current time.
pub fn parse_at(at: Option<&str>) -> Result<NaiveDateTime, String> {
    let Some(at) = at else {
        return Ok(now());
    };
    NaiveDateTime::parse_from_str(at, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(at, "%Y-%m-%dT%H:%M"))
        .map_err(|e| format!("invalid timestamp '{at}': {e}"))
}

/// Controller over the on-disk store, with state loaded as of `now`.
pub async fn open_controller(
    now: NaiveDateTime,
) -> Result<(AlarmController, UnboundedReceiver<TimerFired>), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let store = JsonFileStore::open(&config.storage.file_name)?;
    let (controller, timer_rx) = AlarmController::new(config, Arc::new(store), Arc::new(LogNotifier));
    let mut controller = controller.with_voice(Arc::new(TextVoice));
    // Recovered rings are logged by the controller.
    controller.load(now).await?;
    Ok((controller, timer_rx))
}

pub fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
